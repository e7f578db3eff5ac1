//! Transfer server façade.
//!
//! Exposes resource handlers and the RPC service definition. Inbound chunks
//! are funnelled to the transfer event loop, which owns the server-side
//! sessions; the RPC calls themselves only carry bytes.

use std::sync::Arc;

use bytes::Bytes;

use kestrel_rpc::{Result, ServerCall, Service, Status};

use crate::config;
use crate::session::{ChunkSink, TransferDir};
use crate::stream::{DynReader, DynWriter};
use crate::thread::{Event, Origin, TransferThread};

/// The server half of the transfer protocol.
pub struct Server {
    thread: TransferThread,
}

impl Server {
    pub fn new(thread: TransferThread) -> Self {
        Self { thread }
    }

    /// Registers the opener for read transfers of `resource_id`. The opener
    /// runs on the transfer event loop each time a session starts.
    pub fn register_read_handler(
        &self,
        resource_id: u32,
        open: impl FnMut() -> Result<DynReader> + Send + 'static,
    ) -> Result<()> {
        self.thread.post(Event::AddReadHandler {
            resource_id,
            open: Box::new(open),
        })
    }

    /// Registers the opener for write transfers of `resource_id`.
    pub fn register_write_handler(
        &self,
        resource_id: u32,
        open: impl FnMut() -> Result<DynWriter> + Send + 'static,
    ) -> Result<()> {
        self.thread.post(Event::AddWriteHandler {
            resource_id,
            open: Box::new(open),
        })
    }

    /// Builds the RPC service carrying the transfer protocol. Register the
    /// result with a [`kestrel_rpc::Server`].
    pub fn service(&self) -> Service {
        Service::new(config::TRANSFER_SERVICE_ID)
            .bidi(
                config::READ_METHOD_ID,
                stream_handler(self.thread.clone(), TransferDir::Read),
            )
            .bidi(
                config::WRITE_METHOD_ID,
                stream_handler(self.thread.clone(), TransferDir::Write),
            )
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

/// Method handler for one direction's transfer stream.
///
/// Attaches the call as the event loop's chunk sink for that direction and
/// forwards every inbound chunk. The call stays open for the lifetime of
/// the stream; sessions come and go on top of it.
fn stream_handler(
    thread: TransferThread,
    dir: TransferDir,
) -> impl FnMut(ServerCall, &[u8]) + Send + 'static {
    move |call, _request| {
        let origin = Origin::server(dir);
        tracing::debug!(?dir, channel_id = call.channel_id(), "transfer stream opened");

        let call = Arc::new(call);
        let sink: ChunkSink = {
            let call = Arc::clone(&call);
            Arc::new(move |raw: &[u8]| call.send_stream(raw))
        };

        let chunk_thread = thread.clone();
        let _ = call.set_on_next(move |payload| {
            let _ = chunk_thread.post(Event::ChunkReceived {
                origin,
                payload: Bytes::copy_from_slice(payload),
            });
        });
        let error_thread = thread.clone();
        let _ = call.set_on_error(move |status| {
            let _ = error_thread.post(Event::EndStream {
                origin,
                status: if status.is_ok() {
                    Status::Internal
                } else {
                    status
                },
            });
        });

        let _ = thread.post(Event::AttachServerStream { dir, sink });
    }
}
