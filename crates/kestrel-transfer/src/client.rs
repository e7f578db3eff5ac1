//! Transfer client façade.
//!
//! Translates `read`/`write`/`cancel_transfer` into transfer-thread events
//! and owns the two streaming RPCs that carry chunks. Nothing here blocks;
//! every call enqueues work and returns.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use kestrel_rpc::{CallHandle, Callbacks, Result, Status};

use crate::chunk::ProtocolVersion;
use crate::config;
use crate::session::{ChunkSink, SessionConfig, Stream, TransferDir};
use crate::stream::{DynReader, DynWriter};
use crate::thread::{Event, NewClientTransfer, Origin, TransferThread};

/// Opaque identity of one user-visible transfer.
///
/// The default handle is unassigned and cancels nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TransferHandle(u32);

impl TransferHandle {
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn is_unassigned(self) -> bool {
        self.0 == 0
    }
}

struct Knobs {
    max_window_size: u32,
    extend_window_divisor: u32,
    max_retries: u32,
    max_lifetime_retries: u32,
    timeout: Duration,
    initial_chunk_timeout: Duration,
    default_protocol_version: ProtocolVersion,
}

#[derive(Default)]
struct RpcStreams {
    read: Option<Arc<CallHandle>>,
    write: Option<Arc<CallHandle>>,
}

/// A transfer client bound to one RPC client and channel.
pub struct Client {
    rpc: Arc<kestrel_rpc::Client>,
    channel_id: u32,
    thread: TransferThread,
    next_handle_id: AtomicU32,
    knobs: Mutex<Knobs>,
    streams: Arc<Mutex<RpcStreams>>,
}

impl Client {
    /// Creates a transfer client.
    ///
    /// `max_bytes_to_receive` sets the receive window; zero means one chunk
    /// (the transfer thread's `max_chunk_size`). Larger windows pipeline
    /// better but amplify what a lost packet costs to retransmit.
    pub fn new(
        rpc: Arc<kestrel_rpc::Client>,
        channel_id: u32,
        thread: TransferThread,
        max_bytes_to_receive: u32,
    ) -> Self {
        let max_window_size = if max_bytes_to_receive > 0 {
            max_bytes_to_receive
        } else {
            thread.max_chunk_size()
        };
        Self {
            rpc,
            channel_id,
            thread,
            next_handle_id: AtomicU32::new(1),
            knobs: Mutex::new(Knobs {
                max_window_size,
                extend_window_divisor: config::DEFAULT_EXTEND_WINDOW_DIVISOR,
                max_retries: config::DEFAULT_MAX_RETRIES,
                max_lifetime_retries: config::DEFAULT_MAX_LIFETIME_RETRIES,
                timeout: config::DEFAULT_TIMEOUT,
                initial_chunk_timeout: config::DEFAULT_INITIAL_CHUNK_TIMEOUT,
                default_protocol_version: ProtocolVersion::LATEST,
            }),
            streams: Arc::default(),
        }
    }

    /// Begins reading `resource_id` into `output` using the default version
    /// and timeouts. The completion callback fires exactly once with the
    /// overall status.
    pub fn read(
        &self,
        resource_id: u32,
        output: DynWriter,
        on_completion: impl FnOnce(Status) + Send + 'static,
    ) -> Result<TransferHandle> {
        let (version, timeout, initial) = self.defaults();
        self.read_with(resource_id, output, on_completion, version, timeout, initial)
    }

    /// Begins a read with an explicit protocol version and timeouts.
    pub fn read_with(
        &self,
        resource_id: u32,
        output: DynWriter,
        on_completion: impl FnOnce(Status) + Send + 'static,
        version: ProtocolVersion,
        timeout: Duration,
        initial_chunk_timeout: Duration,
    ) -> Result<TransferHandle> {
        self.start(
            resource_id,
            TransferDir::Read,
            Stream::Sink(output),
            Box::new(on_completion),
            version,
            timeout,
            initial_chunk_timeout,
        )
    }

    /// Begins writing `input` to `resource_id` using the default version and
    /// timeouts. The input must support seek: the server may rewind the
    /// window after loss.
    pub fn write(
        &self,
        resource_id: u32,
        input: DynReader,
        on_completion: impl FnOnce(Status) + Send + 'static,
    ) -> Result<TransferHandle> {
        let (version, timeout, initial) = self.defaults();
        self.write_with(resource_id, input, on_completion, version, timeout, initial)
    }

    /// Begins a write with an explicit protocol version and timeouts.
    pub fn write_with(
        &self,
        resource_id: u32,
        input: DynReader,
        on_completion: impl FnOnce(Status) + Send + 'static,
        version: ProtocolVersion,
        timeout: Duration,
        initial_chunk_timeout: Duration,
    ) -> Result<TransferHandle> {
        self.start(
            resource_id,
            TransferDir::Write,
            Stream::Source(input),
            Box::new(on_completion),
            version,
            timeout,
            initial_chunk_timeout,
        )
    }

    /// Terminates an ongoing transfer. Unassigned handles are a no-op.
    pub fn cancel_transfer(&self, handle: TransferHandle) {
        if handle.is_unassigned() {
            return;
        }
        let _ = self.thread.post(Event::CancelTransfer {
            handle_id: handle.0,
        });
    }

    pub fn set_extend_window_divisor(&self, extend_window_divisor: u32) -> Result<()> {
        if extend_window_divisor <= 1 {
            return Err(Status::InvalidArgument);
        }
        self.knobs.lock().extend_window_divisor = extend_window_divisor;
        Ok(())
    }

    pub fn set_max_retries(&self, max_retries: u32) -> Result<()> {
        let mut knobs = self.knobs.lock();
        if max_retries < 1 || max_retries > knobs.max_lifetime_retries {
            return Err(Status::InvalidArgument);
        }
        knobs.max_retries = max_retries;
        Ok(())
    }

    pub fn set_max_lifetime_retries(&self, max_lifetime_retries: u32) -> Result<()> {
        let mut knobs = self.knobs.lock();
        if max_lifetime_retries < knobs.max_retries {
            return Err(Status::InvalidArgument);
        }
        knobs.max_lifetime_retries = max_lifetime_retries;
        Ok(())
    }

    pub fn set_protocol_version(&self, version: ProtocolVersion) {
        self.knobs.lock().default_protocol_version = version;
    }

    fn defaults(&self) -> (ProtocolVersion, Duration, Duration) {
        let knobs = self.knobs.lock();
        (
            knobs.default_protocol_version,
            knobs.timeout,
            knobs.initial_chunk_timeout,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn start(
        &self,
        resource_id: u32,
        dir: TransferDir,
        stream: Stream,
        on_completion: Box<dyn FnOnce(Status) + Send>,
        version: ProtocolVersion,
        timeout: Duration,
        initial_chunk_timeout: Duration,
    ) -> Result<TransferHandle> {
        let sink = self.ensure_stream(dir)?;
        let handle_id = self.next_handle_id();

        let config = {
            let knobs = self.knobs.lock();
            SessionConfig {
                timeout,
                initial_chunk_timeout,
                max_chunk_size: self.thread.max_chunk_size(),
                max_window_size: knobs.max_window_size,
                extend_window_divisor: knobs.extend_window_divisor,
                max_retries: knobs.max_retries,
                max_lifetime_retries: knobs.max_lifetime_retries,
            }
        };

        self.thread
            .post(Event::NewClientTransfer(Box::new(NewClientTransfer {
                handle_id,
                resource_id,
                dir,
                version,
                stream,
                sink,
                on_completion,
                config,
            })))?;
        Ok(TransferHandle::new(handle_id))
    }

    fn next_handle_id(&self) -> u32 {
        // Zero is the unassigned handle.
        loop {
            let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Opens the direction's transfer RPC on first use and returns its
    /// chunk sink. Every chunk the server streams back is forwarded to the
    /// event loop; a failed stream tears down that direction's sessions.
    fn ensure_stream(&self, dir: TransferDir) -> Result<ChunkSink> {
        let mut streams = self.streams.lock();
        let slot = match dir {
            TransferDir::Read => &mut streams.read,
            TransferDir::Write => &mut streams.write,
        };
        if slot.is_none() {
            let origin = Origin::client(dir);
            let on_next_thread = self.thread.clone();
            let end_thread = self.thread.clone();
            let err_thread = self.thread.clone();
            let end_streams = Arc::clone(&self.streams);
            let err_streams = Arc::clone(&self.streams);

            let method_id = match dir {
                TransferDir::Read => config::READ_METHOD_ID,
                TransferDir::Write => config::WRITE_METHOD_ID,
            };
            let callbacks = Callbacks::default()
                .on_next(move |payload| {
                    let _ = on_next_thread.post(Event::ChunkReceived {
                        origin,
                        payload: Bytes::copy_from_slice(payload),
                    });
                })
                .on_completed(move |_, status| {
                    clear_stream(&end_streams, dir);
                    let _ = end_thread.post(Event::EndStream {
                        origin,
                        status: if status.is_ok() {
                            Status::Internal
                        } else {
                            status
                        },
                    });
                })
                .on_error(move |status| {
                    clear_stream(&err_streams, dir);
                    let _ = err_thread.post(Event::EndStream { origin, status });
                });

            let call = self.rpc.start_bidi(
                self.channel_id,
                config::TRANSFER_SERVICE_ID,
                method_id,
                &[],
                callbacks,
            )?;
            *slot = Some(Arc::new(call));
            tracing::debug!(?dir, "opened transfer stream");
        }

        let call = Arc::clone(slot.as_ref().expect("slot populated above"));
        Ok(Arc::new(move |raw: &[u8]| call.write(raw)) as ChunkSink)
    }
}

fn clear_stream(streams: &Arc<Mutex<RpcStreams>>, dir: TransferDir) {
    let mut streams = streams.lock();
    match dir {
        TransferDir::Read => streams.read = None,
        TransferDir::Write => streams.write = None,
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}
