//! The transfer event loop: a single consumer that owns every session.
//!
//! All session state transitions and every completion callback run here.
//! Producers (RPC callbacks, the client and server façades) enqueue events
//! through the bounded work queue and never block: when the queue is full
//! the chunk is dropped and the protocol's retries recover it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use kestrel_rpc::{Result, Status};

use crate::chunk::{Chunk, ChunkType, ProtocolVersion};
use crate::config;
use crate::session::{
    Buffers, ChunkSink, CompletionFn, Session, SessionConfig, Side, Stream, TransferDir,
};
use crate::stream::{DynReader, DynWriter};

/// Worst-case encoding overhead of one data chunk, reserved out of the data
/// buffer when deriving `max_chunk_size`.
pub(crate) const CHUNK_OVERHEAD: usize = 64;

/// Which RPC stream a chunk travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    ClientRead,
    ClientWrite,
    ServerRead,
    ServerWrite,
}

impl Origin {
    pub(crate) fn client(dir: TransferDir) -> Self {
        match dir {
            TransferDir::Read => Self::ClientRead,
            TransferDir::Write => Self::ClientWrite,
        }
    }

    pub(crate) fn server(dir: TransferDir) -> Self {
        match dir {
            TransferDir::Read => Self::ServerRead,
            TransferDir::Write => Self::ServerWrite,
        }
    }

    fn side(self) -> Side {
        match self {
            Self::ClientRead | Self::ClientWrite => Side::Client,
            Self::ServerRead | Self::ServerWrite => Side::Server,
        }
    }

    fn dir(self) -> TransferDir {
        match self {
            Self::ClientRead | Self::ServerRead => TransferDir::Read,
            Self::ClientWrite | Self::ServerWrite => TransferDir::Write,
        }
    }
}

pub(crate) type ReadHandlerFn = Box<dyn FnMut() -> Result<DynReader> + Send>;
pub(crate) type WriteHandlerFn = Box<dyn FnMut() -> Result<DynWriter> + Send>;

pub(crate) struct NewClientTransfer {
    pub handle_id: u32,
    pub resource_id: u32,
    pub dir: TransferDir,
    pub version: ProtocolVersion,
    pub stream: Stream,
    pub sink: ChunkSink,
    pub on_completion: CompletionFn,
    pub config: SessionConfig,
}

pub(crate) enum Event {
    NewClientTransfer(Box<NewClientTransfer>),
    AttachServerStream {
        dir: TransferDir,
        sink: ChunkSink,
    },
    AddReadHandler {
        resource_id: u32,
        open: ReadHandlerFn,
    },
    AddWriteHandler {
        resource_id: u32,
        open: WriteHandlerFn,
    },
    ChunkReceived {
        origin: Origin,
        payload: Bytes,
    },
    CancelTransfer {
        handle_id: u32,
    },
    EndStream {
        origin: Origin,
        status: Status,
    },
    Shutdown,
}

/// Cheap handle used by the façades to feed the event loop.
#[derive(Clone)]
pub struct TransferThread {
    tx: mpsc::Sender<Event>,
    max_chunk_size: u32,
}

impl TransferThread {
    /// Creates the handle and its event loop.
    ///
    /// `data_buffer_size` fixes the staging storage and thereby the largest
    /// chunk this endpoint will ever send or request; spawn the returned
    /// loop with `tokio::spawn(event_loop.run())`.
    pub fn new(data_buffer_size: usize) -> (Self, TransferEventLoop) {
        assert!(
            data_buffer_size > CHUNK_OVERHEAD,
            "data buffer must exceed the per-chunk overhead of {CHUNK_OVERHEAD} bytes"
        );
        let max_chunk_size = (data_buffer_size - CHUNK_OVERHEAD) as u32;
        let (tx, rx) = mpsc::channel(config::queue_depth());
        let thread = Self { tx, max_chunk_size };
        let event_loop = TransferEventLoop {
            rx,
            sessions: (0..config::MAX_SESSIONS).map(|_| None).collect(),
            scheduled_epochs: vec![0; config::MAX_SESSIONS],
            timers: BinaryHeap::new(),
            bufs: Buffers::new(data_buffer_size),
            next_session_id: 1,
            read_handlers: HashMap::new(),
            write_handlers: HashMap::new(),
            server_read_sink: None,
            server_write_sink: None,
        };
        (thread, event_loop)
    }

    /// The largest data payload one chunk can carry.
    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    /// Stops the event loop; every live session completes with `Cancelled`.
    pub fn shutdown(&self) {
        let _ = self.tx.try_send(Event::Shutdown);
    }

    pub(crate) fn post(&self, event: Event) -> Result<()> {
        self.tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!("transfer work queue full; dropping event");
                Status::ResourceExhausted
            }
            mpsc::error::TrySendError::Closed(_) => Status::FailedPrecondition,
        })
    }
}

impl std::fmt::Debug for TransferThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferThread")
            .field("max_chunk_size", &self.max_chunk_size)
            .finish()
    }
}

enum Wake {
    Event(Option<Event>),
    Timer,
}

/// The single consumer. Owns the sessions, the staging buffers, and the
/// timer heap.
pub struct TransferEventLoop {
    rx: mpsc::Receiver<Event>,
    sessions: Vec<Option<Session>>,
    /// Last timer epoch pushed per slot; avoids duplicate heap entries.
    scheduled_epochs: Vec<u64>,
    timers: BinaryHeap<Reverse<(Instant, usize, u64)>>,
    bufs: Buffers,
    next_session_id: u32,
    read_handlers: HashMap<u32, ReadHandlerFn>,
    write_handlers: HashMap<u32, WriteHandlerFn>,
    server_read_sink: Option<ChunkSink>,
    server_write_sink: Option<ChunkSink>,
}

impl TransferEventLoop {
    /// Runs until `Shutdown` or every handle is dropped.
    pub async fn run(mut self) {
        tracing::debug!("transfer event loop running");
        loop {
            let wake = match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        event = self.rx.recv() => Wake::Event(event),
                        _ = tokio::time::sleep_until(deadline) => Wake::Timer,
                    }
                }
                None => Wake::Event(self.rx.recv().await),
            };
            match wake {
                Wake::Event(None) | Wake::Event(Some(Event::Shutdown)) => break,
                Wake::Event(Some(event)) => self.handle_event(event),
                Wake::Timer => self.fire_timers(),
            }
        }
        self.shutdown_sessions();
        tracing::debug!("transfer event loop stopped");
    }

    fn handle_event(&mut self, event: Event) {
        let now = Instant::now();
        match event {
            Event::NewClientTransfer(new) => self.start_client_transfer(*new, now),
            Event::AttachServerStream { dir, sink } => match dir {
                TransferDir::Read => self.server_read_sink = Some(sink),
                TransferDir::Write => self.server_write_sink = Some(sink),
            },
            Event::AddReadHandler { resource_id, open } => {
                self.read_handlers.insert(resource_id, open);
            }
            Event::AddWriteHandler { resource_id, open } => {
                self.write_handlers.insert(resource_id, open);
            }
            Event::ChunkReceived { origin, payload } => self.on_chunk(origin, payload, now),
            Event::CancelTransfer { handle_id } => self.cancel(handle_id),
            Event::EndStream { origin, status } => self.end_stream(origin, status),
            Event::Shutdown => unreachable!("handled by the run loop"),
        }
        self.sweep();
    }

    fn start_client_transfer(&mut self, new: NewClientTransfer, now: Instant) {
        let Some(slot) = self.sessions.iter().position(Option::is_none) else {
            tracing::warn!(
                handle_id = new.handle_id,
                "no free transfer session slot"
            );
            (new.on_completion)(Status::ResourceExhausted);
            return;
        };

        let session_id = match new.version {
            // Legacy sessions are identified by the resource itself.
            ProtocolVersion::Legacy => new.resource_id,
            ProtocolVersion::V2 => {
                let id = self.next_session_id;
                self.next_session_id = self.next_session_id.wrapping_add(1).max(1);
                id
            }
        };
        let mut session = Session::new_client(
            session_id,
            new.resource_id,
            new.dir,
            new.handle_id,
            new.version,
            new.stream,
            new.sink,
            new.on_completion,
            &new.config,
        );
        session.start(&mut self.bufs, now);
        self.sessions[slot] = Some(session);
    }

    fn on_chunk(&mut self, origin: Origin, payload: Bytes, now: Instant) {
        let chunk = match Chunk::decode(&payload) {
            Ok(chunk) => chunk,
            Err(status) => {
                tracing::warn!(?origin, %status, "dropping undecodable chunk");
                return;
            }
        };

        let slot = self.sessions.iter().position(|slot| {
            slot.as_ref().is_some_and(|session| {
                session.side == origin.side()
                    && session.dir == origin.dir()
                    && session.session_id == chunk.session_id
            })
        });

        match slot {
            Some(slot) => {
                let session = self.sessions[slot]
                    .as_mut()
                    .expect("slot position checked above");
                session.handle_chunk(&mut self.bufs, chunk, now);
            }
            None if origin.side() == Side::Server && chunk.chunk_type == ChunkType::Start => {
                self.open_server_session(origin, chunk, now);
            }
            None if chunk.chunk_type == ChunkType::Completion => {
                // The session is already gone; answer the retransmitted
                // completion so the peer can retire too.
                tracing::debug!(
                    session_id = chunk.session_id,
                    "acking completion for retired session"
                );
                let version = chunk
                    .protocol_version
                    .unwrap_or(ProtocolVersion::V2);
                let ack = Chunk::new(ChunkType::CompletionAck, chunk.session_id);
                self.send_detached(origin, &ack, version);
            }
            None => {
                tracing::debug!(
                    ?origin,
                    session_id = chunk.session_id,
                    chunk_type = ?chunk.chunk_type,
                    "chunk for unknown session; dropping"
                );
            }
        }
    }

    fn open_server_session(&mut self, origin: Origin, chunk: Chunk, now: Instant) {
        let dir = origin.dir();
        let Some(sink) = self.server_sink(dir) else {
            tracing::warn!(?origin, "no transfer stream attached; dropping Start");
            return;
        };

        let version = chunk
            .protocol_version
            .unwrap_or(ProtocolVersion::Legacy)
            .min(ProtocolVersion::LATEST);
        let resource_id = chunk.resource_id.unwrap_or(chunk.session_id);
        let session_id = match version {
            ProtocolVersion::Legacy => resource_id,
            ProtocolVersion::V2 => chunk.desired_session_id.unwrap_or(chunk.session_id),
        };

        let stream = match self.open_resource(dir, resource_id) {
            Ok(stream) => stream,
            Err(status) => {
                self.refuse_session(origin, session_id, version, status);
                return;
            }
        };

        let Some(slot) = self.sessions.iter().position(Option::is_none) else {
            self.refuse_session(origin, session_id, version, Status::ResourceExhausted);
            return;
        };

        let config = SessionConfig {
            timeout: config::DEFAULT_TIMEOUT,
            initial_chunk_timeout: config::DEFAULT_INITIAL_CHUNK_TIMEOUT,
            max_chunk_size: self.max_chunk_size(),
            max_window_size: self.max_chunk_size() * 4,
            extend_window_divisor: config::DEFAULT_EXTEND_WINDOW_DIVISOR,
            max_retries: config::DEFAULT_MAX_RETRIES,
            max_lifetime_retries: config::DEFAULT_MAX_LIFETIME_RETRIES,
        };
        tracing::debug!(
            session_id,
            resource_id,
            ?dir,
            ?version,
            "opening server transfer session"
        );
        let mut session =
            Session::new_server(session_id, resource_id, dir, version, stream, sink, &config);
        session.handle_chunk(&mut self.bufs, chunk, now);
        self.sessions[slot] = Some(session);
    }

    fn open_resource(&mut self, dir: TransferDir, resource_id: u32) -> Result<Stream> {
        match dir {
            TransferDir::Read => {
                let open = self
                    .read_handlers
                    .get_mut(&resource_id)
                    .ok_or(Status::NotFound)?;
                Ok(Stream::Source(open()?))
            }
            TransferDir::Write => {
                let open = self
                    .write_handlers
                    .get_mut(&resource_id)
                    .ok_or(Status::NotFound)?;
                Ok(Stream::Sink(open()?))
            }
        }
    }

    fn refuse_session(
        &mut self,
        origin: Origin,
        session_id: u32,
        version: ProtocolVersion,
        status: Status,
    ) {
        tracing::debug!(session_id, %status, "refusing transfer");
        let mut completion = Chunk::new(ChunkType::Completion, session_id);
        completion.status = Some(status);
        self.send_detached(origin, &completion, version);
    }

    /// Sends a chunk outside any session (refusals and stray-completion
    /// acks).
    fn send_detached(&mut self, origin: Origin, chunk: &Chunk, version: ProtocolVersion) {
        let sink = match origin {
            Origin::ServerRead => self.server_read_sink.clone(),
            Origin::ServerWrite => self.server_write_sink.clone(),
            Origin::ClientRead | Origin::ClientWrite => None,
        };
        let Some(sink) = sink else { return };
        if let Ok(len) = chunk.encode(version, &mut self.bufs.staging) {
            let _ = sink(&self.bufs.staging[..len]);
        }
    }

    fn server_sink(&self, dir: TransferDir) -> Option<ChunkSink> {
        match dir {
            TransferDir::Read => self.server_read_sink.clone(),
            TransferDir::Write => self.server_write_sink.clone(),
        }
    }

    fn max_chunk_size(&self) -> u32 {
        (self.bufs.staging.len() - CHUNK_OVERHEAD) as u32
    }

    fn cancel(&mut self, handle_id: u32) {
        let slot = self.sessions.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|session| session.side == Side::Client && session.handle_id == handle_id)
        });
        match slot {
            Some(slot) => {
                let session = self.sessions[slot]
                    .as_mut()
                    .expect("slot position checked above");
                tracing::debug!(handle_id, session_id = session.session_id, "cancelling transfer");
                session.terminate(&mut self.bufs, Status::Cancelled, true);
            }
            None => tracing::debug!(handle_id, "cancel for unknown transfer; ignoring"),
        }
    }

    fn end_stream(&mut self, origin: Origin, status: Status) {
        tracing::debug!(?origin, %status, "transfer stream ended");
        match origin {
            Origin::ServerRead => self.server_read_sink = None,
            Origin::ServerWrite => self.server_write_sink = None,
            _ => {}
        }
        for slot in &mut self.sessions {
            if let Some(session) = slot {
                if session.side == origin.side() && session.dir == origin.dir() {
                    session.terminate(&mut self.bufs, status, false);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, slot, epoch))) = self.timers.peek().copied() {
            if self.timer_valid(deadline, slot, epoch) {
                return Some(deadline);
            }
            self.timers.pop();
        }
        None
    }

    fn timer_valid(&self, deadline: Instant, slot: usize, epoch: u64) -> bool {
        self.sessions[slot].as_ref().is_some_and(|session| {
            session.timer_epoch == epoch && session.deadline == Some(deadline)
        })
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((deadline, slot, epoch))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            if !self.timer_valid(deadline, slot, epoch) {
                continue;
            }
            let session = self.sessions[slot]
                .as_mut()
                .expect("validity checked above");
            session.deadline = None;
            session.handle_timeout(&mut self.bufs, now);
        }
        self.sweep();
    }

    /// Frees terminated sessions and schedules freshly armed deadlines.
    fn sweep(&mut self) {
        for slot in 0..self.sessions.len() {
            let Some(session) = &self.sessions[slot] else {
                continue;
            };
            if session.is_terminated() {
                self.sessions[slot] = None;
                self.scheduled_epochs[slot] = 0;
                continue;
            }
            if let Some(deadline) = session.deadline {
                if self.scheduled_epochs[slot] != session.timer_epoch {
                    self.scheduled_epochs[slot] = session.timer_epoch;
                    self.timers
                        .push(Reverse((deadline, slot, session.timer_epoch)));
                }
            }
        }
    }

    fn shutdown_sessions(&mut self) {
        for slot in &mut self.sessions {
            if let Some(session) = slot {
                session.terminate(&mut self.bufs, Status::Cancelled, true);
            }
            *slot = None;
        }
    }
}

impl std::fmt::Debug for TransferEventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = self.sessions.iter().flatten().count();
        f.debug_struct("TransferEventLoop")
            .field("sessions", &live)
            .finish_non_exhaustive()
    }
}
