//! The windowed transfer session state machine.
//!
//! One `Session` covers both directions and both sides: the receiver half
//! (client read, server write) advertises windows and sinks data, the
//! transmitter half (client write, server read) streams data into the
//! advertised window. All mutation happens on the transfer event loop.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use kestrel_rpc::{Result, Status};

use crate::chunk::{Chunk, ChunkType, ProtocolVersion};
use crate::stream::{DynReader, DynWriter};

/// Sends one encoded chunk towards the peer over the session's RPC stream.
pub(crate) type ChunkSink = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

pub(crate) type CompletionFn = Box<dyn FnOnce(Status) + Send>;

/// Direction of the resource data: `Read` moves server data to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferDir {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Client: `Start` sent, waiting for the server's first move.
    Initiating,
    /// Handshake underway or finished, first data/parameters outstanding.
    Negotiating,
    /// Receiver half accepting data.
    Receiving,
    /// Transmitter half streaming the advertised window.
    Transmitting,
    /// `Completion` sent, waiting for the ack.
    Completing,
    Terminated,
}

/// The session's data endpoint.
pub(crate) enum Stream {
    /// Receiver half sinks into a writer.
    Sink(DynWriter),
    /// Transmitter half sources from a seekable reader.
    Source(DynReader),
}

/// The event loop's fixed staging storage, shared by every session it owns.
pub(crate) struct Buffers {
    /// Chunk encode target; its size bounds `max_chunk_size`.
    pub(crate) staging: Vec<u8>,
    /// Source read scratch for the transmit path.
    pub(crate) scratch: Vec<u8>,
}

impl Buffers {
    pub(crate) fn new(data_buffer_size: usize) -> Self {
        Self {
            staging: vec![0; data_buffer_size],
            scratch: vec![0; data_buffer_size],
        }
    }
}

pub(crate) struct SessionConfig {
    pub timeout: Duration,
    pub initial_chunk_timeout: Duration,
    pub max_chunk_size: u32,
    pub max_window_size: u32,
    pub extend_window_divisor: u32,
    pub max_retries: u32,
    pub max_lifetime_retries: u32,
}

pub(crate) struct Session {
    pub(crate) session_id: u32,
    pub(crate) resource_id: u32,
    pub(crate) side: Side,
    pub(crate) dir: TransferDir,
    /// Client session handle; zero on server sessions.
    pub(crate) handle_id: u32,

    desired_version: ProtocolVersion,
    version: ProtocolVersion,
    state: SessionState,
    stream: Stream,
    sink: ChunkSink,
    on_completion: Option<CompletionFn>,
    final_status: Option<Status>,

    window_start_offset: u64,
    window_end_offset: u64,
    /// Transmitter: the next byte to send.
    next_offset: u64,
    /// Transmitter: the source ran dry at `next_offset`.
    eof_reached: bool,
    max_chunk_size: u32,
    max_window_size: u32,
    extend_window_divisor: u32,

    retries: u32,
    max_retries: u32,
    lifetime_retries: u32,
    max_lifetime_retries: u32,
    timeout: Duration,
    initial_chunk_timeout: Duration,
    /// Armed inactivity deadline; the event loop owns the timer heap.
    pub(crate) deadline: Option<Instant>,
    /// Bumped on every re-arm so stale heap entries can be skipped.
    pub(crate) timer_epoch: u64,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_client(
        session_id: u32,
        resource_id: u32,
        dir: TransferDir,
        handle_id: u32,
        version: ProtocolVersion,
        stream: Stream,
        sink: ChunkSink,
        on_completion: CompletionFn,
        config: &SessionConfig,
    ) -> Self {
        Self::new(
            session_id,
            resource_id,
            Side::Client,
            dir,
            handle_id,
            version,
            stream,
            sink,
            Some(on_completion),
            config,
        )
    }

    pub(crate) fn new_server(
        session_id: u32,
        resource_id: u32,
        dir: TransferDir,
        version: ProtocolVersion,
        stream: Stream,
        sink: ChunkSink,
        config: &SessionConfig,
    ) -> Self {
        Self::new(
            session_id,
            resource_id,
            Side::Server,
            dir,
            0,
            version,
            stream,
            sink,
            None,
            config,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        session_id: u32,
        resource_id: u32,
        side: Side,
        dir: TransferDir,
        handle_id: u32,
        version: ProtocolVersion,
        stream: Stream,
        sink: ChunkSink,
        on_completion: Option<CompletionFn>,
        config: &SessionConfig,
    ) -> Self {
        debug_assert!(config.extend_window_divisor > 1);
        let receiver = matches!(
            (side, dir),
            (Side::Client, TransferDir::Read) | (Side::Server, TransferDir::Write)
        );
        Self {
            session_id,
            resource_id,
            side,
            dir,
            handle_id,
            desired_version: version,
            version,
            state: SessionState::Initiating,
            stream,
            sink,
            on_completion,
            final_status: None,
            window_start_offset: 0,
            window_end_offset: if receiver {
                u64::from(config.max_window_size)
            } else {
                0
            },
            next_offset: 0,
            eof_reached: false,
            max_chunk_size: config.max_chunk_size,
            max_window_size: config.max_window_size,
            extend_window_divisor: config.extend_window_divisor,
            retries: 0,
            max_retries: config.max_retries,
            lifetime_retries: 0,
            max_lifetime_retries: config.max_lifetime_retries,
            timeout: config.timeout,
            initial_chunk_timeout: config.initial_chunk_timeout,
            deadline: None,
            timer_epoch: 0,
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// True when this is the receiver half of the transfer.
    fn is_receiver(&self) -> bool {
        matches!(
            (self.side, self.dir),
            (Side::Client, TransferDir::Read) | (Side::Server, TransferDir::Write)
        )
    }

    // ------------------------------------------------------------------
    // Outbound

    fn send(&mut self, bufs: &mut Buffers, chunk: &Chunk) -> Result<()> {
        let len = chunk.encode(self.version, &mut bufs.staging)?;
        (self.sink)(&bufs.staging[..len]).inspect_err(|status| {
            tracing::debug!(
                session_id = self.session_id,
                %status,
                "chunk send failed"
            );
        })
    }

    /// Sends, or retires the session when the RPC stream is gone. Returns
    /// whether the session is still alive.
    fn send_or_die(&mut self, bufs: &mut Buffers, chunk: &Chunk) -> bool {
        match self.send(bufs, chunk) {
            Ok(()) => true,
            Err(status) => {
                // Nothing left to notify the peer on.
                self.finish(status);
                false
            }
        }
    }

    /// Client entry point: sends the opening chunk and arms the handshake
    /// timeout.
    pub(crate) fn start(&mut self, bufs: &mut Buffers, now: Instant) {
        debug_assert_eq!(self.side, Side::Client);
        tracing::debug!(
            session_id = self.session_id,
            resource_id = self.resource_id,
            dir = ?self.dir,
            version = ?self.desired_version,
            "starting transfer"
        );
        if self.send_or_die(bufs, &self.start_chunk()) {
            self.arm(now, self.initial_chunk_timeout);
        }
    }

    fn start_chunk(&self) -> Chunk {
        let mut chunk = Chunk::new(ChunkType::Start, self.session_id);
        chunk.resource_id = Some(self.resource_id);
        match self.desired_version {
            ProtocolVersion::Legacy => {
                // Legacy has no handshake; a read's opening chunk already
                // carries the first window.
                if self.dir == TransferDir::Read {
                    chunk.window_end_offset = u64::from(self.max_window_size);
                    chunk.max_chunk_size = Some(self.max_chunk_size);
                }
            }
            ProtocolVersion::V2 => {
                chunk.desired_session_id = Some(self.session_id);
                chunk.protocol_version = Some(self.desired_version);
            }
        }
        chunk
    }

    fn parameters_chunk(&self, kind: ChunkType) -> Chunk {
        debug_assert!(kind.is_parameters());
        let mut chunk = Chunk::new(kind, self.session_id);
        chunk.offset = self.window_start_offset;
        chunk.window_end_offset = self.window_end_offset;
        chunk.max_chunk_size = Some(self.max_chunk_size);
        chunk
    }

    fn start_ack_chunk(&self) -> Chunk {
        let mut chunk = Chunk::new(ChunkType::StartAck, self.session_id);
        chunk.resource_id = Some(self.resource_id);
        chunk.protocol_version = Some(self.version);
        chunk
    }

    fn completion_chunk(&self, status: Status) -> Chunk {
        let mut chunk = Chunk::new(ChunkType::Completion, self.session_id);
        chunk.status = Some(status);
        // The final offset lets the receiver detect a completion that
        // overtook lost data.
        chunk.offset = if self.is_receiver() {
            self.window_start_offset
        } else {
            self.next_offset
        };
        chunk
    }

    // ------------------------------------------------------------------
    // Inbound

    pub(crate) fn handle_chunk(&mut self, bufs: &mut Buffers, chunk: Chunk, now: Instant) {
        if self.state == SessionState::Terminated {
            return;
        }
        match chunk.chunk_type {
            ChunkType::Start => self.on_start(bufs, chunk, now),
            ChunkType::StartAck => self.on_start_ack(bufs, chunk, now),
            ChunkType::StartAckConfirmation => self.on_start_ack_confirmation(bufs, now),
            ChunkType::Data => self.on_data(bufs, chunk, now),
            ChunkType::ParametersRetransmit | ChunkType::ParametersContinue => {
                self.on_parameters(bufs, chunk, now)
            }
            ChunkType::Completion => self.on_peer_completion(bufs, chunk, now),
            ChunkType::CompletionAck => self.on_completion_ack(),
        }
    }

    /// A duplicate `Start` for an existing session: the opener lost our
    /// reply, so repeat it.
    fn on_start(&mut self, bufs: &mut Buffers, chunk: Chunk, now: Instant) {
        if self.side != Side::Server {
            tracing::warn!(session_id = self.session_id, "client got a Start chunk; dropping");
            return;
        }
        match self.version {
            ProtocolVersion::V2 => {
                if self.send_or_die(bufs, &self.start_ack_chunk()) {
                    self.arm(now, self.timeout);
                }
            }
            ProtocolVersion::Legacy => self.accept_legacy_open(bufs, chunk, now),
        }
    }

    /// Legacy open (first or repeated): the chunk itself carries the first
    /// window for reads.
    pub(crate) fn accept_legacy_open(&mut self, bufs: &mut Buffers, chunk: Chunk, now: Instant) {
        debug_assert_eq!(self.side, Side::Server);
        match self.dir {
            TransferDir::Read => {
                // Treat the embedded window like a Parameters chunk.
                let mut params = chunk;
                params.chunk_type = ChunkType::ParametersRetransmit;
                self.on_parameters(bufs, params, now);
            }
            TransferDir::Write => {
                self.state = SessionState::Receiving;
                if self.send_or_die(
                    bufs,
                    &self.parameters_chunk(ChunkType::ParametersRetransmit),
                ) {
                    self.arm(now, self.timeout);
                }
            }
        }
    }

    /// Server acknowledged our open; pin the negotiated version.
    fn on_start_ack(&mut self, bufs: &mut Buffers, chunk: Chunk, now: Instant) {
        if self.side != Side::Client
            || !matches!(
                self.state,
                SessionState::Initiating | SessionState::Negotiating
            )
        {
            return;
        }

        let negotiated = chunk
            .protocol_version
            .unwrap_or(ProtocolVersion::Legacy)
            .min(self.desired_version);
        self.version = negotiated;
        if chunk.session_id != 0 {
            self.session_id = chunk.session_id;
        }
        tracing::debug!(
            session_id = self.session_id,
            version = ?negotiated,
            "transfer handshake acknowledged"
        );

        if negotiated >= ProtocolVersion::V2 {
            let mut confirmation = Chunk::new(ChunkType::StartAckConfirmation, self.session_id);
            confirmation.protocol_version = Some(negotiated);
            if !self.send_or_die(bufs, &confirmation) {
                return;
            }
        }

        self.state = SessionState::Negotiating;
        self.retries = 0;
        match self.dir {
            TransferDir::Read => {
                if self.send_or_die(
                    bufs,
                    &self.parameters_chunk(ChunkType::ParametersRetransmit),
                ) {
                    self.arm(now, self.timeout);
                }
            }
            TransferDir::Write => self.arm(now, self.timeout),
        }
    }

    fn on_start_ack_confirmation(&mut self, bufs: &mut Buffers, now: Instant) {
        if self.side != Side::Server || self.dir != TransferDir::Write {
            // Read transmitters start on the client's Parameters instead.
            return;
        }
        if !matches!(
            self.state,
            SessionState::Initiating | SessionState::Negotiating
        ) {
            return;
        }
        self.state = SessionState::Receiving;
        if self.send_or_die(
            bufs,
            &self.parameters_chunk(ChunkType::ParametersRetransmit),
        ) {
            self.arm(now, self.timeout);
        }
    }

    /// Receiver half: in-order data advances the window, anything else is
    /// discarded (duplicates silently, gaps with a re-anchor).
    fn on_data(&mut self, bufs: &mut Buffers, chunk: Chunk, now: Instant) {
        if !self.is_receiver() {
            tracing::warn!(session_id = self.session_id, "transmitter got a Data chunk");
            return;
        }
        if self.state == SessionState::Completing {
            // Already decided; late data is a duplicate tail.
            return;
        }
        self.state = SessionState::Receiving;

        if chunk.offset == self.window_start_offset {
            let Stream::Sink(writer) = &mut self.stream else {
                unreachable!("receiver sessions hold a sink");
            };
            if let Err(err) = writer.write_all(&chunk.data) {
                tracing::warn!(
                    session_id = self.session_id,
                    error = %err,
                    "writer rejected transfer data"
                );
                self.terminate(bufs, Status::DataLoss, true);
                return;
            }
            self.window_start_offset += chunk.data.len() as u64;
            self.retries = 0;

            if chunk.remaining_bytes == Some(0) {
                // Transmitter is done; decide the transfer.
                self.complete(bufs, Status::Ok, now);
                return;
            }

            let remaining = self
                .window_end_offset
                .saturating_sub(self.window_start_offset);
            if remaining <= u64::from(self.max_window_size / self.extend_window_divisor) {
                self.window_end_offset =
                    self.window_start_offset + u64::from(self.max_window_size);
                if !self.send_or_die(
                    bufs,
                    &self.parameters_chunk(ChunkType::ParametersContinue),
                ) {
                    return;
                }
            }
            self.arm(now, self.timeout);
        } else if chunk.offset < self.window_start_offset {
            tracing::debug!(
                session_id = self.session_id,
                offset = chunk.offset,
                expected = self.window_start_offset,
                "duplicate data chunk; discarding"
            );
        } else {
            tracing::debug!(
                session_id = self.session_id,
                offset = chunk.offset,
                expected = self.window_start_offset,
                "out-of-order data chunk; re-anchoring transmitter"
            );
            if !self.count_retry(bufs) {
                return;
            }
            if self.send_or_die(
                bufs,
                &self.parameters_chunk(ChunkType::ParametersRetransmit),
            ) {
                self.arm(now, self.timeout);
            }
        }
    }

    /// Transmitter half: a Parameters chunk replaces the window and may
    /// rewind the source.
    fn on_parameters(&mut self, bufs: &mut Buffers, chunk: Chunk, now: Instant) {
        if self.is_receiver() {
            tracing::warn!(session_id = self.session_id, "receiver got a Parameters chunk");
            return;
        }
        if self.state == SessionState::Completing {
            if chunk.chunk_type == ChunkType::ParametersRetransmit {
                // The receiver is missing data our completion overtook;
                // reopen the transmission.
                self.state = SessionState::Transmitting;
            } else {
                // The peer has not seen our completion yet; resend it.
                let completion = self.completion_chunk(self.final_status.unwrap_or(Status::Ok));
                if self.send_or_die(bufs, &completion) {
                    self.arm(now, self.timeout);
                }
                return;
            }
        }

        if chunk.chunk_type == ChunkType::ParametersRetransmit && chunk.offset != self.next_offset
        {
            if !self.rewind_source(bufs, chunk.offset) {
                return;
            }
        }

        self.window_start_offset = chunk.offset;
        self.window_end_offset = chunk.window_end_offset;
        if let Some(peer_max) = chunk.max_chunk_size {
            self.max_chunk_size = self.max_chunk_size.min(peer_max);
        }
        self.retries = 0;
        self.state = SessionState::Transmitting;
        self.transmit_window(bufs, now);
    }

    fn rewind_source(&mut self, bufs: &mut Buffers, offset: u64) -> bool {
        let Stream::Source(reader) = &mut self.stream else {
            unreachable!("transmitter sessions hold a source");
        };
        if let Err(err) = reader.seek(SeekFrom::Start(offset)) {
            tracing::warn!(
                session_id = self.session_id,
                offset,
                error = %err,
                "source cannot rewind"
            );
            self.terminate(bufs, Status::DataLoss, true);
            return false;
        }
        self.next_offset = offset;
        self.eof_reached = false;
        true
    }

    /// Streams data until the window closes or the source runs dry.
    fn transmit_window(&mut self, bufs: &mut Buffers, now: Instant) {
        while self.next_offset < self.window_end_offset {
            let budget = (self.window_end_offset - self.next_offset)
                .min(u64::from(self.max_chunk_size))
                .min(bufs.scratch.len() as u64) as usize;
            let Stream::Source(reader) = &mut self.stream else {
                unreachable!("transmitter sessions hold a source");
            };
            let filled = match read_chunk(reader, &mut bufs.scratch[..budget]) {
                Ok(filled) => filled,
                Err(err) => {
                    tracing::warn!(
                        session_id = self.session_id,
                        error = %err,
                        "source read failed"
                    );
                    self.terminate(bufs, Status::DataLoss, true);
                    return;
                }
            };
            if filled == 0 {
                self.eof_reached = true;
                self.finish_transmission(bufs, now);
                return;
            }

            let mut data = Chunk::new(ChunkType::Data, self.session_id);
            data.offset = self.next_offset;
            data.data = bytes::Bytes::copy_from_slice(&bufs.scratch[..filled]);
            if !self.send_or_die(bufs, &data) {
                return;
            }
            self.next_offset += filled as u64;
        }
        // Window exhausted; the receiver extends it or completes.
        self.arm(now, self.timeout);
    }

    /// The source hit end-of-data.
    fn finish_transmission(&mut self, bufs: &mut Buffers, now: Instant) {
        match self.side {
            // A serving read decides the transfer itself.
            Side::Server => self.complete(bufs, Status::Ok, now),
            // A writing client announces end-of-data and lets the server
            // decide.
            Side::Client => {
                let mut last = Chunk::new(ChunkType::Data, self.session_id);
                last.offset = self.next_offset;
                last.remaining_bytes = Some(0);
                if self.send_or_die(bufs, &last) {
                    self.arm(now, self.timeout);
                }
            }
        }
    }

    /// The peer decided the transfer.
    fn on_peer_completion(&mut self, bufs: &mut Buffers, chunk: Chunk, now: Instant) {
        let peer_status = chunk.status.unwrap_or(Status::Ok);
        if self.is_receiver()
            && peer_status.is_ok()
            && self.final_status.is_none()
            && chunk.offset > self.window_start_offset
        {
            // A successful completion that claims more bytes than we hold:
            // the tail was lost in flight. Demand it before accepting.
            tracing::debug!(
                session_id = self.session_id,
                have = self.window_start_offset,
                claimed = chunk.offset,
                "completion overtook lost data; re-anchoring"
            );
            if !self.count_retry(bufs) {
                return;
            }
            if self.send_or_die(
                bufs,
                &self.parameters_chunk(ChunkType::ParametersRetransmit),
            ) {
                self.arm(now, self.timeout);
            }
            return;
        }

        if self.version >= ProtocolVersion::V2 {
            let ack = Chunk::new(ChunkType::CompletionAck, self.session_id);
            let _ = self.send(bufs, &ack);
        }
        // If both sides decided concurrently, the first decision (ours)
        // wins; the ack above still answers the peer.
        let status = self.final_status.unwrap_or(peer_status);
        self.finish(status);
    }

    fn on_completion_ack(&mut self) {
        if self.state != SessionState::Completing {
            tracing::debug!(session_id = self.session_id, "stray completion ack");
            return;
        }
        let status = self.final_status.unwrap_or(Status::Ok);
        self.finish(status);
    }

    // ------------------------------------------------------------------
    // Timers and termination

    pub(crate) fn handle_timeout(&mut self, bufs: &mut Buffers, now: Instant) {
        if self.state == SessionState::Terminated {
            return;
        }
        if !self.count_retry(bufs) {
            return;
        }
        tracing::debug!(
            session_id = self.session_id,
            state = ?self.state,
            retries = self.retries,
            "transfer timed out; retransmitting"
        );
        match self.state {
            SessionState::Initiating => match self.side {
                Side::Client => {
                    if self.send_or_die(bufs, &self.start_chunk()) {
                        self.arm(now, self.initial_chunk_timeout);
                    }
                }
                // The opener lost our acknowledgement.
                Side::Server => {
                    if self.send_or_die(bufs, &self.start_ack_chunk()) {
                        self.arm(now, self.timeout);
                    }
                }
            },
            SessionState::Negotiating => match (self.side, self.dir) {
                (Side::Client, TransferDir::Read) => {
                    if self.send_or_die(
                        bufs,
                        &self.parameters_chunk(ChunkType::ParametersRetransmit),
                    ) {
                        self.arm(now, self.timeout);
                    }
                }
                (Side::Client, TransferDir::Write) => {
                    let mut confirmation =
                        Chunk::new(ChunkType::StartAckConfirmation, self.session_id);
                    confirmation.protocol_version = Some(self.version);
                    if self.send_or_die(bufs, &confirmation) {
                        self.arm(now, self.timeout);
                    }
                }
                (Side::Server, _) => {
                    if self.send_or_die(bufs, &self.start_ack_chunk()) {
                        self.arm(now, self.timeout);
                    }
                }
            },
            SessionState::Receiving => {
                if self.send_or_die(
                    bufs,
                    &self.parameters_chunk(ChunkType::ParametersRetransmit),
                ) {
                    self.arm(now, self.timeout);
                }
            }
            SessionState::Transmitting => self.retransmit_window(bufs, now),
            SessionState::Completing => {
                let completion = self.completion_chunk(self.final_status.unwrap_or(Status::Ok));
                if self.send_or_die(bufs, &completion) {
                    self.arm(now, self.timeout);
                }
            }
            SessionState::Terminated => {}
        }
    }

    /// Reissues data from the confirmed base of the window.
    fn retransmit_window(&mut self, bufs: &mut Buffers, now: Instant) {
        let rewind = self.window_start_offset;
        if rewind != self.next_offset && !self.rewind_source(bufs, rewind) {
            return;
        }
        if self.next_offset < self.window_end_offset {
            self.transmit_window(bufs, now);
        } else if self.eof_reached && self.side == Side::Client {
            // The lost chunk can only have been the end-of-data marker.
            self.finish_transmission(bufs, now);
        } else {
            // Fully acknowledged but the window never grew; keep waiting on
            // the receiver, burning retries until the budget decides.
            self.arm(now, self.timeout);
        }
    }

    /// Books one retry against both budgets; terminates on exhaustion and
    /// returns false.
    fn count_retry(&mut self, bufs: &mut Buffers) -> bool {
        self.retries += 1;
        self.lifetime_retries += 1;
        if self.retries > self.max_retries || self.lifetime_retries > self.max_lifetime_retries {
            tracing::warn!(
                session_id = self.session_id,
                retries = self.retries,
                lifetime_retries = self.lifetime_retries,
                "retry budget exhausted"
            );
            self.terminate(bufs, Status::DeadlineExceeded, true);
            return false;
        }
        true
    }

    /// This side decides the transfer with `status`.
    fn complete(&mut self, bufs: &mut Buffers, status: Status, now: Instant) {
        self.final_status = Some(status);
        let completion = self.completion_chunk(status);
        if !self.send_or_die(bufs, &completion) {
            return;
        }
        if self.version >= ProtocolVersion::V2 && self.side == Side::Server {
            // Hold the session until the opener acknowledges.
            self.state = SessionState::Completing;
            self.arm(now, self.timeout);
        } else {
            self.finish(status);
        }
    }

    /// Local unilateral termination: best-effort notify, then finish.
    pub(crate) fn terminate(&mut self, bufs: &mut Buffers, status: Status, notify_peer: bool) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.final_status = Some(status);
        if notify_peer {
            let completion = self.completion_chunk(status);
            let _ = self.send(bufs, &completion);
        }
        self.finish(status);
    }

    /// Flushes, fires the completion callback exactly once, and retires the
    /// session.
    fn finish(&mut self, status: Status) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Terminated;
        self.deadline = None;
        if let Stream::Sink(writer) = &mut self.stream {
            if let Err(err) = writer.flush() {
                tracing::warn!(session_id = self.session_id, error = %err, "flush failed");
            }
        }
        tracing::debug!(session_id = self.session_id, %status, "transfer finished");
        if let Some(on_completion) = self.on_completion.take() {
            on_completion(status);
        }
    }

    fn arm(&mut self, now: Instant, timeout: Duration) {
        self.deadline = Some(now + timeout);
        self.timer_epoch += 1;
    }
}

fn read_chunk(reader: &mut DynReader, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
