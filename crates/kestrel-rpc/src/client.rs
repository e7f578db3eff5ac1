//! Client endpoint: starts calls and routes server packets back to them.

use std::sync::Arc;

use crate::call::{CallEntry, CallKey, CallKind, CallState};
use crate::endpoint::Core;
use crate::{Channel, Packet, PacketType, Result, Status};

/// Callbacks installed when a call starts.
///
/// Ordering per call follows wire arrival: every `on_next` precedes the one
/// terminal callback, and exactly one of `on_completed`/`on_error` fires for
/// a call the peer terminates. Locally cancelled or abandoned calls fire
/// nothing further.
#[derive(Default)]
pub struct Callbacks {
    pub(crate) on_next: Option<Box<dyn FnMut(&[u8]) + Send>>,
    pub(crate) on_completed: Option<Box<dyn FnOnce(&[u8], Status) + Send>>,
    pub(crate) on_error: Option<Box<dyn FnOnce(Status) + Send>>,
}

impl Callbacks {
    pub fn on_next(mut self, f: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.on_next = Some(Box::new(f));
        self
    }

    pub fn on_completed(mut self, f: impl FnOnce(&[u8], Status) + Send + 'static) -> Self {
        self.on_completed = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(Status) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// A client endpoint over a fixed set of channels.
pub struct Client {
    core: Arc<Core>,
}

impl Client {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            core: Core::with_channels(channels),
        }
    }

    /// Routes one inbound frame.
    ///
    /// Decode failures drop the frame and surface `DataLoss`. Packets for a
    /// closed or unknown call are answered with a `FailedPrecondition`
    /// client error unless the packet was itself an error.
    pub fn process_packet(&self, data: &[u8]) -> Result<()> {
        let packet = Packet::decode(data).inspect_err(|status| {
            tracing::debug!(%status, len = data.len(), "dropping undecodable packet");
        })?;

        match packet.packet_type() {
            PacketType::ServerStream => self.handle_stream(&packet),
            PacketType::Response => self.handle_terminal(&packet),
            PacketType::ServerError => self.handle_terminal(&packet),
            other => {
                tracing::warn!(?other, "client received a client-bound packet type; dropping");
            }
        }
        Ok(())
    }

    /// Starts a unary call: one request, one terminal response.
    pub fn start_unary(
        &self,
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        request: &[u8],
        callbacks: Callbacks,
    ) -> Result<CallHandle> {
        self.start_call(channel_id, service_id, method_id, CallKind::Unary, request, callbacks)
    }

    /// Starts a server-streaming call.
    pub fn start_server_stream(
        &self,
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        request: &[u8],
        callbacks: Callbacks,
    ) -> Result<CallHandle> {
        self.start_call(
            channel_id,
            service_id,
            method_id,
            CallKind::ServerStream,
            request,
            callbacks,
        )
    }

    /// Starts a client-streaming call.
    pub fn start_client_stream(
        &self,
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        request: &[u8],
        callbacks: Callbacks,
    ) -> Result<CallHandle> {
        self.start_call(
            channel_id,
            service_id,
            method_id,
            CallKind::ClientStream,
            request,
            callbacks,
        )
    }

    /// Starts a bidirectional streaming call.
    pub fn start_bidi(
        &self,
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        request: &[u8],
        callbacks: Callbacks,
    ) -> Result<CallHandle> {
        self.start_call(channel_id, service_id, method_id, CallKind::BiDi, request, callbacks)
    }

    fn start_call(
        &self,
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        kind: CallKind,
        request: &[u8],
        callbacks: Callbacks,
    ) -> Result<CallHandle> {
        let mut state = self.core.lock();
        let call_id = state.next_call_id();
        let key = CallKey {
            channel_id,
            service_id,
            method_id,
            call_id,
        };

        let channel = state.channel(channel_id).ok_or(Status::Unavailable)?;
        channel.send_packet(&Packet::request(
            channel_id, service_id, method_id, call_id, request,
        ))?;

        let mut entry = CallEntry::new(kind);
        entry.on_next = callbacks.on_next;
        entry.on_completed = callbacks.on_completed;
        entry.on_error = callbacks.on_error;
        state.calls.insert(key, entry);
        drop(state);

        tracing::debug!(?key, ?kind, "started call");
        Ok(CallHandle {
            core: Arc::clone(&self.core),
            key,
            kind,
        })
    }

    fn handle_stream(&self, packet: &Packet<'_>) {
        let key = {
            let state = self.core.lock();
            let key = state.calls.resolve(
                packet.channel_id(),
                packet.service_id(),
                packet.method_id(),
                packet.call_id(),
            );
            match key {
                Some(key) => key,
                None => {
                    self.reject_unknown(&state, packet);
                    return;
                }
            }
        };
        self.core.dispatch_stream(key, packet.payload());
    }

    fn handle_terminal(&self, packet: &Packet<'_>) {
        let removed = {
            let mut state = self.core.lock();
            let key = state.calls.resolve(
                packet.channel_id(),
                packet.service_id(),
                packet.method_id(),
                packet.call_id(),
            );
            match key {
                Some(key) => state.calls.remove(&key),
                None => {
                    self.reject_unknown(&state, packet);
                    return;
                }
            }
        };
        let Some(entry) = removed else { return };

        match packet.packet_type() {
            PacketType::Response => entry.complete(packet.payload(), packet.status()),
            PacketType::ServerError => entry.fail(packet.status()),
            _ => unreachable!("handle_terminal only sees terminal packets"),
        }
    }

    /// Answers a packet addressed at no active call.
    fn reject_unknown(&self, state: &crate::endpoint::CoreState, packet: &Packet<'_>) {
        if packet.packet_type().is_error() {
            tracing::debug!(
                channel_id = packet.channel_id(),
                call_id = packet.call_id(),
                "error packet for unknown call; dropping"
            );
            return;
        }
        tracing::debug!(
            channel_id = packet.channel_id(),
            call_id = packet.call_id(),
            "packet for unknown call; rejecting"
        );
        state.try_reply(&Packet::client_error(
            packet.channel_id(),
            packet.service_id(),
            packet.method_id(),
            packet.call_id(),
            Status::FailedPrecondition,
        ));
    }

    /// Number of calls currently registered (diagnostics).
    pub fn active_calls(&self) -> usize {
        self.core.lock().calls.len()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// Owner's handle to an active client call.
///
/// Dropping the handle abandons the call: it closes locally (half-closing
/// the client stream where one is open) and later server packets for it are
/// rejected with `FailedPrecondition`.
pub struct CallHandle {
    core: Arc<Core>,
    key: CallKey,
    kind: CallKind,
}

impl CallHandle {
    pub fn call_id(&self) -> u32 {
        self.key.call_id
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.core.lock().calls.contains(&self.key)
    }

    /// Sends one client stream payload. Only meaningful on client-streaming
    /// and bidirectional calls.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        if !self.kind.has_client_stream() {
            return Err(Status::InvalidArgument);
        }
        let mut state = self.core.lock();
        let active = match state.calls.get_mut(&self.key) {
            Some(entry) => entry.state == CallState::Active,
            None => false,
        };
        if !active {
            return Err(Status::FailedPrecondition);
        }
        let channel = state.channel(self.key.channel_id).ok_or(Status::Unavailable)?;
        channel.send_packet(&Packet::client_stream(
            self.key.channel_id,
            self.key.service_id,
            self.key.method_id,
            self.key.call_id,
            payload,
        ))
    }

    /// Half-closes the client stream: no further `write`s will follow.
    pub fn request_completion(&self) -> Result<()> {
        let mut state = self.core.lock();
        let Some(entry) = state.calls.get_mut(&self.key) else {
            return Err(Status::FailedPrecondition);
        };
        if entry.state == CallState::AwaitingCompletion {
            return Ok(());
        }
        entry.state = CallState::AwaitingCompletion;
        let channel = state.channel(self.key.channel_id).ok_or(Status::Unavailable)?;
        channel.send_packet(&Packet::client_request_completion(
            self.key.channel_id,
            self.key.service_id,
            self.key.method_id,
            self.key.call_id,
        ))
    }

    /// Cancels the call. Idempotent; the call is observably closed when this
    /// returns, and delivery of the cancellation packet is best-effort.
    pub fn cancel(&self) {
        let mut state = self.core.lock();
        if state.calls.remove(&self.key).is_none() {
            return;
        }
        tracing::debug!(key = ?self.key, "cancelling call");
        state.try_reply(&Packet::client_error(
            self.key.channel_id,
            self.key.service_id,
            self.key.method_id,
            self.key.call_id,
            Status::Cancelled,
        ));
    }

    /// Closes the call locally without cancelling it on the server.
    pub fn abandon(&self) {
        let mut state = self.core.lock();
        let Some(entry) = state.calls.remove(&self.key) else {
            return;
        };
        // An open client stream is still half-closed so the server can
        // finish cleanly.
        if entry.kind.has_client_stream() && entry.state == CallState::Active {
            state.try_reply(&Packet::client_request_completion(
                self.key.channel_id,
                self.key.service_id,
                self.key.method_id,
                self.key.call_id,
            ));
        }
        tracing::debug!(key = ?self.key, "abandoned call");
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::shared_output;
    use crate::testing::{drain, TestOutput};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn client_with_output() -> (Client, crate::testing::FrameQueue) {
        let output = TestOutput::new(128);
        let frames = output.frames();
        let client = Client::new(vec![Channel::new(1, shared_output(output))]);
        (client, frames)
    }

    fn encode(packet: &Packet<'_>) -> Vec<u8> {
        let mut buf = [0u8; 128];
        let len = packet.encode(&mut buf).unwrap();
        buf[..len].to_vec()
    }

    #[test]
    fn unary_completion_fires_exactly_once() {
        let (client, frames) = client_with_output();
        let completions = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));

        let call = client
            .start_unary(
                1,
                42,
                100,
                &[0xaa],
                Callbacks::default()
                    .on_completed({
                        let completions = Arc::clone(&completions);
                        move |payload, status| {
                            assert_eq!(payload, &[0xbb]);
                            assert_eq!(status, Status::Ok);
                            completions.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                    .on_error({
                        let errors = Arc::clone(&errors);
                        move |_| {
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }),
            )
            .unwrap();

        let sent = drain(&frames);
        let request = Packet::decode(&sent[0]).unwrap();
        assert_eq!(request.packet_type(), PacketType::Request);
        assert_eq!(request.payload(), &[0xaa]);

        let response = Packet::response(1, 42, 100, call.call_id(), &[0xbb], Status::Ok);
        client.process_packet(&encode(&response)).unwrap();
        // A duplicate response must not re-fire callbacks.
        client.process_packet(&encode(&response)).unwrap();

        assert_eq!(completions.load(Ordering::Relaxed), 1);
        assert_eq!(errors.load(Ordering::Relaxed), 0);
        assert!(!call.is_active());
    }

    #[test]
    fn server_error_fires_on_error_only() {
        let (client, _frames) = client_with_output();
        let completions = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));

        let call = client
            .start_unary(
                1,
                42,
                100,
                &[],
                Callbacks::default()
                    .on_completed({
                        let completions = Arc::clone(&completions);
                        move |_, _| {
                            completions.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                    .on_error({
                        let errors = Arc::clone(&errors);
                        move |status| {
                            assert_eq!(status, Status::NotFound);
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }),
            )
            .unwrap();

        let error = Packet::server_error(1, 42, 100, call.call_id(), Status::NotFound);
        client.process_packet(&encode(&error)).unwrap();

        assert_eq!(completions.load(Ordering::Relaxed), 0);
        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stream_payloads_precede_completion_in_order() {
        let (client, _frames) = client_with_output();
        let seen: Arc<parking_lot::Mutex<Vec<Vec<u8>>>> = Arc::default();
        let done = Arc::new(AtomicU32::new(0));

        let call = client
            .start_server_stream(
                1,
                42,
                100,
                &[],
                Callbacks::default()
                    .on_next({
                        let seen = Arc::clone(&seen);
                        move |payload| seen.lock().push(payload.to_vec())
                    })
                    .on_completed({
                        let seen = Arc::clone(&seen);
                        let done = Arc::clone(&done);
                        move |_, _| {
                            assert_eq!(seen.lock().len(), 2, "on_next precedes completion");
                            done.fetch_add(1, Ordering::Relaxed);
                        }
                    }),
            )
            .unwrap();

        for payload in [&[1u8][..], &[2u8][..]] {
            let packet = Packet::server_stream(1, 42, 100, call.call_id(), payload);
            client.process_packet(&encode(&packet)).unwrap();
        }
        let terminal = Packet::response(1, 42, 100, call.call_id(), &[], Status::Ok);
        client.process_packet(&encode(&terminal)).unwrap();

        assert_eq!(*seen.lock(), vec![vec![1], vec![2]]);
        assert_eq!(done.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cancel_sends_client_error_and_stops_callbacks() {
        let (client, frames) = client_with_output();
        let events = Arc::new(AtomicU32::new(0));

        let call = client
            .start_server_stream(
                1,
                42,
                100,
                &[],
                Callbacks::default()
                    .on_next({
                        let events = Arc::clone(&events);
                        move |_| {
                            events.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                    .on_completed({
                        let events = Arc::clone(&events);
                        move |_, _| {
                            events.fetch_add(100, Ordering::Relaxed);
                        }
                    }),
            )
            .unwrap();
        drain(&frames);

        call.cancel();
        call.cancel();

        let sent = drain(&frames);
        assert_eq!(sent.len(), 1, "cancel is idempotent on the wire too");
        let cancel = Packet::decode(&sent[0]).unwrap();
        assert_eq!(cancel.packet_type(), PacketType::ClientError);
        assert_eq!(cancel.status(), Status::Cancelled);

        // Late stream payloads are rejected, not delivered.
        let late = Packet::server_stream(1, 42, 100, call.call_id(), &[9]);
        client.process_packet(&encode(&late)).unwrap();
        assert_eq!(events.load(Ordering::Relaxed), 0);

        let reject = drain(&frames);
        let reply = Packet::decode(&reject[0]).unwrap();
        assert_eq!(reply.packet_type(), PacketType::ClientError);
        assert_eq!(reply.status(), Status::FailedPrecondition);
    }

    #[test]
    fn legacy_zero_call_id_matches_first_active_call() {
        let (client, _frames) = client_with_output();
        let completions = Arc::new(AtomicU32::new(0));

        let _call = client
            .start_unary(
                1,
                42,
                100,
                &[],
                Callbacks::default().on_completed({
                    let completions = Arc::clone(&completions);
                    move |_, _| {
                        completions.fetch_add(1, Ordering::Relaxed);
                    }
                }),
            )
            .unwrap();

        let response = Packet::response(1, 42, 100, 0, &[], Status::Ok);
        client.process_packet(&encode(&response)).unwrap();
        assert_eq!(completions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn abandon_on_bidi_half_closes() {
        let (client, frames) = client_with_output();
        let call = client
            .start_bidi(1, 42, 100, &[], Callbacks::default())
            .unwrap();
        drain(&frames);

        drop(call);
        let sent = drain(&frames);
        assert_eq!(sent.len(), 1);
        let packet = Packet::decode(&sent[0]).unwrap();
        assert_eq!(packet.packet_type(), PacketType::ClientRequestCompletion);
    }

    #[test]
    fn unknown_channel_is_unavailable() {
        let (client, _frames) = client_with_output();
        let err = client
            .start_unary(9, 42, 100, &[], Callbacks::default())
            .unwrap_err();
        assert_eq!(err, Status::Unavailable);
    }
}
