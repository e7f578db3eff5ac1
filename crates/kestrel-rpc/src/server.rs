//! Server endpoint: service registry, method dispatch, and server calls.

use std::sync::Arc;

use crate::call::{CallEntry, CallKey, CallKind};
use crate::endpoint::Core;
use crate::{Channel, Packet, PacketType, Result, SharedOutput, Status};

/// Handler invoked when a request opens a call on a registered method.
///
/// The handler receives the call and the request payload. Unary handlers
/// finish the call before returning; streaming handlers may keep it and
/// write to it later.
pub type MethodHandler = Box<dyn FnMut(ServerCall, &[u8]) + Send>;

struct Method {
    id: u32,
    kind: CallKind,
    handler: MethodHandler,
}

/// A service: a numeric id and its method table.
pub struct Service {
    id: u32,
    methods: Vec<Method>,
}

impl Service {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            methods: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn unary(self, id: u32, handler: impl FnMut(ServerCall, &[u8]) + Send + 'static) -> Self {
        self.method(id, CallKind::Unary, handler)
    }

    pub fn server_stream(
        self,
        id: u32,
        handler: impl FnMut(ServerCall, &[u8]) + Send + 'static,
    ) -> Self {
        self.method(id, CallKind::ServerStream, handler)
    }

    pub fn client_stream(
        self,
        id: u32,
        handler: impl FnMut(ServerCall, &[u8]) + Send + 'static,
    ) -> Self {
        self.method(id, CallKind::ClientStream, handler)
    }

    pub fn bidi(self, id: u32, handler: impl FnMut(ServerCall, &[u8]) + Send + 'static) -> Self {
        self.method(id, CallKind::BiDi, handler)
    }

    fn method(
        mut self,
        id: u32,
        kind: CallKind,
        handler: impl FnMut(ServerCall, &[u8]) + Send + 'static,
    ) -> Self {
        assert!(
            self.methods.iter().all(|m| m.id != id),
            "method {id} registered twice on service {}",
            self.id
        );
        self.methods.push(Method {
            id,
            kind,
            handler: Box::new(handler),
        });
        self
    }
}

/// A server endpoint.
///
/// Channels are bound dynamically: the first packet seen for an unknown
/// channel id claims a free slot with the output its link provided.
pub struct Server {
    core: Arc<Core>,
    services: parking_lot::Mutex<Vec<Service>>,
}

impl Server {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            core: Core::with_capacity(channel_capacity),
            services: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Registers a service. Registering the same service id twice is a
    /// programmer error and asserts.
    pub fn register_service(&self, service: Service) {
        let mut services = self.services.lock();
        assert!(
            services.iter().all(|s| s.id != service.id),
            "service {} registered twice",
            service.id
        );
        services.push(service);
    }

    /// Routes one inbound frame received on the link behind `output`.
    pub fn process_packet(&self, data: &[u8], output: &SharedOutput) -> Result<()> {
        let packet = Packet::decode(data).inspect_err(|status| {
            tracing::debug!(%status, len = data.len(), "dropping undecodable packet");
        })?;

        {
            let mut state = self.core.lock();
            if state.channel(packet.channel_id()).is_none() {
                state.bind_channel(Channel::new(packet.channel_id(), Arc::clone(output)))?;
            }
        }

        match packet.packet_type() {
            PacketType::Request => self.invoke_method(&packet),
            PacketType::ClientStream => self.handle_client_stream(&packet),
            PacketType::ClientRequestCompletion => self.handle_request_completion(&packet),
            PacketType::ClientError => self.handle_client_error(&packet),
            other => {
                tracing::warn!(?other, "server received a server-bound packet type; dropping");
            }
        }
        Ok(())
    }

    fn invoke_method(&self, packet: &Packet<'_>) {
        let mut services = self.services.lock();
        let method = services
            .iter_mut()
            .find(|service| service.id == packet.service_id())
            .and_then(|service| {
                service
                    .methods
                    .iter_mut()
                    .find(|method| method.id == packet.method_id())
            });
        let Some(method) = method else {
            tracing::debug!(
                service_id = packet.service_id(),
                method_id = packet.method_id(),
                "request for unregistered method"
            );
            self.core.lock().try_reply(&Packet::server_error(
                packet.channel_id(),
                packet.service_id(),
                packet.method_id(),
                packet.call_id(),
                Status::NotFound,
            ));
            return;
        };

        let key = CallKey {
            channel_id: packet.channel_id(),
            service_id: packet.service_id(),
            method_id: packet.method_id(),
            call_id: packet.call_id(),
        };
        self.core.lock().calls.insert(key, CallEntry::new(method.kind));

        let call = ServerCall {
            core: Arc::clone(&self.core),
            key,
            kind: method.kind,
        };
        tracing::debug!(?key, kind = ?method.kind, "invoking method");
        (method.handler)(call, packet.payload());
    }

    fn handle_client_stream(&self, packet: &Packet<'_>) {
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
                    state.try_reply(&Packet::server_error(
                        packet.channel_id(),
                        packet.service_id(),
                        packet.method_id(),
                        packet.call_id(),
                        Status::FailedPrecondition,
                    ));
                    return;
                }
            }
        };
        self.core.dispatch_stream(key, packet.payload());
    }

    fn handle_request_completion(&self, packet: &Packet<'_>) {
        let mut state = self.core.lock();
        let key = state.calls.resolve(
            packet.channel_id(),
            packet.service_id(),
            packet.method_id(),
            packet.call_id(),
        );
        match key.and_then(|key| state.calls.get_mut(&key)) {
            Some(entry) => entry.client_stream_done = true,
            None => state.try_reply(&Packet::server_error(
                packet.channel_id(),
                packet.service_id(),
                packet.method_id(),
                packet.call_id(),
                Status::FailedPrecondition,
            )),
        }
    }

    fn handle_client_error(&self, packet: &Packet<'_>) {
        let removed = {
            let mut state = self.core.lock();
            state
                .calls
                .resolve(
                    packet.channel_id(),
                    packet.service_id(),
                    packet.method_id(),
                    packet.call_id(),
                )
                .and_then(|key| state.calls.remove(&key))
        };
        if let Some(entry) = removed {
            tracing::debug!(
                channel_id = packet.channel_id(),
                call_id = packet.call_id(),
                status = %packet.status(),
                "client terminated call"
            );
            entry.fail(packet.status());
        }
    }

    /// Number of calls currently registered (diagnostics).
    pub fn active_calls(&self) -> usize {
        self.core.lock().calls.len()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

/// A server's side of one active call.
///
/// Handlers receive it on invocation; streaming handlers keep it for later
/// writes. Dropping an unfinished call closes it locally without notifying
/// the client.
pub struct ServerCall {
    core: Arc<Core>,
    key: CallKey,
    kind: CallKind,
}

impl ServerCall {
    pub fn channel_id(&self) -> u32 {
        self.key.channel_id
    }

    pub fn call_id(&self) -> u32 {
        self.key.call_id
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.core.lock().calls.contains(&self.key)
    }

    /// Installs the callback for inbound client stream payloads.
    pub fn set_on_next(&self, f: impl FnMut(&[u8]) + Send + 'static) -> Result<()> {
        let mut state = self.core.lock();
        let entry = state
            .calls
            .get_mut(&self.key)
            .ok_or(Status::FailedPrecondition)?;
        entry.on_next = Some(Box::new(f));
        Ok(())
    }

    /// Installs the callback fired when the client terminates the call or a
    /// streaming send fails.
    pub fn set_on_error(&self, f: impl FnOnce(Status) + Send + 'static) -> Result<()> {
        let mut state = self.core.lock();
        let entry = state
            .calls
            .get_mut(&self.key)
            .ok_or(Status::FailedPrecondition)?;
        entry.on_error = Some(Box::new(f));
        Ok(())
    }

    /// Sends one server stream payload.
    pub fn send_stream(&self, payload: &[u8]) -> Result<()> {
        self.send_stream_with(|span| {
            if span.len() < payload.len() {
                return None;
            }
            span[..payload.len()].copy_from_slice(payload);
            Some(payload.len())
        })
    }

    /// Streams a payload built directly inside the channel's output buffer.
    ///
    /// This is the acquire/release pair for zero-copy writers: `fill` gets
    /// the payload span and returns how many bytes it staged, or `None` when
    /// the span is too small. A failed send closes the call and fires
    /// `on_error` with the underlying status.
    pub fn send_stream_with(&self, fill: impl FnOnce(&mut [u8]) -> Option<usize>) -> Result<()> {
        if !self.kind.has_server_stream() {
            return Err(Status::InvalidArgument);
        }
        let result = {
            let state = self.core.lock();
            if !state.calls.contains(&self.key) {
                return Err(Status::FailedPrecondition);
            }
            let channel = state
                .channel(self.key.channel_id)
                .ok_or(Status::Unavailable)?;
            let template = Packet::server_stream(
                self.key.channel_id,
                self.key.service_id,
                self.key.method_id,
                self.key.call_id,
                &[],
            );
            let mut buffer = channel.acquire_buffer();
            let span = buffer.payload(&template);
            match fill(span) {
                Some(len) => buffer.send(&template, len),
                None => Err(Status::Internal),
            }
        };
        if let Err(status) = result {
            tracing::warn!(key = ?self.key, %status, "stream send failed; closing call");
            self.core.fail_call(&self.key, status);
            return Err(status);
        }
        Ok(())
    }

    /// Finishes the call with a terminal response.
    pub fn finish(&self, payload: &[u8], status: Status) -> Result<()> {
        let mut state = self.core.lock();
        if state.calls.remove(&self.key).is_none() {
            return Err(Status::FailedPrecondition);
        }
        let channel = state
            .channel(self.key.channel_id)
            .ok_or(Status::Unavailable)?;
        channel.send_packet(&Packet::response(
            self.key.channel_id,
            self.key.service_id,
            self.key.method_id,
            self.key.call_id,
            payload,
            status,
        ))
    }

    /// Cancels the call from the server side.
    pub fn cancel(&self) {
        let mut state = self.core.lock();
        if state.calls.remove(&self.key).is_none() {
            return;
        }
        state.try_reply(&Packet::server_error(
            self.key.channel_id,
            self.key.service_id,
            self.key.method_id,
            self.key.call_id,
            Status::Cancelled,
        ));
    }
}

impl Drop for ServerCall {
    fn drop(&mut self) {
        let mut state = self.core.lock();
        if state.calls.remove(&self.key).is_some() {
            tracing::debug!(key = ?self.key, "server call dropped while open");
        }
    }
}

impl std::fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCall")
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

    fn encode(packet: &Packet<'_>) -> Vec<u8> {
        let mut buf = [0u8; 128];
        let len = packet.encode(&mut buf).unwrap();
        buf[..len].to_vec()
    }

    #[test]
    fn unary_request_gets_response() {
        let server = Server::new(2);
        server.register_service(Service::new(42).unary(100, |call, request| {
            assert_eq!(request, &[0xaa]);
            call.finish(&[0xbb], Status::Ok).unwrap();
        }));

        let output = TestOutput::new(128);
        let frames = output.frames();
        let output = shared_output(output);

        let request = Packet::request(1, 42, 100, 5, &[0xaa]);
        server.process_packet(&encode(&request), &output).unwrap();

        let sent = drain(&frames);
        assert_eq!(sent.len(), 1);
        let response = Packet::decode(&sent[0]).unwrap();
        assert_eq!(response.packet_type(), PacketType::Response);
        assert_eq!(response.payload(), &[0xbb]);
        assert_eq!(response.call_id(), 5);
        assert_eq!(server.active_calls(), 0);
    }

    #[test]
    fn unknown_method_is_not_found() {
        let server = Server::new(2);
        server.register_service(Service::new(42).unary(100, |_, _| {}));

        let output = TestOutput::new(128);
        let frames = output.frames();
        let output = shared_output(output);

        let request = Packet::request(1, 42, 999, 1, &[]);
        server.process_packet(&encode(&request), &output).unwrap();

        let sent = drain(&frames);
        let reply = Packet::decode(&sent[0]).unwrap();
        assert_eq!(reply.packet_type(), PacketType::ServerError);
        assert_eq!(reply.status(), Status::NotFound);
    }

    #[test]
    fn channel_table_exhaustion_is_reported() {
        let server = Server::new(1);
        server.register_service(Service::new(42).unary(100, |call, _| {
            let _ = call.finish(&[], Status::Ok);
        }));

        let first = shared_output(TestOutput::new(128));
        let second = shared_output(TestOutput::new(128));

        server
            .process_packet(&encode(&Packet::request(1, 42, 100, 1, &[])), &first)
            .unwrap();
        let err = server
            .process_packet(&encode(&Packet::request(2, 42, 100, 2, &[])), &second)
            .unwrap_err();
        assert_eq!(err, Status::ResourceExhausted);
    }

    #[test]
    fn streaming_call_survives_handler_return() {
        let server = Server::new(2);
        let slot: Arc<parking_lot::Mutex<Option<ServerCall>>> = Arc::default();
        server.register_service(Service::new(42).server_stream(100, {
            let slot = Arc::clone(&slot);
            move |call, _| {
                *slot.lock() = Some(call);
            }
        }));

        let output = TestOutput::new(128);
        let frames = output.frames();
        let output = shared_output(output);
        server
            .process_packet(&encode(&Packet::request(1, 42, 100, 3, &[])), &output)
            .unwrap();
        assert_eq!(server.active_calls(), 1);

        let call = slot.lock().take().unwrap();
        call.send_stream(&[1]).unwrap();
        call.send_stream(&[2]).unwrap();
        call.finish(&[], Status::Ok).unwrap();

        let sent = drain(&frames);
        let types: Vec<_> = sent
            .iter()
            .map(|frame| Packet::decode(frame).unwrap().packet_type())
            .collect();
        assert_eq!(
            types,
            vec![
                PacketType::ServerStream,
                PacketType::ServerStream,
                PacketType::Response
            ]
        );
    }

    #[test]
    fn client_error_closes_call_and_fires_on_error() {
        let server = Server::new(2);
        let slot: Arc<parking_lot::Mutex<Option<ServerCall>>> = Arc::default();
        server.register_service(Service::new(42).bidi(100, {
            let slot = Arc::clone(&slot);
            move |call, _| {
                *slot.lock() = Some(call);
            }
        }));

        let output = shared_output(TestOutput::new(128));
        server
            .process_packet(&encode(&Packet::request(1, 42, 100, 3, &[])), &output)
            .unwrap();

        let errors: Arc<parking_lot::Mutex<Vec<Status>>> = Arc::default();
        let call = slot.lock().take().unwrap();
        call.set_on_error({
            let errors = Arc::clone(&errors);
            move |status| errors.lock().push(status)
        })
        .unwrap();

        let cancel = Packet::client_error(1, 42, 100, 3, Status::Cancelled);
        server.process_packet(&encode(&cancel), &output).unwrap();

        assert_eq!(*errors.lock(), vec![Status::Cancelled]);
        assert!(!call.is_active());
        assert_eq!(call.send_stream(&[1]), Err(Status::FailedPrecondition));
    }
}
