//! Per-invocation call state shared by the client and server endpoints.

use crate::Status;

/// Identity of a call within an endpoint.
///
/// Active calls are unique by this key; a zero `call_id` on an inbound
/// packet matches the first active call on the same channel/service/method
/// triple (legacy peers never assign call ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub channel_id: u32,
    pub service_id: u32,
    pub method_id: u32,
    pub call_id: u32,
}

/// The shape of a method invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    ServerStream,
    ClientStream,
    BiDi,
}

impl CallKind {
    /// True when the client may send stream payloads after the request.
    pub fn has_client_stream(self) -> bool {
        matches!(self, Self::ClientStream | Self::BiDi)
    }

    /// True when the server may send stream payloads before the response.
    pub fn has_server_stream(self) -> bool {
        matches!(self, Self::ServerStream | Self::BiDi)
    }
}

/// Lifecycle of a call. `Closed` calls are not stored; removal from the
/// endpoint's registry is the closed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Active,
    /// The client has half-closed its stream and awaits the terminal packet.
    AwaitingCompletion,
}

pub(crate) type OnNext = Box<dyn FnMut(&[u8]) + Send>;
pub(crate) type OnCompleted = Box<dyn FnOnce(&[u8], Status) + Send>;
pub(crate) type OnError = Box<dyn FnOnce(Status) + Send>;

/// Registered state of one active call.
///
/// The terminal callbacks are taken exactly once: the entry is removed from
/// the registry first and the callback runs after the endpoint lock is
/// released.
pub(crate) struct CallEntry {
    pub(crate) kind: CallKind,
    pub(crate) state: CallState,
    /// Server side: the peer sent `ClientRequestCompletion`.
    pub(crate) client_stream_done: bool,
    pub(crate) on_next: Option<OnNext>,
    pub(crate) on_completed: Option<OnCompleted>,
    pub(crate) on_error: Option<OnError>,
}

impl CallEntry {
    pub(crate) fn new(kind: CallKind) -> Self {
        Self {
            kind,
            state: CallState::Active,
            client_stream_done: false,
            on_next: None,
            on_completed: None,
            on_error: None,
        }
    }

    /// Consumes the entry, firing the completion callback.
    pub(crate) fn complete(self, payload: &[u8], status: Status) {
        if let Some(on_completed) = self.on_completed {
            on_completed(payload, status);
        }
    }

    /// Consumes the entry, firing the error callback.
    pub(crate) fn fail(self, status: Status) {
        if let Some(on_error) = self.on_error {
            on_error(status);
        }
    }
}

impl std::fmt::Debug for CallEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEntry")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("client_stream_done", &self.client_stream_done)
            .finish_non_exhaustive()
    }
}
