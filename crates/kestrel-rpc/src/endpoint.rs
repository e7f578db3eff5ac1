//! Endpoint internals shared by the client and server.
//!
//! An endpoint owns a channel table and the registry of active calls. One
//! exclusive lock guards both; every RPC state transition takes it. User
//! callbacks are never invoked while the lock is held: dispatch captures the
//! callback under the lock, releases, then calls.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::call::{CallEntry, CallKey};
use crate::{Channel, Packet, Result, Status};

/// Registry of active calls.
///
/// The source kept these in an intrusive list so calls could live in caller
/// storage; a map keyed by call identity is the safe equivalent and keeps
/// the same uniqueness invariant.
#[derive(Default)]
pub(crate) struct CallMap {
    entries: HashMap<CallKey, CallEntry>,
}

impl CallMap {
    pub(crate) fn insert(&mut self, key: CallKey, entry: CallEntry) {
        let replaced = self.entries.insert(key, entry);
        if replaced.is_some() {
            tracing::warn!(?key, "replacing in-flight call with the same identity");
        }
    }

    pub(crate) fn get_mut(&mut self, key: &CallKey) -> Option<&mut CallEntry> {
        self.entries.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: &CallKey) -> Option<CallEntry> {
        self.entries.remove(key)
    }

    pub(crate) fn contains(&self, key: &CallKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Resolves an inbound packet to a registered call.
    ///
    /// A non-zero inbound call id matches exactly; zero matches the first
    /// active call on the `(channel, service, method)` triple.
    pub(crate) fn resolve(
        &self,
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_id: u32,
    ) -> Option<CallKey> {
        if call_id != 0 {
            let key = CallKey {
                channel_id,
                service_id,
                method_id,
                call_id,
            };
            return self.entries.contains_key(&key).then_some(key);
        }
        self.entries
            .keys()
            .find(|key| {
                key.channel_id == channel_id
                    && key.service_id == service_id
                    && key.method_id == method_id
            })
            .copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// State behind the endpoint lock.
pub(crate) struct CoreState {
    channels: Vec<Option<Channel>>,
    pub(crate) calls: CallMap,
    next_call_id: u32,
}

impl CoreState {
    fn new(channels: Vec<Option<Channel>>) -> Self {
        Self {
            channels,
            calls: CallMap::default(),
            next_call_id: 1,
        }
    }

    pub(crate) fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels
            .iter()
            .flatten()
            .find(|channel| channel.id() == id)
    }

    /// Binds `id` to `channel` in a free slot; `ResourceExhausted` when the
    /// fixed table is full.
    pub(crate) fn bind_channel(&mut self, channel: Channel) -> Result<()> {
        debug_assert!(self.channel(channel.id()).is_none());
        match self.channels.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                tracing::debug!(channel_id = channel.id(), "binding dynamic channel");
                *slot = Some(channel);
                Ok(())
            }
            None => {
                tracing::warn!(
                    channel_id = channel.id(),
                    "no free channel slot; rejecting packet"
                );
                Err(Status::ResourceExhausted)
            }
        }
    }

    /// Mints a fresh call id, skipping the reserved zero.
    pub(crate) fn next_call_id(&mut self) -> u32 {
        let id = self.next_call_id;
        self.next_call_id = self.next_call_id.wrapping_add(1).max(1);
        id
    }

    /// Best-effort reply on the packet's channel; drops when the channel is
    /// unknown or the send fails.
    pub(crate) fn try_reply(&self, packet: &Packet<'_>) {
        if let Some(channel) = self.channel(packet.channel_id()) {
            if let Err(status) = channel.send_packet(packet) {
                tracing::debug!(
                    channel_id = packet.channel_id(),
                    %status,
                    "dropping reply packet"
                );
            }
        }
    }
}

/// The endpoint lock plus the state it guards.
pub(crate) struct Core {
    state: Mutex<CoreState>,
}

impl Core {
    pub(crate) fn with_channels(channels: Vec<Channel>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CoreState::new(channels.into_iter().map(Some).collect())),
        })
    }

    pub(crate) fn with_capacity(channel_capacity: usize) -> Arc<Self> {
        let mut channels = Vec::new();
        channels.resize_with(channel_capacity, || None);
        Arc::new(Self {
            state: Mutex::new(CoreState::new(channels)),
        })
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, CoreState> {
        self.state.lock()
    }

    /// Delivers a stream payload to a call's `on_next`.
    ///
    /// The callback is captured under the lock and invoked without it, then
    /// restored if the call is still registered.
    pub(crate) fn dispatch_stream(&self, key: CallKey, payload: &[u8]) {
        let callback = {
            let mut state = self.lock();
            match state.calls.get_mut(&key) {
                Some(entry) => {
                    if entry.client_stream_done {
                        tracing::warn!(?key, "stream payload after half-close; dropping");
                        return;
                    }
                    entry.on_next.take()
                }
                None => return,
            }
        };
        let Some(mut callback) = callback else {
            tracing::warn!(?key, "stream payload arrived during reentrant dispatch; dropping");
            return;
        };
        callback(payload);
        let mut state = self.lock();
        if let Some(entry) = state.calls.get_mut(&key) {
            entry.on_next.get_or_insert(callback);
        }
    }

    /// Closes a call locally, firing `on_error` outside the lock.
    pub(crate) fn fail_call(&self, key: &CallKey, status: Status) {
        let removed = self.lock().calls.remove(key);
        if let Some(entry) = removed {
            entry.fail(status);
        }
    }
}
