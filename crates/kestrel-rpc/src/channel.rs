//! Channels: named, id'd byte transports with a buffer acquire/send
//! discipline.
//!
//! A [`ChannelOutput`] owns one MTU-sized output buffer. Sending a packet
//! stages its payload directly inside that buffer (after
//! [`MIN_ENCODED_SIZE`] bytes of header headroom), then serializes the
//! packet fields around it and hands the finished frame to the output. The
//! exclusive lock held by [`OutputBuffer`] is what makes a second acquire on
//! the same channel before release a visible programming error rather than
//! silent corruption.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::packet::MIN_ENCODED_SIZE;
use crate::{Packet, Result, Status};

/// The write half of a link: one reusable output buffer and a transmit
/// primitive. Implementations must not reorder frames.
pub trait ChannelOutput: Send {
    /// Optional human-readable name for diagnostics.
    fn name(&self) -> Option<&str> {
        None
    }

    /// The output's transmit buffer. Its length is the link MTU.
    fn buffer(&mut self) -> &mut [u8];

    /// Transmits the first `len` bytes of the buffer and releases it.
    ///
    /// Must not block; fail fast with the underlying status instead.
    fn send(&mut self, len: usize) -> Result<()>;
}

/// Shared handle to a channel output.
///
/// Outputs are shared between the endpoint that owns the channel and the
/// code that feeds inbound packets for it, so they live behind a lock.
pub type SharedOutput = Arc<Mutex<dyn ChannelOutput>>;

/// Wraps a concrete output into a [`SharedOutput`].
pub fn shared_output<T: ChannelOutput + 'static>(output: T) -> SharedOutput {
    Arc::new(Mutex::new(output))
}

/// A bidirectional transport identified by a non-zero id.
pub struct Channel {
    id: u32,
    output: SharedOutput,
}

impl Channel {
    /// Creates a channel. A zero id is reserved and asserts.
    pub fn new(id: u32, output: SharedOutput) -> Self {
        assert!(id != 0, "channel id 0 is reserved");
        Self { id, output }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.output.lock().name().map(str::to_owned)
    }

    pub fn output(&self) -> &SharedOutput {
        &self.output
    }

    /// Acquires the output buffer for staging a payload.
    ///
    /// The returned guard holds the output exclusively until `send` or drop.
    pub fn acquire_buffer(&self) -> OutputBuffer<'_> {
        OutputBuffer {
            channel_id: self.id,
            output: self.output.lock(),
        }
    }

    /// Encodes `packet` (payload included) into a freshly acquired buffer
    /// and transmits it. Convenience path for control packets whose payload
    /// is not staged in place.
    pub fn send_packet(&self, packet: &Packet<'_>) -> Result<()> {
        let mut buffer = self.acquire_buffer();
        let span = buffer.payload(packet);
        let payload = packet.payload();
        if span.len() < payload.len() {
            return Err(Status::Internal);
        }
        span[..payload.len()].copy_from_slice(payload);
        buffer.send(packet, payload.len())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish_non_exhaustive()
    }
}

/// An acquired output buffer.
pub struct OutputBuffer<'a> {
    channel_id: u32,
    output: MutexGuard<'a, dyn ChannelOutput>,
}

impl OutputBuffer<'_> {
    /// The span available for payload bytes after header headroom.
    ///
    /// Empty when the output's buffer cannot hold even a minimal packet.
    pub fn payload(&mut self, _template: &Packet<'_>) -> &mut [u8] {
        let buf = self.output.buffer();
        if buf.len() < MIN_ENCODED_SIZE {
            return &mut [];
        }
        &mut buf[MIN_ENCODED_SIZE..]
    }

    /// Serializes `template` around the staged payload of `payload_len`
    /// bytes and transmits the frame.
    ///
    /// Returns `Internal` when the buffer is smaller than the reserved
    /// header or the payload does not fit next to the encoded fields.
    pub fn send(mut self, template: &Packet<'_>, payload_len: usize) -> Result<()> {
        let buf = self.output.buffer();
        if buf.len() < MIN_ENCODED_SIZE || MIN_ENCODED_SIZE + payload_len > buf.len() {
            return Err(Status::Internal);
        }
        let total = template.encode_in_place(buf, MIN_ENCODED_SIZE, payload_len)?;
        let result = self.output.send(total);
        if let Err(status) = result {
            tracing::warn!(channel_id = self.channel_id, %status, "channel send failed");
        }
        result
    }
}
