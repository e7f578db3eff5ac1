//! Test doubles for exercising endpoints without a real link.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{ChannelOutput, Result};

/// Queue of frames captured from a [`TestOutput`].
pub type FrameQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// A [`ChannelOutput`] over a fixed-size in-memory buffer that records every
/// transmitted frame.
pub struct TestOutput {
    name: Option<&'static str>,
    buffer: Vec<u8>,
    sent: FrameQueue,
}

impl TestOutput {
    pub fn new(mtu: usize) -> Self {
        Self {
            name: None,
            buffer: vec![0; mtu],
            sent: FrameQueue::default(),
        }
    }

    pub fn named(mtu: usize, name: &'static str) -> Self {
        Self {
            name: Some(name),
            ..Self::new(mtu)
        }
    }

    /// Handle to the captured frames; clone before handing the output off.
    pub fn frames(&self) -> FrameQueue {
        Arc::clone(&self.sent)
    }
}

impl ChannelOutput for TestOutput {
    fn name(&self) -> Option<&str> {
        self.name
    }

    fn buffer(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    fn send(&mut self, len: usize) -> Result<()> {
        self.sent.lock().push_back(self.buffer[..len].to_vec());
        Ok(())
    }
}

/// Pops all frames queued so far.
pub fn drain(queue: &FrameQueue) -> Vec<Vec<u8>> {
    queue.lock().drain(..).collect()
}
