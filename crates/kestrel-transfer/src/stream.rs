//! Data endpoints for transfers.
//!
//! Read transfers sink into an [`io::Write`]; write transfers source from an
//! [`io::Read`] that also supports [`io::Seek`], because the receiver may
//! rewind the window after loss. Blocking here stalls only the transfer
//! event loop, never the RPC runtime.

use std::io;

/// Boxed sink for a read transfer.
pub type DynWriter = Box<dyn io::Write + Send>;

/// Boxed seekable source for a write transfer.
pub type DynReader = Box<dyn ReadSeek + Send>;

/// Blanket pairing of read and seek.
pub trait ReadSeek: io::Read + io::Seek {}

impl<T: io::Read + io::Seek> ReadSeek for T {}
