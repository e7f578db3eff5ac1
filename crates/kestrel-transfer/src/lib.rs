//! kestrel-transfer: reliable, windowed, resumable bulk transfer over
//! kestrel-rpc.
//!
//! Transfers move a resource between a client and a server over a pair of
//! streaming RPCs (one per direction), chunked and flow-controlled by a
//! receiver-advertised window. Sessions survive packet loss through
//! re-anchoring parameters, bounded retries, and inactivity timeouts, and
//! both ends pin a protocol version per session at handshake time.
//!
//! # Architecture
//!
//! ```text
//!   Client::read/write ──► work queue ──► TransferEventLoop ──► sessions
//!   RPC on_next (chunks) ──► work queue ──┘        │
//!   timers (min-heap) ──────────────────────────────┘
//! ```
//!
//! Every session state transition and every completion callback runs on the
//! event loop; the RPC runtime is never blocked by transfer work.

mod chunk;
mod client;
pub mod config;
mod server;
mod session;
mod stream;
mod thread;

pub use chunk::{Chunk, ChunkType, ProtocolVersion};
pub use client::{Client, TransferHandle};
pub use server::Server;
pub use stream::{DynReader, DynWriter, ReadSeek};
pub use thread::{TransferEventLoop, TransferThread};
