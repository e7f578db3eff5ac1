//! kestrel-rpc: a transport-agnostic RPC runtime for byte-oriented links.
//!
//! The runtime multiplexes unary and streaming calls over any link that can
//! move framed bytes. It defines:
//! - Packet framing ([`Packet`], [`PacketType`], [`MIN_ENCODED_SIZE`])
//! - Channels and outputs ([`Channel`], [`ChannelOutput`], [`OutputBuffer`])
//! - Endpoints ([`Client`], [`Server`]) and calls ([`CallHandle`],
//!   [`ServerCall`])
//! - The method serde capability ([`MethodSerde`])
//!
//! # Architecture
//!
//! ```text
//!   link rx bytes ──► Client::process_packet ──► call registry ──► callbacks
//!                     Server::process_packet ──► service registry ──► handler
//!   callbacks/handlers ──► Channel::acquire_buffer ──► stage payload ──► send
//! ```
//!
//! One exclusive lock per endpoint guards the channel table and every call's
//! state; user callbacks always run outside it. The runtime never blocks:
//! outputs are expected to transmit or fail fast, and nothing on the packet
//! path allocates.

mod call;
mod channel;
mod client;
mod endpoint;
mod packet;
mod serde;
mod server;
mod status;
pub mod testing;
pub mod wire;

pub use call::{CallKey, CallKind, CallState};
pub use channel::{shared_output, Channel, ChannelOutput, OutputBuffer, SharedOutput};
pub use client::{CallHandle, Callbacks, Client};
pub use packet::{Packet, PacketType, MIN_ENCODED_SIZE};
pub use serde::MethodSerde;
pub use server::{MethodHandler, Server, ServerCall, Service};
pub use status::{Result, Status};
