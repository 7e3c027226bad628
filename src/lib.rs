//! TNFS daemon library.
//!
//! Implements the Trivial Network File System protocol (revision 0x0102): a
//! lightweight request/response file service over UDP, with an optional TCP
//! transport, exposing one bounded directory subtree to remote clients. The
//! dispatcher is transport-agnostic, so the whole protocol surface can be
//! exercised in-process; the binary wires it to real sockets.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub use crate::channel::Transport;
pub use crate::ll::request::RequestError;
pub use crate::ll::tnfs_abi;
pub use crate::server::Tnfsd;

mod channel;
mod dir;
mod ll;
mod pattern;
mod resolve;
mod server;
mod session;
