//! Low-level protocol pieces: wire definitions, request parsing, reply
//! assembly, and the errno translation table.

pub(crate) mod argument;
pub(crate) mod errno;
pub(crate) mod reply;
pub(crate) mod request;
pub mod tnfs_abi;
