//! Reply assembly.
//!
//! A handler produces exactly one [`Reply`]: a status byte plus a payload of
//! at most [`MAX_PAYLOAD`] bytes. Encoding prefixes the 5-byte reply header
//! (sid, seq, cmd, status) and guarantees the result never exceeds
//! [`MAXMSGSZ`]; a payload that would is a server bug, not a client error.

use std::os::unix::ffi::OsStrExt;

use smallvec::SmallVec;
use zerocopy::{Immutable, IntoBytes};

use super::tnfs_abi::{HEADERSZ, MAX_PAYLOAD, MAXMSGSZ, Status};

// Most replies are a handful of bytes; READ and READDIRX spill to the heap.
const INLINE_PAYLOAD: usize = 64;
pub(crate) type ReplyBuf = SmallVec<[u8; INLINE_PAYLOAD]>;

/// One reply in the making: status plus accumulated payload.
#[derive(Debug)]
pub(crate) struct Reply {
    status: Status,
    payload: ReplyBuf,
}

impl Reply {
    pub(crate) fn ok() -> Reply {
        Reply {
            status: Status::OK,
            payload: ReplyBuf::new(),
        }
    }

    pub(crate) fn error(status: Status) -> Reply {
        Reply {
            status,
            payload: ReplyBuf::new(),
        }
    }

    /// A success reply whose payload is a single packed struct.
    pub(crate) fn from_struct<T: IntoBytes + Immutable + ?Sized>(data: &T) -> Reply {
        let mut reply = Reply::ok();
        reply.push_struct(data);
        reply
    }

    pub(crate) fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn push_struct<T: IntoBytes + Immutable + ?Sized>(&mut self, data: &T) {
        self.push_bytes(data.as_bytes());
    }

    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        assert!(
            self.payload.len() + bytes.len() <= MAX_PAYLOAD,
            "reply payload overflow"
        );
        self.payload.extend_from_slice(bytes);
    }

    /// Append a NUL-terminated string.
    pub(crate) fn push_cstr(&mut self, s: &std::ffi::OsStr) {
        self.push_bytes(s.as_bytes());
        self.push_bytes(&[0]);
    }

    /// Produce the full wire message for this reply.
    pub(crate) fn encode(&self, sid: u16, seq: u8, cmd: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADERSZ + 1 + self.payload.len());
        out.extend_from_slice(&sid.to_le_bytes());
        out.push(seq);
        out.push(cmd);
        out.push(self.status.0);
        out.extend_from_slice(&self.payload);
        debug_assert!(out.len() <= MAXMSGSZ);
        out
    }
}
