//! TNFS wire interface.
//!
//! Types and definitions shared between a TNFS server and its clients. The
//! protocol is datagram oriented: every request and reply fits in a single
//! message of at most [`MAXMSGSZ`] bytes, and all multi-byte integers are
//! little-endian regardless of host, which is why the structs below are built
//! from [`zerocopy`] byte-order types and derive `Unaligned` (the 4-byte
//! request header leaves every later field unaligned).
//!
//! Protocol revision implemented here: 0x0102.

#![allow(missing_docs)]

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use std::time::Duration;
use zerocopy::byteorder::little_endian::{I32, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Default UDP (and TCP) port of the daemon.
pub const TNFSD_PORT: u16 = 16384;

/// Protocol revision sent in MOUNT replies.
pub const PROTOVERSION: u16 = 0x0102;

/// Minimum retry interval advertised to clients, in milliseconds.
pub const MIN_RETRY_MS: u16 = 1000;

/// Hard upper bound on a request or reply message.
pub const MAXMSGSZ: usize = 532;

/// Size of the request header (sid, seq, cmd).
pub const HEADERSZ: usize = 4;

/// Maximum usable reply payload: message minus header minus status byte.
pub const MAX_PAYLOAD: usize = MAXMSGSZ - HEADERSZ - 1;

pub const MAX_SESSIONS: usize = 4096;
pub const MAX_SESSIONS_PER_IP: usize = 16;
pub const MAX_FD_PER_CONN: usize = 16;
pub const MAX_DHND_PER_CONN: usize = 8;
pub const MAX_TCP_CONN: usize = 4096;

/// Sessions idle longer than this are swept.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// TCP connections idle longer than this are dropped.
pub const CONN_TIMEOUT: Duration = Duration::from_secs(600);

/// Loaded-but-closed directory handles older than this are reclaimed.
pub const DIR_HANDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub const STATS_INTERVAL: Duration = Duration::from_secs(60);
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

// TCP keepalive tuning (seconds / probe count).
pub const TCP_KA_IDLE: u32 = 60;
pub const TCP_KA_INTVL: u32 = 30;
pub const TCP_KA_COUNT: u32 = 4;

/// Longest client-supplied path, including the terminator's slot.
pub const MAX_TNFSPATH: usize = 256;
pub const MAX_FILENAME: usize = 256;
/// Longest server root path accepted at startup.
pub const MAX_ROOT: usize = 128;
/// Longest fully composed server-side path.
pub const MAX_FILEPATH: usize = 384;

/// Command opcodes, numbered as in protocol revision 0x0102.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Cmd {
    Mount = 0x00,
    Umount = 0x01,
    OpenDir = 0x10,
    ReadDir = 0x11,
    CloseDir = 0x12,
    MkDir = 0x13,
    RmDir = 0x14,
    TellDir = 0x15,
    SeekDir = 0x16,
    OpenDirX = 0x17,
    ReadDirX = 0x18,
    // 0x20 is the pre-1.2 open without a mode word; kept for old clients.
    OpenOld = 0x20,
    Read = 0x21,
    Write = 0x22,
    Close = 0x23,
    Stat = 0x24,
    Lseek = 0x25,
    Unlink = 0x26,
    Chmod = 0x27,
    Rename = 0x28,
    Open = 0x29,
    Size = 0x30,
    Free = 0x31,
}

/// TNFS reply status byte.
///
/// The table mirrors the classic errno-derived numbering; [`Status::EOF`] is
/// an end-of-sequence marker rather than an error, and [`Status::EBADSESSION`]
/// is what an unknown session id earns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u8);

impl Status {
    pub const OK: Status = Status(0x00);
    pub const EPERM: Status = Status(0x01);
    pub const ENOENT: Status = Status(0x02);
    pub const EIO: Status = Status(0x03);
    pub const ENXIO: Status = Status(0x04);
    pub const EBADF: Status = Status(0x05);
    pub const EAGAIN: Status = Status(0x06);
    pub const ENOMEM: Status = Status(0x07);
    pub const EACCES: Status = Status(0x08);
    pub const EBUSY: Status = Status(0x09);
    pub const EEXIST: Status = Status(0x0A);
    pub const ENOTDIR: Status = Status(0x0B);
    pub const EISDIR: Status = Status(0x0C);
    pub const EINVAL: Status = Status(0x0D);
    pub const ENFILE: Status = Status(0x0E);
    pub const EMFILE: Status = Status(0x0F);
    pub const EFBIG: Status = Status(0x10);
    pub const ENOSPC: Status = Status(0x11);
    pub const ESPIPE: Status = Status(0x12);
    pub const EROFS: Status = Status(0x13);
    pub const ENAMETOOLONG: Status = Status(0x14);
    pub const ENOSYS: Status = Status(0x15);
    pub const ENOTEMPTY: Status = Status(0x16);
    pub const ELOOP: Status = Status(0x17);
    pub const ENODATA: Status = Status(0x18);
    pub const ENOSTR: Status = Status(0x19);
    pub const EPROTO: Status = Status(0x1A);
    pub const EBADFD: Status = Status(0x1B);
    pub const ESRCH: Status = Status(0x1E);
    pub const ETIMEDOUT: Status = Status(0x1F);
    pub const EOF: Status = Status(0x21);
    pub const EBADSESSION: Status = Status(0xFF);
}

bitflags! {
    /// OPENDIRX enumeration options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirOpt: u8 {
        /// Do not group directories ahead of files.
        const NO_FOLDERSFIRST = 0x01;
        /// Include entries whose name starts with a dot.
        const NO_SKIPHIDDEN = 0x02;
        /// Include entries that are neither files nor directories.
        const NO_SKIPSPECIAL = 0x04;
        /// Apply the glob pattern to directories too.
        const DIR_PATTERN = 0x08;
        /// Exclude directories entirely.
        const NO_FOLDERS = 0x10;
        /// Recursive flattened enumeration, with handle reuse.
        const TRAVERSE = 0x20;
    }
}

bitflags! {
    /// OPENDIRX sort options. No bits set means case-insensitive
    /// ascending by name.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SortOpt: u8 {
        /// Keep directory order, skip sorting.
        const NONE = 0x01;
        /// Sort names case-sensitively.
        const CASE = 0x02;
        const DESCENDING = 0x04;
        /// Sort by modification time instead of name.
        const MODIFIED = 0x08;
        /// Sort by file size instead of name.
        const SIZE = 0x10;
    }
}

bitflags! {
    /// Per-entry flags in READDIRX responses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        const DIR = 0x01;
        const HIDDEN = 0x02;
        const SPECIAL = 0x04;
    }
}

/// READDIRX `dir_status` bit: cursor reached the end of the listing.
pub const DIRSTATUS_EOF: u8 = 0x01;

// OPEN flag bits on the wire.
pub const TNFS_O_RDONLY: u16 = 0x0001;
pub const TNFS_O_WRONLY: u16 = 0x0002;
pub const TNFS_O_RDWR: u16 = 0x0003;
pub const TNFS_O_APPEND: u16 = 0x0008;
pub const TNFS_O_CREAT: u16 = 0x0100;
pub const TNFS_O_TRUNC: u16 = 0x0200;
pub const TNFS_O_EXCL: u16 = 0x0400;

/// Request header: `sid | seq | cmd`. Replies append a status byte.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Header {
    pub sid: U16,
    pub seq: u8,
    pub cmd: u8,
}

/// Successful MOUNT reply payload.
#[repr(C)]
#[derive(Debug, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MountReply {
    pub sid: U16,
    pub version: U16,
    pub min_retry: U16,
}

/// Fixed part of the OPENDIRX request, ahead of the pattern and path strings.
#[repr(C)]
#[derive(Debug, FromBytes, KnownLayout, Immutable, Unaligned)]
pub struct OpenDirXArgs {
    pub diropt: u8,
    pub sortopt: u8,
    pub maxresults: U16,
}

/// OPENDIRX reply payload.
#[repr(C)]
#[derive(Debug, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct OpenDirXReply {
    pub handle: u8,
    pub count: U16,
}

/// Fixed head of a READDIRX reply, ahead of the packed entries.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReadDirXReply {
    pub count: u8,
    pub dir_status: u8,
    pub dirpos: U16,
}

/// Fixed part of one READDIRX entry; the NUL-terminated name follows.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DirEntryHeader {
    pub flags: u8,
    pub size: U32,
    pub mtime: U32,
    pub ctime: U32,
}

/// Size of one packed entry on the wire, including the name terminator.
pub const fn direntry_wire_len(name_len: usize) -> usize {
    size_of::<DirEntryHeader>() + name_len + 1
}

/// STAT reply payload head; two NUL-terminated owner name strings follow.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct StatReply {
    pub mode: U16,
    pub uid: U16,
    pub gid: U16,
    pub size: U32,
    pub atime: U32,
    pub mtime: U32,
    pub ctime: U32,
}

/// LSEEK argument block following the fd byte.
#[repr(C)]
#[derive(Debug, FromBytes, KnownLayout, Immutable, Unaligned)]
pub struct LseekArgs {
    pub whence: u8,
    pub offset: I32,
}

pub const TNFS_SEEK_SET: u8 = 0x00;
pub const TNFS_SEEK_CUR: u8 = 0x01;
pub const TNFS_SEEK_END: u8 = 0x02;
