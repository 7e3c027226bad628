//! Low-level TNFS request.
//!
//! A request represents one datagram (or framed TCP message) a client sent.
//! Parsing happens in two steps: [`Request::new`] validates the size bounds
//! and the header, and [`Request::operation`] decomposes the payload into the
//! typed per-command argument structs.

use std::{error, fmt};

use super::argument::ArgumentIterator;
use super::tnfs_abi::{Cmd, HEADERSZ, Header, LseekArgs, MAX_TNFSPATH, MAXMSGSZ, OpenDirXArgs};
use zerocopy::FromBytes;
use zerocopy::byteorder::little_endian::{U16, U32};

/// Error that may occur while parsing a message from a client.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestError {
    /// Message too short to carry a header.
    ShortRead(usize),
    /// Message exceeds the protocol's datagram bound.
    TooLarge(usize),
    /// Client sent an opcode we do not know.
    UnknownCommand(u8),
    /// Payload too short, string unterminated, or string over the path bound.
    InsufficientData,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortRead(len) => {
                write!(f, "short read of TNFS header ({len} < {HEADERSZ})")
            }
            RequestError::TooLarge(len) => {
                write!(f, "message of {len} bytes exceeds {MAXMSGSZ}")
            }
            RequestError::UnknownCommand(cmd) => write!(f, "unknown TNFS command (0x{cmd:02x})"),
            RequestError::InsufficientData => write!(f, "insufficient argument data"),
        }
    }
}

impl error::Error for RequestError {}

pub(crate) mod op {
    //! Typed argument views into a request payload.
    use std::ffi::OsStr;

    #[derive(Debug)]
    pub struct Mount<'a> {
        pub version: u16,
        pub mountpoint: &'a OsStr,
        // Credentials ride along on the wire but carry no weight here: the
        // daemon serves a single anonymous export.
        pub userid: &'a OsStr,
        pub password: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Open<'a> {
        pub flags: u16,
        pub mode: u16,
        pub path: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Read {
        pub fd: u8,
        pub count: u16,
    }
    #[derive(Debug)]
    pub struct Write<'a> {
        pub fd: u8,
        pub data: &'a [u8],
    }
    #[derive(Debug)]
    pub struct Close {
        pub fd: u8,
    }
    #[derive(Debug)]
    pub struct Lseek {
        pub fd: u8,
        pub whence: u8,
        pub offset: i32,
    }
    #[derive(Debug)]
    pub struct Stat<'a> {
        pub path: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Unlink<'a> {
        pub path: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Chmod<'a> {
        pub mode: u16,
        pub path: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct Rename<'a> {
        pub from: &'a OsStr,
        pub to: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct MkDir<'a> {
        pub path: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct RmDir<'a> {
        pub path: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct OpenDir<'a> {
        pub path: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct ReadDir {
        pub handle: u8,
    }
    #[derive(Debug)]
    pub struct CloseDir {
        pub handle: u8,
    }
    #[derive(Debug)]
    pub struct TellDir {
        pub handle: u8,
    }
    #[derive(Debug)]
    pub struct SeekDir {
        pub handle: u8,
        pub pos: u32,
    }
    #[derive(Debug)]
    pub struct OpenDirX<'a> {
        pub diropt: u8,
        pub sortopt: u8,
        pub maxresults: u16,
        pub pattern: &'a [u8],
        pub path: &'a OsStr,
    }
    #[derive(Debug)]
    pub struct ReadDirX {
        pub handle: u8,
        pub count: u8,
    }
}

/// Parsed command arguments, one variant per opcode.
#[derive(Debug)]
pub(crate) enum Operation<'a> {
    Mount(op::Mount<'a>),
    Umount,
    Open(op::Open<'a>),
    Read(op::Read),
    Write(op::Write<'a>),
    Close(op::Close),
    Lseek(op::Lseek),
    Stat(op::Stat<'a>),
    Unlink(op::Unlink<'a>),
    Chmod(op::Chmod<'a>),
    Rename(op::Rename<'a>),
    MkDir(op::MkDir<'a>),
    RmDir(op::RmDir<'a>),
    OpenDir(op::OpenDir<'a>),
    ReadDir(op::ReadDir),
    CloseDir(op::CloseDir),
    TellDir(op::TellDir),
    SeekDir(op::SeekDir),
    OpenDirX(op::OpenDirX<'a>),
    ReadDirX(op::ReadDirX),
    Size,
    Free,
}

/// One validated incoming message: header plus raw payload.
#[derive(Debug)]
pub(crate) struct Request<'a> {
    header: Header,
    data: &'a [u8],
}

impl<'a> Request<'a> {
    /// Validate the size bounds and split off the header.
    pub(crate) fn new(data: &'a [u8]) -> Result<Request<'a>, RequestError> {
        if data.len() < HEADERSZ {
            return Err(RequestError::ShortRead(data.len()));
        }
        if data.len() > MAXMSGSZ {
            return Err(RequestError::TooLarge(data.len()));
        }
        let (header, payload) =
            Header::read_from_prefix(data).map_err(|_| RequestError::ShortRead(data.len()))?;
        Ok(Request {
            header,
            data: payload,
        })
    }

    pub(crate) fn sid(&self) -> u16 {
        self.header.sid.get()
    }

    pub(crate) fn seq(&self) -> u8 {
        self.header.seq
    }

    pub(crate) fn cmd_byte(&self) -> u8 {
        self.header.cmd
    }

    pub(crate) fn cmd(&self) -> Result<Cmd, RequestError> {
        Cmd::try_from(self.header.cmd).map_err(|_| RequestError::UnknownCommand(self.header.cmd))
    }

    /// Decompose the payload into the typed arguments of the command.
    pub(crate) fn operation(&self) -> Result<Operation<'a>, RequestError> {
        fn path_str<'b>(it: &mut ArgumentIterator<'b>) -> Result<&'b std::ffi::OsStr, RequestError> {
            let s = it.fetch_str().ok_or(RequestError::InsufficientData)?;
            if s.len() > MAX_TNFSPATH {
                return Err(RequestError::InsufficientData);
            }
            Ok(s)
        }

        let mut it = ArgumentIterator::new(self.data);
        let op = match self.cmd()? {
            Cmd::Mount => {
                let version = it
                    .fetch::<U16>()
                    .ok_or(RequestError::InsufficientData)?
                    .get();
                Operation::Mount(op::Mount {
                    version,
                    mountpoint: path_str(&mut it)?,
                    userid: it.fetch_str().ok_or(RequestError::InsufficientData)?,
                    password: it.fetch_str().ok_or(RequestError::InsufficientData)?,
                })
            }
            Cmd::Umount => Operation::Umount,
            Cmd::Open => {
                let flags = it
                    .fetch::<U16>()
                    .ok_or(RequestError::InsufficientData)?
                    .get();
                let mode = it
                    .fetch::<U16>()
                    .ok_or(RequestError::InsufficientData)?
                    .get();
                Operation::Open(op::Open {
                    flags,
                    mode,
                    path: path_str(&mut it)?,
                })
            }
            Cmd::OpenOld => {
                let flags = it
                    .fetch::<U16>()
                    .ok_or(RequestError::InsufficientData)?
                    .get();
                Operation::Open(op::Open {
                    flags,
                    mode: 0o644,
                    path: path_str(&mut it)?,
                })
            }
            Cmd::Read => {
                let fd = it.fetch_u8().ok_or(RequestError::InsufficientData)?;
                let count = it
                    .fetch::<U16>()
                    .ok_or(RequestError::InsufficientData)?
                    .get();
                Operation::Read(op::Read { fd, count })
            }
            Cmd::Write => {
                let fd = it.fetch_u8().ok_or(RequestError::InsufficientData)?;
                let count = it
                    .fetch::<U16>()
                    .ok_or(RequestError::InsufficientData)?
                    .get() as usize;
                let data = it.fetch_all();
                // A datagram cut short on the way loses data bytes; honor
                // whatever arrived rather than reading past the message.
                let len = count.min(data.len());
                Operation::Write(op::Write {
                    fd,
                    data: &data[..len],
                })
            }
            Cmd::Close => Operation::Close(op::Close {
                fd: it.fetch_u8().ok_or(RequestError::InsufficientData)?,
            }),
            Cmd::Lseek => {
                let fd = it.fetch_u8().ok_or(RequestError::InsufficientData)?;
                let args = it
                    .fetch::<LseekArgs>()
                    .ok_or(RequestError::InsufficientData)?;
                Operation::Lseek(op::Lseek {
                    fd,
                    whence: args.whence,
                    offset: args.offset.get(),
                })
            }
            Cmd::Stat => Operation::Stat(op::Stat {
                path: path_str(&mut it)?,
            }),
            Cmd::Unlink => Operation::Unlink(op::Unlink {
                path: path_str(&mut it)?,
            }),
            Cmd::Chmod => {
                let mode = it
                    .fetch::<U16>()
                    .ok_or(RequestError::InsufficientData)?
                    .get();
                Operation::Chmod(op::Chmod {
                    mode,
                    path: path_str(&mut it)?,
                })
            }
            Cmd::Rename => Operation::Rename(op::Rename {
                from: path_str(&mut it)?,
                to: path_str(&mut it)?,
            }),
            Cmd::MkDir => Operation::MkDir(op::MkDir {
                path: path_str(&mut it)?,
            }),
            Cmd::RmDir => Operation::RmDir(op::RmDir {
                path: path_str(&mut it)?,
            }),
            Cmd::OpenDir => Operation::OpenDir(op::OpenDir {
                path: path_str(&mut it)?,
            }),
            Cmd::ReadDir => Operation::ReadDir(op::ReadDir {
                handle: it.fetch_u8().ok_or(RequestError::InsufficientData)?,
            }),
            Cmd::CloseDir => Operation::CloseDir(op::CloseDir {
                handle: it.fetch_u8().ok_or(RequestError::InsufficientData)?,
            }),
            Cmd::TellDir => Operation::TellDir(op::TellDir {
                handle: it.fetch_u8().ok_or(RequestError::InsufficientData)?,
            }),
            Cmd::SeekDir => {
                let handle = it.fetch_u8().ok_or(RequestError::InsufficientData)?;
                let pos = it
                    .fetch::<U32>()
                    .ok_or(RequestError::InsufficientData)?
                    .get();
                Operation::SeekDir(op::SeekDir { handle, pos })
            }
            Cmd::OpenDirX => {
                let args = it
                    .fetch::<OpenDirXArgs>()
                    .ok_or(RequestError::InsufficientData)?;
                let first = path_str(&mut it)?;
                // Two strings mean pattern then path; a single string is the
                // path with no pattern.
                let (pattern, path) = match it.fetch_str() {
                    Some(second) => {
                        if second.len() > MAX_TNFSPATH {
                            return Err(RequestError::InsufficientData);
                        }
                        (std::os::unix::ffi::OsStrExt::as_bytes(first), second)
                    }
                    None => (&b""[..], first),
                };
                Operation::OpenDirX(op::OpenDirX {
                    diropt: args.diropt,
                    sortopt: args.sortopt,
                    maxresults: args.maxresults.get(),
                    pattern,
                    path,
                })
            }
            Cmd::ReadDirX => {
                let handle = it.fetch_u8().ok_or(RequestError::InsufficientData)?;
                let count = it.fetch_u8().ok_or(RequestError::InsufficientData)?;
                Operation::ReadDirX(op::ReadDirX { handle, count })
            }
            Cmd::Size => Operation::Size,
            Cmd::Free => Operation::Free,
        };
        Ok(op)
    }
}

impl<'a> fmt::Display for Request<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TNFS request sid=0x{:04x} seq={} cmd=0x{:02x} ({} payload bytes)",
            self.sid(),
            self.seq(),
            self.cmd_byte(),
            self.data.len()
        )
    }
}
