//! The TNFS server object and protocol dispatcher.
//!
//! [`Tnfsd`] owns the served root, the session table, and the stats
//! counters. The dispatcher is a pure `(source, bytes) -> reply bytes`
//! function over that state, so both transports and the integration tests
//! drive it the same way. Every accepted request produces exactly one reply;
//! a retransmitted request is answered from the per-session cache without
//! re-executing anything.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info, warn};

use crate::dir;
use crate::ll::errno::status_from_io_error;
use crate::ll::reply::Reply;
use crate::ll::request::{Operation, Request, op};
use crate::ll::tnfs_abi::{
    Cmd, DirOpt, MAX_PAYLOAD, MAX_ROOT, MIN_RETRY_MS, MountReply, OpenDirXReply, PROTOVERSION,
    SESSION_TIMEOUT, STATS_INTERVAL, SortOpt, StatReply, Status, TNFS_O_APPEND, TNFS_O_CREAT,
    TNFS_O_EXCL, TNFS_O_RDONLY, TNFS_O_RDWR, TNFS_O_TRUNC, TNFS_O_WRONLY, TNFS_SEEK_CUR,
    TNFS_SEEK_END, TNFS_SEEK_SET,
};
use crate::resolve::{resolve, resolve_mountpoint};
use crate::session::{FileHandle, Session, SessionTable};

/// Traffic counters, reported on the stats tick.
#[derive(Debug, Default)]
struct Stats {
    datagrams_in: u64,
    replies_out: u64,
    errors: u64,
}

/// A TNFS server instance: one served root, one session table.
#[derive(Debug)]
pub struct Tnfsd {
    root: PathBuf,
    sessions: SessionTable,
    stats: Stats,
    last_stats: Option<Instant>,
}

impl Tnfsd {
    /// Create a server for `root` with the default session timeout. Fails if
    /// the root does not resolve to a directory.
    pub fn new(root: &Path) -> io::Result<Tnfsd> {
        Tnfsd::with_timeout(root, Some(SESSION_TIMEOUT))
    }

    /// Create a server with an explicit session timeout; `None` disables
    /// the inactivity sweep.
    pub fn with_timeout(
        root: &Path,
        timeout: Option<std::time::Duration>,
    ) -> io::Result<Tnfsd> {
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", root.display()),
            ));
        }
        if root.as_os_str().len() > MAX_ROOT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("root path exceeds {MAX_ROOT} bytes"),
            ));
        }
        Ok(Tnfsd {
            root,
            sessions: SessionTable::new(timeout),
            stats: Stats::default(),
            last_stats: None,
        })
    }

    /// The canonicalized directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Free all sessions bound to a dropped TCP connection.
    pub fn reset_cli_fd(&mut self, fd: RawFd) {
        self.sessions.reset_cli_fd(fd);
    }

    /// Periodic housekeeping: session and handle sweeps plus the stats line.
    pub fn tick(&mut self, now: Instant) {
        self.sessions.sweep(now);
        let due = match self.last_stats {
            Some(at) => now.duration_since(at) >= STATS_INTERVAL,
            None => true,
        };
        if due {
            self.last_stats = Some(now);
            info!(
                "sessions {}, in {}, out {}, errors {}",
                self.sessions.len(),
                self.stats.datagrams_in,
                self.stats.replies_out,
                self.stats.errors
            );
        }
    }

    /// Process one message from `src`. Returns the reply to send back, or
    /// `None` when the message must be silently dropped (malformed size,
    /// source mismatch).
    pub fn handle_message(
        &mut self,
        src: SocketAddr,
        cli_fd: Option<RawFd>,
        msg: &[u8],
        now: Instant,
    ) -> Option<Vec<u8>> {
        self.stats.datagrams_in += 1;
        let req = match Request::new(msg) {
            Ok(req) => req,
            Err(err) => {
                debug!("dropping message from {src}: {err}");
                return None;
            }
        };
        let cmd = match req.cmd() {
            Ok(cmd) => cmd,
            Err(err) => {
                debug!("{src}: {err}");
                self.stats.errors += 1;
                self.stats.replies_out += 1;
                return Some(
                    Reply::error(Status::ENOSYS).encode(req.sid(), req.seq(), req.cmd_byte()),
                );
            }
        };

        if cmd == Cmd::Mount {
            let encoded = self.handle_mount(src, cli_fd, &req, now);
            self.stats.replies_out += 1;
            return Some(encoded);
        }

        // Everything else runs in an existing session.
        {
            let Some(session) = self.sessions.find_mut_by_sid(req.sid()) else {
                debug!("{src}: no session 0x{:04x}", req.sid());
                self.stats.errors += 1;
                self.stats.replies_out += 1;
                return Some(
                    Reply::error(Status::EBADSESSION).encode(req.sid(), req.seq(), req.cmd_byte()),
                );
            };
            let source_ok = match cli_fd {
                Some(fd) => session.cli_fd() == Some(fd),
                None => session.cli_fd().is_none() && session.client_addr().ip() == src.ip(),
            };
            if !source_ok {
                debug!(
                    "discarding request for 0x{:04x}: source {} does not own it",
                    req.sid(),
                    src
                );
                return None;
            }
            session.touch(now);
            if let Some(cached) = session.retransmit(req.seq()) {
                debug!("0x{:04x}: replaying reply for seq {}", req.sid(), req.seq());
                self.stats.replies_out += 1;
                return Some(cached.to_vec());
            }
            session.note_request(req.seq());
        }

        if cmd == Cmd::Umount {
            let encoded = Reply::ok().encode(req.sid(), req.seq(), req.cmd_byte());
            self.sessions.free(req.sid());
            self.stats.replies_out += 1;
            return Some(encoded);
        }

        let Tnfsd {
            root,
            sessions,
            stats,
            ..
        } = self;
        // The session was just verified; the re-borrow keeps the table free
        // for the UMOUNT path above.
        let Some(session) = sessions.find_mut_by_sid(req.sid()) else {
            return None;
        };
        let reply = match req.operation() {
            Ok(operation) => {
                dispatch(root, session, operation, now).unwrap_or_else(Reply::error)
            }
            Err(err) => {
                debug!("0x{:04x}: {err}", req.sid());
                Reply::error(Status::EINVAL)
            }
        };
        if reply.status() != Status::OK {
            stats.errors += 1;
        }
        let encoded = reply.encode(req.sid(), req.seq(), req.cmd_byte());
        session.cache_reply(&encoded);
        stats.replies_out += 1;
        Some(encoded)
    }

    fn handle_mount(
        &mut self,
        src: SocketAddr,
        cli_fd: Option<RawFd>,
        req: &Request<'_>,
        now: Instant,
    ) -> Vec<u8> {
        let result = match req.operation() {
            Ok(Operation::Mount(args)) => self.do_mount(src, cli_fd, args, now),
            Ok(_) | Err(_) => Err(Status::EINVAL),
        };
        match result {
            Ok((sid, reply)) => {
                let encoded = reply.encode(sid, req.seq(), req.cmd_byte());
                if let Some(session) = self.sessions.find_mut_by_sid(sid) {
                    session.note_request(req.seq());
                    session.cache_reply(&encoded);
                }
                encoded
            }
            Err(status) => {
                self.stats.errors += 1;
                Reply::error(status).encode(req.sid(), req.seq(), req.cmd_byte())
            }
        }
    }

    fn do_mount(
        &mut self,
        src: SocketAddr,
        cli_fd: Option<RawFd>,
        args: op::Mount<'_>,
        now: Instant,
    ) -> Result<(u16, Reply), Status> {
        debug!(
            "mount v{:04x} of {:?} from {}",
            args.version, args.mountpoint, src
        );
        let session_root = resolve_mountpoint(&self.root, args.mountpoint)?;

        // A client mounting the same mountpoint again from the same endpoint
        // replaces its previous session rather than leaking it until the
        // sweep. Sessions for other mountpoints are left alone.
        let prior = match cli_fd {
            Some(fd) => self
                .sessions
                .iter()
                .find(|s| s.cli_fd() == Some(fd) && s.root == session_root)
                .map(|s| s.sid()),
            None => self.sessions.find_sid_by_mount(src, &session_root),
        };
        if let Some(sid) = prior {
            info!("remount from {src} replaces session 0x{sid:04x}");
            self.sessions.free(sid);
        }

        let session = self.sessions.alloc(src, cli_fd, session_root, now)?;
        let sid = session.sid();
        let reply = Reply::from_struct(&MountReply {
            sid: sid.into(),
            version: PROTOVERSION.into(),
            min_retry: MIN_RETRY_MS.into(),
        });
        Ok((sid, reply))
    }
}

/// Route a parsed operation to its handler. MOUNT and UMOUNT never reach
/// this point.
fn dispatch(
    root: &Path,
    session: &mut Session,
    operation: Operation<'_>,
    now: Instant,
) -> Result<Reply, Status> {
    match operation {
        Operation::Mount(_) | Operation::Umount => Err(Status::EINVAL),
        Operation::Open(args) => open_file(root, session, args),
        Operation::Read(args) => read_file(session, args),
        Operation::Write(args) => write_file(session, args),
        Operation::Close(args) => session.close_fd(args.fd).map(|()| Reply::ok()),
        Operation::Lseek(args) => lseek_file(session, args),
        Operation::Stat(args) => stat_path(root, session, args),
        Operation::Unlink(args) => {
            let path = resolve(root, &session.root, args.path)?;
            std::fs::remove_file(path).map_err(|e| status_from_io_error(&e))?;
            Ok(Reply::ok())
        }
        Operation::Chmod(args) => {
            let path = resolve(root, &session.root, args.path)?;
            let perms = std::fs::Permissions::from_mode(args.mode as u32);
            std::fs::set_permissions(path, perms).map_err(|e| status_from_io_error(&e))?;
            Ok(Reply::ok())
        }
        Operation::Rename(args) => {
            let from = resolve(root, &session.root, args.from)?;
            let to = resolve(root, &session.root, args.to)?;
            std::fs::rename(from, to).map_err(|e| status_from_io_error(&e))?;
            Ok(Reply::ok())
        }
        Operation::MkDir(args) => {
            let path = resolve(root, &session.root, args.path)?;
            std::fs::create_dir(path).map_err(|e| status_from_io_error(&e))?;
            Ok(Reply::ok())
        }
        Operation::RmDir(args) => {
            let path = resolve(root, &session.root, args.path)?;
            std::fs::remove_dir(path).map_err(|e| status_from_io_error(&e))?;
            Ok(Reply::ok())
        }
        Operation::OpenDir(args) => open_dir(root, session, args, now),
        Operation::ReadDir(args) => {
            let handle = session.dirs.get_open_mut(args.handle)?;
            match handle.next_name() {
                Some(name) => {
                    let mut reply = Reply::ok();
                    reply.push_cstr(name);
                    Ok(reply)
                }
                None => Err(Status::EOF),
            }
        }
        Operation::CloseDir(args) => session.dirs.close(args.handle).map(|()| Reply::ok()),
        Operation::TellDir(args) => {
            let handle = session.dirs.get_open_mut(args.handle)?;
            Ok(Reply::from_struct(&handle.telldir().to_le_bytes()))
        }
        Operation::SeekDir(args) => {
            let handle = session.dirs.get_open_mut(args.handle)?;
            handle.seekdir(args.pos);
            Ok(Reply::ok())
        }
        Operation::OpenDirX(args) => open_dir_x(root, session, args, now),
        Operation::ReadDirX(args) => {
            let handle = session.dirs.get_open_mut(args.handle)?;
            Ok(handle.read_batch(args.count))
        }
        Operation::Size => fs_space(root, false),
        Operation::Free => fs_space(root, true),
    }
}

fn open_file(root: &Path, session: &mut Session, args: op::Open<'_>) -> Result<Reply, Status> {
    let path = resolve(root, &session.root, args.path)?;
    let mut options = OpenOptions::new();
    match args.flags & TNFS_O_RDWR {
        TNFS_O_RDONLY => options.read(true),
        TNFS_O_WRONLY => options.write(true),
        TNFS_O_RDWR => options.read(true).write(true),
        _ => return Err(Status::EINVAL),
    };
    if args.flags & TNFS_O_APPEND != 0 {
        options.append(true);
    }
    if args.flags & TNFS_O_CREAT != 0 {
        options.create(true).mode(args.mode as u32);
    }
    if args.flags & TNFS_O_TRUNC != 0 {
        options.truncate(true);
    }
    if args.flags & TNFS_O_EXCL != 0 {
        options.create_new(true);
    }
    let file = options.open(&path).map_err(|e| status_from_io_error(&e))?;
    debug!("sid 0x{:04x} opened {:?}", session.sid(), path);
    let fd = session.alloc_fd(FileHandle { file, path })?;
    Ok(Reply::from_struct(&fd))
}

fn read_file(session: &mut Session, args: op::Read) -> Result<Reply, Status> {
    let count = (args.count as usize).min(MAX_PAYLOAD - 2);
    let handle = session.fd_mut(args.fd)?;
    let mut buf = vec![0u8; count];
    let n = handle
        .file
        .read(&mut buf)
        .map_err(|e| status_from_io_error(&e))?;
    if n == 0 {
        return Err(Status::EOF);
    }
    let mut reply = Reply::ok();
    reply.push_bytes(&(n as u16).to_le_bytes());
    reply.push_bytes(&buf[..n]);
    Ok(reply)
}

fn write_file(session: &mut Session, args: op::Write<'_>) -> Result<Reply, Status> {
    let handle = session.fd_mut(args.fd)?;
    let n = handle
        .file
        .write(args.data)
        .map_err(|e| status_from_io_error(&e))?;
    Ok(Reply::from_struct(&(n as u16).to_le_bytes()))
}

fn lseek_file(session: &mut Session, args: op::Lseek) -> Result<Reply, Status> {
    let handle = session.fd_mut(args.fd)?;
    let target = match args.whence {
        TNFS_SEEK_SET => SeekFrom::Start(args.offset.max(0) as u64),
        TNFS_SEEK_CUR => SeekFrom::Current(args.offset as i64),
        TNFS_SEEK_END => SeekFrom::End(args.offset as i64),
        _ => return Err(Status::EINVAL),
    };
    let pos = handle
        .file
        .seek(target)
        .map_err(|e| status_from_io_error(&e))?;
    let pos = pos.min(u32::MAX as u64) as u32;
    Ok(Reply::from_struct(&pos.to_le_bytes()))
}

fn stat_path(root: &Path, session: &Session, args: op::Stat<'_>) -> Result<Reply, Status> {
    let path = resolve(root, &session.root, args.path)?;
    let meta = std::fs::metadata(path).map_err(|e| status_from_io_error(&e))?;
    let mut reply = Reply::from_struct(&StatReply {
        mode: (meta.mode() as u16).into(),
        uid: (meta.uid() as u16).into(),
        gid: (meta.gid() as u16).into(),
        size: (meta.len().min(u32::MAX as u64) as u32).into(),
        atime: (meta.atime().clamp(0, u32::MAX as i64) as u32).into(),
        mtime: (meta.mtime().clamp(0, u32::MAX as i64) as u32).into(),
        ctime: (meta.ctime().clamp(0, u32::MAX as i64) as u32).into(),
    });
    // Owner names are empty strings, as the reference daemon sends them.
    reply.push_bytes(&[0, 0]);
    Ok(reply)
}

fn open_dir(
    root: &Path,
    session: &mut Session,
    args: op::OpenDir<'_>,
    now: Instant,
) -> Result<Reply, Status> {
    let path = resolve(root, &session.root, args.path)?;
    let (handle, _) = session
        .dirs
        .allocate(now, &path, DirOpt::empty(), SortOpt::NONE, b"")?;
    if let Err(status) = dir::load_raw(session.dirs.get_open_mut(handle)?) {
        session.dirs.release(handle);
        return Err(status);
    }
    Ok(Reply::from_struct(&handle))
}

fn open_dir_x(
    root: &Path,
    session: &mut Session,
    args: op::OpenDirX<'_>,
    now: Instant,
) -> Result<Reply, Status> {
    let diropt = DirOpt::from_bits_truncate(args.diropt);
    let sortopt = SortOpt::from_bits_truncate(args.sortopt);
    let path = resolve(root, &session.root, args.path)?;
    let (handle, reused) = session
        .dirs
        .allocate(now, &path, diropt, sortopt, args.pattern)?;
    if !reused {
        if let Err(status) = dir::load(session.dirs.get_open_mut(handle)?, args.maxresults) {
            session.dirs.release(handle);
            return Err(status);
        }
    }
    let count = session
        .dirs
        .get_open_mut(handle)?
        .entry_count()
        .min(u16::MAX as usize) as u16;
    Ok(Reply::from_struct(&OpenDirXReply {
        handle,
        count: count.into(),
    }))
}

fn fs_space(root: &Path, available: bool) -> Result<Reply, Status> {
    let vfs = nix::sys::statvfs::statvfs(root).map_err(|errno| {
        warn!("statvfs of {:?} failed: {errno}", root);
        crate::ll::errno::status_from_errno(errno as i32)
    })?;
    let blocks = if available {
        vfs.blocks_available() as u64
    } else {
        vfs.blocks() as u64
    };
    let kb = blocks.saturating_mul(vfs.fragment_size() as u64) / 1024;
    let kb = kb.min(u32::MAX as u64) as u32;
    Ok(Reply::from_struct(&kb.to_le_bytes()))
}
