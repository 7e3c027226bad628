//! Client sessions.
//!
//! A session begins with a MOUNT and ends with a UMOUNT, an inactivity
//! sweep, or (for TCP clients) a dropped connection. While it lives, the
//! session owns its open file handles, its directory handle table, and the
//! retransmit cache that makes replies idempotent over an unreliable
//! transport.

use std::fs::File;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::dir::DirTable;
use crate::ll::tnfs_abi::{MAX_FD_PER_CONN, MAX_SESSIONS, MAX_SESSIONS_PER_IP, Status};

/// One open file owned by a session.
#[derive(Debug)]
pub(crate) struct FileHandle {
    pub file: File,
    pub path: PathBuf,
}

/// Live client session state.
#[derive(Debug)]
pub(crate) struct Session {
    sid: u16,
    client_addr: SocketAddr,
    /// Owning TCP connection, if the session was mounted over TCP.
    cli_fd: Option<RawFd>,
    /// Mount subpath below the global root; empty for a root mount.
    pub root: PathBuf,
    last_contact: Instant,
    /// Sequence number of the last executed request. `None` until the first
    /// request so a legitimate seq 0 is not mistaken for a retransmit.
    last_seq: Option<u8>,
    /// Exact bytes of the last reply, replayed on retransmit.
    last_reply: Vec<u8>,
    file_handles: [Option<FileHandle>; MAX_FD_PER_CONN],
    pub dirs: DirTable,
}

impl Session {
    pub(crate) fn sid(&self) -> u16 {
        self.sid
    }

    pub(crate) fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub(crate) fn cli_fd(&self) -> Option<RawFd> {
        self.cli_fd
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_contact = now;
    }

    /// The cached reply, if `seq` repeats the last executed request.
    pub(crate) fn retransmit(&self, seq: u8) -> Option<&[u8]> {
        if self.last_seq == Some(seq) && !self.last_reply.is_empty() {
            Some(&self.last_reply)
        } else {
            None
        }
    }

    pub(crate) fn note_request(&mut self, seq: u8) {
        self.last_seq = Some(seq);
        self.last_reply.clear();
    }

    pub(crate) fn cache_reply(&mut self, reply: &[u8]) {
        self.last_reply = reply.to_vec();
    }

    /// Place an opened file in the lowest free slot; the slot index is the
    /// fd byte on the wire.
    pub(crate) fn alloc_fd(&mut self, handle: FileHandle) -> Result<u8, Status> {
        for (i, slot) in self.file_handles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(i as u8);
            }
        }
        Err(Status::EMFILE)
    }

    pub(crate) fn fd_mut(&mut self, fd: u8) -> Result<&mut FileHandle, Status> {
        if fd as usize >= MAX_FD_PER_CONN {
            return Err(Status::EBADF);
        }
        self.file_handles[fd as usize].as_mut().ok_or(Status::EBADF)
    }

    pub(crate) fn close_fd(&mut self, fd: u8) -> Result<(), Status> {
        if fd as usize >= MAX_FD_PER_CONN {
            return Err(Status::EBADF);
        }
        match self.file_handles[fd as usize].take() {
            Some(handle) => {
                debug!("sid 0x{:04x} closed {:?}", self.sid, handle.path);
                Ok(())
            }
            None => Err(Status::EBADF),
        }
    }
}

/// The fixed-capacity table of live sessions.
#[derive(Debug)]
pub(crate) struct SessionTable {
    slots: Vec<Option<Session>>,
    next_sid: u16,
    timeout: Option<Duration>,
}

impl SessionTable {
    /// `timeout: None` disables the inactivity sweep.
    pub(crate) fn new(timeout: Option<Duration>) -> SessionTable {
        let mut slots = Vec::new();
        slots.resize_with(MAX_SESSIONS, || None);
        SessionTable {
            slots,
            next_sid: 0,
            timeout,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Allocate a session for `client_addr`. Fails with EMFILE when the
    /// table is full and EACCES when the address already holds its share.
    pub(crate) fn alloc(
        &mut self,
        client_addr: SocketAddr,
        cli_fd: Option<RawFd>,
        root: PathBuf,
        now: Instant,
    ) -> Result<&mut Session, Status> {
        let per_ip = self
            .iter()
            .filter(|s| s.client_addr.ip() == client_addr.ip())
            .count();
        if per_ip >= MAX_SESSIONS_PER_IP {
            return Err(Status::EACCES);
        }
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Status::EMFILE)?;
        let sid = self.fresh_sid();
        info!("new session 0x{sid:04x} for {client_addr} at {root:?}");
        self.slots[slot] = Some(Session {
            sid,
            client_addr,
            cli_fd,
            root,
            last_contact: now,
            last_seq: None,
            last_reply: Vec::new(),
            file_handles: Default::default(),
            dirs: DirTable::default(),
        });
        Ok(self.slots[slot].as_mut().unwrap())
    }

    /// Next unused non-zero sid. The counter plus collision probe keeps
    /// allocation O(live sessions) and hands out sid 1 on a fresh table.
    fn fresh_sid(&mut self) -> u16 {
        loop {
            self.next_sid = self.next_sid.wrapping_add(1);
            let candidate = self.next_sid;
            if candidate != 0 && self.find_by_sid(candidate).is_none() {
                return candidate;
            }
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().flatten()
    }

    pub(crate) fn find_by_sid(&self, sid: u16) -> Option<&Session> {
        self.iter().find(|s| s.sid == sid)
    }

    pub(crate) fn find_mut_by_sid(&mut self, sid: u16) -> Option<&mut Session> {
        self.slots.iter_mut().flatten().find(|s| s.sid == sid)
    }

    /// The session a given peer address holds over UDP for `root`, if any.
    /// A client may hold sessions for several mountpoints at once, so the
    /// mountpoint is part of the identity here.
    pub(crate) fn find_sid_by_mount(&self, addr: SocketAddr, root: &Path) -> Option<u16> {
        self.iter()
            .find(|s| s.cli_fd.is_none() && s.client_addr == addr && s.root == root)
            .map(|s| s.sid)
    }

    pub(crate) fn free(&mut self, sid: u16) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|s| s.sid == sid) {
                if let Some(mut session) = slot.take() {
                    info!(
                        "session 0x{:04x} for {} closed",
                        session.sid, session.client_addr
                    );
                    session.dirs.close_all();
                }
                return;
            }
        }
    }

    /// Free sessions idle past the timeout and expire their cached
    /// directory listings.
    pub(crate) fn sweep(&mut self, now: Instant) {
        if let Some(timeout) = self.timeout {
            for slot in &mut self.slots {
                if let Some(session) = slot {
                    if now.duration_since(session.last_contact) > timeout {
                        info!(
                            "session 0x{:04x} for {} timed out",
                            session.sid, session.client_addr
                        );
                        *slot = None;
                    }
                }
            }
        }
        for session in self.slots.iter_mut().flatten() {
            session.dirs.sweep(now);
        }
    }

    /// Free every session bound to a TCP connection that just went away.
    pub(crate) fn reset_cli_fd(&mut self, fd: RawFd) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|s| s.cli_fd == Some(fd)) {
                let session = slot.take().unwrap();
                info!(
                    "session 0x{:04x} dropped with its connection ({})",
                    session.sid, session.client_addr
                );
            }
        }
    }
}
