//! End-to-end dispatcher tests: raw datagrams in, raw replies out, no
//! sockets involved.

use std::fs::{self, File};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Instant;

use tempfile::TempDir;
use tnfsd::Tnfsd;
use tnfsd::tnfs_abi::{Cmd, MAX_DHND_PER_CONN, MAX_FD_PER_CONN, Status};

fn client_addr(host: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, host)), port)
}

fn message(sid: u16, seq: u8, cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut msg = sid.to_le_bytes().to_vec();
    msg.push(seq);
    msg.push(cmd);
    msg.extend_from_slice(payload);
    msg
}

/// One mounted client talking to an in-process server.
struct Client {
    server: Tnfsd,
    src: SocketAddr,
    sid: u16,
    seq: u8,
}

impl Client {
    fn new(root: &Path) -> Client {
        Client {
            server: Tnfsd::new(root).unwrap(),
            src: client_addr(10, 6502),
            sid: 0,
            seq: 0,
        }
    }

    fn mounted(root: &Path) -> Client {
        let mut client = Client::new(root);
        let reply = client.mount(b"/");
        assert_eq!(reply[4], 0, "mount failed: {reply:?}");
        client
    }

    fn raw(&mut self, msg: &[u8]) -> Option<Vec<u8>> {
        self.server
            .handle_message(self.src, None, msg, Instant::now())
    }

    fn mount(&mut self, mountpoint: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x02, 0x01];
        payload.extend_from_slice(mountpoint);
        payload.extend_from_slice(b"\0\0\0");
        self.seq = self.seq.wrapping_add(1);
        let msg = message(0, self.seq, Cmd::Mount as u8, &payload);
        let reply = self.raw(&msg).expect("mount reply");
        if reply[4] == 0 {
            self.sid = u16::from_le_bytes([reply[5], reply[6]]);
        }
        reply
    }

    fn request(&mut self, cmd: Cmd, payload: &[u8]) -> Vec<u8> {
        self.seq = self.seq.wrapping_add(1);
        let msg = message(self.sid, self.seq, cmd as u8, payload);
        self.raw(&msg).expect("reply")
    }

    fn status(reply: &[u8]) -> Status {
        Status(reply[4])
    }
}

fn cstr(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

fn opendirx_payload(diropt: u8, sortopt: u8, maxresults: u16, pattern: &str, path: &str) -> Vec<u8> {
    let mut payload = vec![diropt, sortopt];
    payload.extend_from_slice(&maxresults.to_le_bytes());
    if !pattern.is_empty() {
        payload.extend_from_slice(&cstr(pattern));
    }
    payload.extend_from_slice(&cstr(path));
    payload
}

/// Split a READDIRX reply payload into (count, dir_status, dirpos, names).
fn parse_entries(payload: &[u8]) -> (u8, u8, u16, Vec<String>) {
    let count = payload[0];
    let dir_status = payload[1];
    let dirpos = u16::from_le_bytes([payload[2], payload[3]]);
    let mut names = Vec::new();
    let mut off = 4;
    for _ in 0..count {
        off += 13;
        let end = off + payload[off..].iter().position(|&b| b == 0).unwrap();
        names.push(String::from_utf8_lossy(&payload[off..end]).into_owned());
        off = end + 1;
    }
    assert_eq!(off, payload.len());
    (count, dir_status, dirpos, names)
}

fn scratch_sorted() -> TempDir {
    let tmp = tempfile::tempdir().unwrap();
    for name in ["B", "a", "C"] {
        File::create(tmp.path().join(name)).unwrap();
    }
    fs::create_dir(tmp.path().join("sub")).unwrap();
    tmp
}

#[test]
fn mount_umount_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::new(tmp.path());

    let reply = client.mount(b"/");
    assert_eq!(Client::status(&reply), Status::OK);
    // First free sid, protocol echo, retry interval.
    assert_eq!(&reply[5..7], &[0x01, 0x00]);
    assert_eq!(&reply[7..9], &[0x02, 0x01]);
    assert_eq!(&reply[9..11], &[0xE8, 0x03]);
    assert_eq!(client.server.session_count(), 1);

    let reply = client.request(Cmd::Umount, b"");
    assert_eq!(Client::status(&reply), Status::OK);
    assert_eq!(client.server.session_count(), 0);

    // The sid is gone.
    let reply = client.request(Cmd::Stat, &cstr("/x"));
    assert_eq!(Client::status(&reply), Status::EBADSESSION);
}

#[test]
fn mount_with_empty_mountpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::new(tmp.path());
    let reply = client.mount(b"");
    assert_eq!(Client::status(&reply), Status::OK);
}

#[test]
fn mount_of_missing_subdir_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::new(tmp.path());
    let reply = client.mount(b"/not-there");
    assert_eq!(Client::status(&reply), Status::ENOENT);
    assert_eq!(client.server.session_count(), 0);
}

#[test]
fn remount_replaces_only_the_same_mountpoint() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("games")).unwrap();
    let mut client = Client::new(tmp.path());

    let reply = client.mount(b"/");
    assert_eq!(Client::status(&reply), Status::OK);
    let root_sid = client.sid;

    // A second mountpoint from the same endpoint coexists with the first.
    let reply = client.mount(b"/games");
    assert_eq!(Client::status(&reply), Status::OK);
    let games_sid = client.sid;
    assert_ne!(root_sid, games_sid);
    assert_eq!(client.server.session_count(), 2);

    // Mounting /games again replaces only the /games session.
    let reply = client.mount(b"/games");
    assert_eq!(Client::status(&reply), Status::OK);
    assert_ne!(client.sid, games_sid);
    assert_eq!(client.server.session_count(), 2);

    let msg = message(games_sid, 77, Cmd::Size as u8, b"");
    let reply = client.raw(&msg).unwrap();
    assert_eq!(Client::status(&reply), Status::EBADSESSION);

    // The root mount rides through untouched.
    let msg = message(root_sid, 78, Cmd::Size as u8, b"");
    let reply = client.raw(&msg).unwrap();
    assert_eq!(Client::status(&reply), Status::OK);
}

#[test]
fn path_escape_is_contained() {
    let tmp = tempfile::tempdir().unwrap();
    File::create(tmp.path().join("marker.txt")).unwrap();
    let mut client = Client::mounted(tmp.path());

    let reply = client.request(Cmd::OpenDir, &cstr("../../etc"));
    assert_eq!(Client::status(&reply), Status::OK);
    let handle = reply[5];

    // The listing is the served root, not /etc.
    let reply = client.request(Cmd::ReadDir, &[handle]);
    assert_eq!(Client::status(&reply), Status::OK);
    assert_eq!(&reply[5..], b"marker.txt\0");
    let reply = client.request(Cmd::ReadDir, &[handle]);
    assert_eq!(Client::status(&reply), Status::EOF);
}

#[test]
fn opendirx_default_and_case_descending_sort() {
    let tmp = scratch_sorted();
    let mut client = Client::mounted(tmp.path());

    let reply = client.request(Cmd::OpenDirX, &opendirx_payload(0, 0, 0, "", "/"));
    assert_eq!(Client::status(&reply), Status::OK);
    let handle = reply[5];
    assert_eq!(u16::from_le_bytes([reply[6], reply[7]]), 4);

    let reply = client.request(Cmd::ReadDirX, &[handle, 0]);
    let (count, dir_status, dirpos, names) = parse_entries(&reply[5..]);
    assert_eq!(count, 4);
    assert_eq!(dir_status, 0x01);
    assert_eq!(dirpos, 0);
    assert_eq!(names, ["sub", "a", "B", "C"]);

    // CASE | DESCENDING
    let reply = client.request(Cmd::OpenDirX, &opendirx_payload(0, 0x06, 0, "", "/"));
    let handle = reply[5];
    let reply = client.request(Cmd::ReadDirX, &[handle, 0]);
    let (_, _, _, names) = parse_entries(&reply[5..]);
    assert_eq!(names, ["sub", "a", "C", "B"]);
}

#[test]
fn opendirx_glob_pattern() {
    let tmp = tempfile::tempdir().unwrap();
    for name in ["foo.sna", "foo.txt", "bar.sna"] {
        File::create(tmp.path().join(name)).unwrap();
    }
    let mut client = Client::mounted(tmp.path());

    let reply = client.request(Cmd::OpenDirX, &opendirx_payload(0, 0, 0, "*.sna", "/"));
    assert_eq!(Client::status(&reply), Status::OK);
    let handle = reply[5];
    assert_eq!(u16::from_le_bytes([reply[6], reply[7]]), 2);

    let reply = client.request(Cmd::ReadDirX, &[handle, 0]);
    let (_, _, _, names) = parse_entries(&reply[5..]);
    assert_eq!(names, ["bar.sna", "foo.sna"]);
}

#[test]
fn readdirx_pagination_fills_datagrams() {
    let tmp = tempfile::tempdir().unwrap();
    for i in 0..100 {
        File::create(tmp.path().join(format!("entry-{i:04}"))).unwrap();
    }
    let mut client = Client::mounted(tmp.path());

    let reply = client.request(Cmd::OpenDirX, &opendirx_payload(0, 0, 0, "", "/"));
    let handle = reply[5];

    let reply = client.request(Cmd::ReadDirX, &[handle, 0]);
    let (count, dir_status, dirpos, _) = parse_entries(&reply[5..]);
    assert_eq!((count, dir_status, dirpos), (21, 0, 0));

    let reply = client.request(Cmd::ReadDirX, &[handle, 0]);
    let (count, _, dirpos, _) = parse_entries(&reply[5..]);
    assert_eq!((count, dirpos), (21, 21));
}

#[test]
fn seekdir_telldir_on_loaded_handle() {
    let tmp = scratch_sorted();
    let mut client = Client::mounted(tmp.path());
    let reply = client.request(Cmd::OpenDirX, &opendirx_payload(0, 0, 0, "", "/"));
    let handle = reply[5];

    let mut seek = vec![handle];
    seek.extend_from_slice(&2u32.to_le_bytes());
    let reply = client.request(Cmd::SeekDir, &seek);
    assert_eq!(Client::status(&reply), Status::OK);

    let reply = client.request(Cmd::TellDir, &[handle]);
    assert_eq!(Client::status(&reply), Status::OK);
    assert_eq!(&reply[5..], &2u32.to_le_bytes());

    let reply = client.request(Cmd::ReadDirX, &[handle, 1]);
    let (_, _, dirpos, names) = parse_entries(&reply[5..]);
    assert_eq!(dirpos, 2);
    assert_eq!(names, ["B"]);
}

#[test]
fn traverse_reopen_skips_reload() {
    let tmp = scratch_sorted();
    let mut client = Client::mounted(tmp.path());
    let traverse = 0x20;

    let reply = client.request(Cmd::OpenDirX, &opendirx_payload(traverse, 0, 0, "", "/"));
    let handle = reply[5];
    let count = u16::from_le_bytes([reply[6], reply[7]]);
    let reply = client.request(Cmd::CloseDir, &[handle]);
    assert_eq!(Client::status(&reply), Status::OK);

    // New content appears on disk, but the reopened handle serves the
    // cached listing.
    File::create(tmp.path().join("latecomer")).unwrap();
    let reply = client.request(Cmd::OpenDirX, &opendirx_payload(traverse, 0, 0, "", "/"));
    assert_eq!(reply[5], handle);
    assert_eq!(u16::from_le_bytes([reply[6], reply[7]]), count);

    // A plain reopen without TRAVERSE reloads and sees the new file.
    let reply = client.request(Cmd::CloseDir, &[handle]);
    assert_eq!(Client::status(&reply), Status::OK);
    let reply = client.request(Cmd::OpenDirX, &opendirx_payload(0, 0, 0, "", "/"));
    assert_eq!(u16::from_le_bytes([reply[6], reply[7]]), count + 1);
}

#[test]
fn retransmit_replays_without_reexecuting() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::mounted(tmp.path());

    let msg = message(client.sid, 42, Cmd::MkDir as u8, &cstr("/newdir"));
    let first = client.raw(&msg).unwrap();
    assert_eq!(Client::status(&first), Status::OK);
    assert!(tmp.path().join("newdir").is_dir());

    // Same sid+seq: byte-identical replay, no second mkdir attempt.
    let second = client.raw(&msg).unwrap();
    assert_eq!(first, second);

    // A fresh seq re-executes and now collides.
    let msg = message(client.sid, 43, Cmd::MkDir as u8, &cstr("/newdir"));
    let reply = client.raw(&msg).unwrap();
    assert_eq!(Client::status(&reply), Status::EEXIST);
}

#[test]
fn file_read_write_seek_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::mounted(tmp.path());

    // O_RDWR | O_CREAT, mode 0644
    let mut payload = 0x0103u16.to_le_bytes().to_vec();
    payload.extend_from_slice(&0o644u16.to_le_bytes());
    payload.extend_from_slice(&cstr("/file.bin"));
    let reply = client.request(Cmd::Open, &payload);
    assert_eq!(Client::status(&reply), Status::OK);
    let fd = reply[5];
    assert_eq!(fd, 0);

    let mut payload = vec![fd];
    payload.extend_from_slice(&5u16.to_le_bytes());
    payload.extend_from_slice(b"hello");
    let reply = client.request(Cmd::Write, &payload);
    assert_eq!(Client::status(&reply), Status::OK);
    assert_eq!(&reply[5..], &5u16.to_le_bytes());

    // Rewind and read everything back.
    let mut payload = vec![fd, 0x00];
    payload.extend_from_slice(&0i32.to_le_bytes());
    let reply = client.request(Cmd::Lseek, &payload);
    assert_eq!(Client::status(&reply), Status::OK);
    assert_eq!(&reply[5..], &0u32.to_le_bytes());

    let mut payload = vec![fd];
    payload.extend_from_slice(&100u16.to_le_bytes());
    let reply = client.request(Cmd::Read, &payload);
    assert_eq!(Client::status(&reply), Status::OK);
    assert_eq!(&reply[5..7], &5u16.to_le_bytes());
    assert_eq!(&reply[7..], b"hello");

    let mut payload = vec![fd];
    payload.extend_from_slice(&100u16.to_le_bytes());
    let reply = client.request(Cmd::Read, &payload);
    assert_eq!(Client::status(&reply), Status::EOF);

    let reply = client.request(Cmd::Close, &[fd]);
    assert_eq!(Client::status(&reply), Status::OK);
    let reply = client.request(Cmd::Close, &[fd]);
    assert_eq!(Client::status(&reply), Status::EBADF);
}

#[test]
fn stat_reports_size_and_times() {
    let tmp = tempfile::tempdir().unwrap();
    let mut file = File::create(tmp.path().join("stat-me")).unwrap();
    file.write_all(b"0123456789").unwrap();
    drop(file);
    let mut client = Client::mounted(tmp.path());

    let reply = client.request(Cmd::Stat, &cstr("/stat-me"));
    assert_eq!(Client::status(&reply), Status::OK);
    let payload = &reply[5..];
    // mode(2) uid(2) gid(2) size(4) atime(4) mtime(4) ctime(4) + 2 empty strings
    assert_eq!(payload.len(), 22 + 2);
    let size = u32::from_le_bytes(payload[6..10].try_into().unwrap());
    assert_eq!(size, 10);
    let mtime = u32::from_le_bytes(payload[14..18].try_into().unwrap());
    assert!(mtime > 0);
    assert_eq!(&payload[22..], &[0, 0]);

    let reply = client.request(Cmd::Stat, &cstr("/enoent"));
    assert_eq!(Client::status(&reply), Status::ENOENT);
}

#[test]
fn rename_unlink_rmdir() {
    let tmp = tempfile::tempdir().unwrap();
    File::create(tmp.path().join("old")).unwrap();
    fs::create_dir(tmp.path().join("dir")).unwrap();
    let mut client = Client::mounted(tmp.path());

    let mut payload = cstr("/old");
    payload.extend_from_slice(&cstr("/new"));
    let reply = client.request(Cmd::Rename, &payload);
    assert_eq!(Client::status(&reply), Status::OK);
    assert!(tmp.path().join("new").exists());

    let reply = client.request(Cmd::Unlink, &cstr("/new"));
    assert_eq!(Client::status(&reply), Status::OK);
    assert!(!tmp.path().join("new").exists());

    let reply = client.request(Cmd::RmDir, &cstr("/dir"));
    assert_eq!(Client::status(&reply), Status::OK);
    assert!(!tmp.path().join("dir").exists());
}

#[test]
fn size_and_free_report_kilobytes() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::mounted(tmp.path());
    let reply = client.request(Cmd::Size, b"");
    assert_eq!(Client::status(&reply), Status::OK);
    assert_eq!(reply.len(), 9);
    let total = u32::from_le_bytes(reply[5..9].try_into().unwrap());
    assert!(total > 0);

    let reply = client.request(Cmd::Free, b"");
    assert_eq!(Client::status(&reply), Status::OK);
    assert_eq!(reply.len(), 9);
}

#[test]
fn out_of_range_handles_are_ebadf() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::mounted(tmp.path());

    let reply = client.request(Cmd::ReadDirX, &[MAX_DHND_PER_CONN as u8, 0]);
    assert_eq!(Client::status(&reply), Status::EBADF);

    let mut payload = vec![MAX_FD_PER_CONN as u8];
    payload.extend_from_slice(&10u16.to_le_bytes());
    let reply = client.request(Cmd::Read, &payload);
    assert_eq!(Client::status(&reply), Status::EBADF);
}

#[test]
fn undersized_messages_are_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::new(tmp.path());
    assert!(client.raw(&[]).is_none());
    assert!(client.raw(&[0x01, 0x00, 0x01]).is_none());
}

#[test]
fn unknown_opcode_is_enosys() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::mounted(tmp.path());
    let msg = message(client.sid, 99, 0x71, b"");
    let reply = client.raw(&msg).unwrap();
    assert_eq!(Client::status(&reply), Status::ENOSYS);
}

#[test]
fn foreign_source_is_discarded() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::mounted(tmp.path());
    let sid = client.sid;

    let mut server = client.server;
    let stranger = client_addr(66, 1234);
    let msg = message(sid, 7, Cmd::TellDir as u8, &[0]);
    assert!(
        server
            .handle_message(stranger, None, &msg, Instant::now())
            .is_none()
    );
}

#[test]
fn malformed_payload_is_einval() {
    let tmp = tempfile::tempdir().unwrap();
    let mut client = Client::mounted(tmp.path());
    // STAT with no terminator on the path.
    let reply = client.request(Cmd::Stat, b"unterminated");
    assert_eq!(Client::status(&reply), Status::EINVAL);
}
