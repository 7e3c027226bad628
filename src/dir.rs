//! Directory enumeration engine.
//!
//! OPENDIRX materializes a directory listing into a sorted vector owned by a
//! per-session handle slot; READDIRX pages through it under the datagram
//! budget, and SEEKDIR/TELLDIR address it by enumeration index. Closed
//! handles keep their listing around for [`DIR_HANDLE_TIMEOUT`] so a
//! TRAVERSE reopen with the same parameters can skip the reload.

use std::cmp::Ordering;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::debug;

use crate::ll::errno::status_from_io_error;
use crate::ll::reply::Reply;
use crate::ll::tnfs_abi::{
    DIR_HANDLE_TIMEOUT, DIRSTATUS_EOF, DirEntryHeader, DirOpt, EntryFlags, MAX_DHND_PER_CONN,
    MAX_PAYLOAD, ReadDirXReply, SortOpt, Status, direntry_wire_len,
};
use crate::pattern::glob_match;

/// One materialized directory entry.
#[derive(Debug, Clone)]
pub(crate) struct DirEntry {
    pub flags: EntryFlags,
    pub size: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub name: OsString,
}

impl DirEntry {
    fn from_metadata(name: OsString, flags: EntryFlags, meta: &fs::Metadata) -> DirEntry {
        DirEntry {
            flags,
            size: meta.len().min(u32::MAX as u64) as u32,
            mtime: meta.mtime().clamp(0, u32::MAX as i64) as u32,
            ctime: meta.ctime().clamp(0, u32::MAX as i64) as u32,
            name,
        }
    }

    fn wire_len(&self) -> usize {
        direntry_wire_len(self.name.len())
    }

    fn wire_header(&self) -> DirEntryHeader {
        DirEntryHeader {
            flags: self.flags.bits(),
            size: self.size.into(),
            mtime: self.mtime.into(),
            ctime: self.ctime.into(),
        }
    }
}

/// A directory handle slot. The slot index is the handle byte on the wire.
///
/// States: free (`!open && !loaded`), loaded-but-closed (`loaded && !open`,
/// eligible for reuse until it expires), and open (`open`, possibly also
/// loaded once the listing is materialized).
#[derive(Debug, Default)]
pub(crate) struct DirHandle {
    open: bool,
    loaded: bool,
    path: PathBuf,
    pattern: Vec<u8>,
    diropt: DirOpt,
    sortopt: SortOpt,
    open_at: Option<Instant>,
    entries: Vec<DirEntry>,
    cursor: usize,
}

impl DirHandle {
    fn release(&mut self) {
        *self = DirHandle::default();
    }

    fn matches(&self, path: &Path, diropt: DirOpt, sortopt: SortOpt, pattern: &[u8]) -> bool {
        self.path == path
            && self.diropt == diropt
            && self.sortopt == sortopt
            && self.pattern == pattern
    }

    fn expired(&self, now: Instant) -> bool {
        match self.open_at {
            Some(at) => now.duration_since(at) > DIR_HANDLE_TIMEOUT,
            None => false,
        }
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn telldir(&self) -> u32 {
        self.cursor as u32
    }

    /// Position past the end clamps to the entry count; the next read
    /// reports EOF.
    pub(crate) fn seekdir(&mut self, pos: u32) {
        self.cursor = (pos as usize).min(self.entries.len());
    }

    /// Legacy READDIR: the next raw entry name, advancing the cursor.
    pub(crate) fn next_name(&mut self) -> Option<&OsStr> {
        let entry = self.entries.get(self.cursor)?;
        self.cursor += 1;
        Some(&entry.name)
    }

    /// READDIRX: pack entries from the cursor onward. `req_count == 0` means
    /// "fill the datagram". Stops at the requested count, at the payload
    /// budget, or at the end of the listing, whichever comes first.
    pub(crate) fn read_batch(&mut self, req_count: u8) -> Reply {
        if self.cursor >= self.entries.len() {
            return Reply::error(Status::EOF);
        }
        let want = if req_count == 0 {
            usize::MAX
        } else {
            req_count as usize
        };
        let dirpos = self.cursor as u16;
        let mut packed = Vec::new();
        let mut used = size_of::<ReadDirXReply>();
        let mut count: u8 = 0;
        while (count as usize) < want && self.cursor < self.entries.len() {
            let entry = &self.entries[self.cursor];
            if used + entry.wire_len() > MAX_PAYLOAD {
                break;
            }
            packed.extend_from_slice(zerocopy::IntoBytes::as_bytes(&entry.wire_header()));
            packed.extend_from_slice(entry.name.as_bytes());
            packed.push(0);
            used += entry.wire_len();
            self.cursor += 1;
            count += 1;
        }
        let dir_status = if self.cursor >= self.entries.len() {
            DIRSTATUS_EOF
        } else {
            0
        };
        let mut reply = Reply::from_struct(&ReadDirXReply {
            count,
            dir_status,
            dirpos: dirpos.into(),
        });
        reply.push_bytes(&packed);
        reply
    }
}

/// The per-session directory handle table.
#[derive(Debug, Default)]
pub(crate) struct DirTable {
    handles: [DirHandle; MAX_DHND_PER_CONN],
}

impl DirTable {
    /// Reclaim loaded-but-closed handles whose listing has gone stale.
    pub(crate) fn sweep(&mut self, now: Instant) {
        for handle in &mut self.handles {
            if handle.loaded && !handle.open && handle.expired(now) {
                debug!("expiring cached listing of {:?}", handle.path);
                handle.release();
            }
        }
    }

    pub(crate) fn close_all(&mut self) {
        for handle in &mut self.handles {
            handle.release();
        }
    }

    /// Allocate a slot for an open. Tiers: reuse a matching cached listing
    /// (TRAVERSE only), then a free slot, then evict any slot not currently
    /// open. Returns the handle and whether a cached listing was reused.
    pub(crate) fn allocate(
        &mut self,
        now: Instant,
        path: &Path,
        diropt: DirOpt,
        sortopt: SortOpt,
        pattern: &[u8],
    ) -> Result<(u8, bool), Status> {
        self.sweep(now);

        if diropt.contains(DirOpt::TRAVERSE) {
            if let Some(i) = self
                .handles
                .iter()
                .position(|h| h.loaded && !h.open && h.matches(path, diropt, sortopt, pattern))
            {
                let handle = &mut self.handles[i];
                handle.open = true;
                handle.cursor = 0;
                return Ok((i as u8, true));
            }
        }

        let slot = self
            .handles
            .iter()
            .position(|h| !h.open && !h.loaded)
            .or_else(|| self.handles.iter().position(|h| !h.open));
        let Some(i) = slot else {
            return Err(Status::EMFILE);
        };
        let handle = &mut self.handles[i];
        handle.release();
        handle.path = path.to_path_buf();
        handle.diropt = diropt;
        handle.sortopt = sortopt;
        handle.pattern = pattern.to_vec();
        handle.open = true;
        handle.open_at = Some(now);
        Ok((i as u8, false))
    }

    /// Borrow an open handle, or EBADF. Out-of-range indexes never touch
    /// the table.
    pub(crate) fn get_open_mut(&mut self, handle: u8) -> Result<&mut DirHandle, Status> {
        let i = handle as usize;
        if i >= MAX_DHND_PER_CONN || !self.handles[i].open {
            return Err(Status::EBADF);
        }
        Ok(&mut self.handles[i])
    }

    /// Close an open handle. The listing stays cached until it expires or
    /// the slot is evicted.
    pub(crate) fn close(&mut self, handle: u8) -> Result<(), Status> {
        let i = handle as usize;
        if i >= MAX_DHND_PER_CONN || !self.handles[i].open {
            return Err(Status::EBADF);
        }
        self.handles[i].open = false;
        Ok(())
    }

    /// Drop a slot outright (load failure after allocation).
    pub(crate) fn release(&mut self, handle: u8) {
        if (handle as usize) < MAX_DHND_PER_CONN {
            self.handles[handle as usize].release();
        }
    }
}

/// Materialize the listing for a freshly allocated handle.
pub(crate) fn load(handle: &mut DirHandle, maxresults: u16) -> Result<(), Status> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut collector = Collector {
        diropt: handle.diropt,
        pattern: &handle.pattern,
        maxresults,
        dirs: &mut dirs,
        files: &mut files,
    };
    let path = handle.path.clone();
    collector.collect(&path, Path::new(""))?;
    sort_entries(&mut dirs, handle.sortopt);
    sort_entries(&mut files, handle.sortopt);
    dirs.append(&mut files);
    handle.entries = dirs;
    handle.cursor = 0;
    handle.loaded = true;
    Ok(())
}

/// Materialize a raw listing for a legacy OPENDIR handle: directory order,
/// no filters, no metadata. Only names ever reach the wire through the
/// legacy READDIR, so the stat round per entry is skipped.
pub(crate) fn load_raw(handle: &mut DirHandle) -> Result<(), Status> {
    let rd = fs::read_dir(&handle.path).map_err(|e| status_from_io_error(&e))?;
    let mut entries = Vec::new();
    for entry in rd {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        entries.push(DirEntry {
            flags: EntryFlags::default(),
            size: 0,
            mtime: 0,
            ctime: 0,
            name: entry.file_name(),
        });
    }
    handle.entries = entries;
    handle.cursor = 0;
    handle.loaded = true;
    Ok(())
}

struct Collector<'a> {
    diropt: DirOpt,
    pattern: &'a [u8],
    maxresults: u16,
    dirs: &'a mut Vec<DirEntry>,
    files: &'a mut Vec<DirEntry>,
}

impl Collector<'_> {
    fn full(&self) -> bool {
        self.maxresults != 0 && self.dirs.len() + self.files.len() >= self.maxresults as usize
    }

    /// Walk one directory level; with TRAVERSE, descend into accepted
    /// subdirectories, emitting slash-joined relative names.
    fn collect(&mut self, dir: &Path, prefix: &Path) -> Result<(), Status> {
        let rd = fs::read_dir(dir).map_err(|e| status_from_io_error(&e))?;
        for entry in rd {
            if self.full() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let name = entry.file_name();
            // Follow symlinks for the flags the client sees; fall back to
            // the link itself if the target is gone.
            let meta = match fs::metadata(entry.path()).or_else(|_| entry.metadata()) {
                Ok(meta) => meta,
                Err(_) => continue,
            };

            let mut flags = EntryFlags::default();
            if meta.is_dir() {
                flags |= EntryFlags::DIR;
            }
            if name.as_bytes().starts_with(b".") {
                flags |= EntryFlags::HIDDEN;
            }
            if !meta.is_dir() && !meta.is_file() {
                flags |= EntryFlags::SPECIAL;
            }

            if flags.contains(EntryFlags::HIDDEN)
                && !self.diropt.contains(DirOpt::NO_SKIPHIDDEN)
            {
                continue;
            }
            if flags.contains(EntryFlags::SPECIAL)
                && !self.diropt.contains(DirOpt::NO_SKIPSPECIAL)
            {
                continue;
            }

            let is_dir = flags.contains(EntryFlags::DIR);
            let listed = if is_dir && self.diropt.contains(DirOpt::NO_FOLDERS) {
                false
            } else if !self.pattern.is_empty()
                && (!is_dir || self.diropt.contains(DirOpt::DIR_PATTERN))
            {
                glob_match(self.pattern, name.as_bytes())
            } else {
                true
            };

            if listed {
                let wire_name = if prefix.as_os_str().is_empty() {
                    name.clone()
                } else {
                    prefix.join(&name).into_os_string()
                };
                let record = DirEntry::from_metadata(wire_name, flags, &meta);
                if is_dir && !self.diropt.contains(DirOpt::NO_FOLDERSFIRST) {
                    self.dirs.push(record);
                } else {
                    self.files.push(record);
                }
            }

            if is_dir && self.diropt.contains(DirOpt::TRAVERSE) {
                // The pattern selects names to report, not subtrees to skip.
                // A subtree that cannot be read drops out of the listing.
                if let Err(err) = self.collect(&entry.path(), &prefix.join(&name)) {
                    debug!("traverse skipping {:?}: {:?}", entry.path(), err);
                }
            }
        }
        Ok(())
    }
}

fn sort_entries(entries: &mut [DirEntry], sortopt: SortOpt) {
    if sortopt.contains(SortOpt::NONE) {
        return;
    }
    entries.sort_by(|a, b| {
        let ord = if sortopt.contains(SortOpt::MODIFIED) {
            a.mtime.cmp(&b.mtime)
        } else if sortopt.contains(SortOpt::SIZE) {
            a.size.cmp(&b.size)
        } else if sortopt.contains(SortOpt::CASE) {
            a.name.as_bytes().cmp(b.name.as_bytes())
        } else {
            cmp_ignore_ascii_case(a.name.as_bytes(), b.name.as_bytes())
        };
        if sortopt.contains(SortOpt::DESCENDING) {
            ord.reverse()
        } else {
            ord
        }
    });
}

fn cmp_ignore_ascii_case(a: &[u8], b: &[u8]) -> Ordering {
    a.iter()
        .map(u8::to_ascii_lowercase)
        .cmp(b.iter().map(u8::to_ascii_lowercase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn scratch() -> TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["B", "a", "C"] {
            File::create(tmp.path().join(name)).unwrap();
        }
        fs::create_dir(tmp.path().join("sub")).unwrap();
        tmp
    }

    fn open_and_load(
        table: &mut DirTable,
        path: &Path,
        diropt: DirOpt,
        sortopt: SortOpt,
        pattern: &[u8],
    ) -> u8 {
        let (h, reused) = table
            .allocate(Instant::now(), path, diropt, sortopt, pattern)
            .unwrap();
        if !reused {
            load(table.get_open_mut(h).unwrap(), 0).unwrap();
        }
        h
    }

    fn names(handle: &DirHandle) -> Vec<String> {
        handle
            .entries
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn default_sort_is_folders_first_case_insensitive() {
        let tmp = scratch();
        let mut table = DirTable::default();
        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::empty(),
            SortOpt::empty(),
            b"",
        );
        let handle = table.get_open_mut(h).unwrap();
        assert_eq!(names(handle), ["sub", "a", "B", "C"]);
        assert!(handle.entries[0].flags.contains(EntryFlags::DIR));
    }

    #[test]
    fn case_descending_sort() {
        let tmp = scratch();
        let mut table = DirTable::default();
        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::empty(),
            SortOpt::CASE | SortOpt::DESCENDING,
            b"",
        );
        assert_eq!(names(table.get_open_mut(h).unwrap()), ["sub", "a", "C", "B"]);
    }

    #[test]
    fn glob_filters_listing() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["foo.sna", "foo.txt", "bar.sna"] {
            File::create(tmp.path().join(name)).unwrap();
        }
        let mut table = DirTable::default();
        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::empty(),
            SortOpt::empty(),
            b"*.sna",
        );
        assert_eq!(
            names(table.get_open_mut(h).unwrap()),
            ["bar.sna", "foo.sna"]
        );
    }

    #[test]
    fn hidden_entries_skipped_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        File::create(tmp.path().join(".hidden")).unwrap();
        File::create(tmp.path().join("shown")).unwrap();
        let mut table = DirTable::default();
        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::empty(),
            SortOpt::empty(),
            b"",
        );
        assert_eq!(names(table.get_open_mut(h).unwrap()), ["shown"]);

        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::NO_SKIPHIDDEN,
            SortOpt::empty(),
            b"",
        );
        assert_eq!(
            names(table.get_open_mut(h).unwrap()),
            [".hidden", "shown"]
        );
    }

    #[test]
    fn maxresults_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..10 {
            File::create(tmp.path().join(format!("f{i}"))).unwrap();
        }
        let mut table = DirTable::default();
        let (h, _) = table
            .allocate(
                Instant::now(),
                tmp.path(),
                DirOpt::empty(),
                SortOpt::empty(),
                b"",
            )
            .unwrap();
        let handle = table.get_open_mut(h).unwrap();
        load(handle, 3).unwrap();
        assert_eq!(handle.entry_count(), 3);
    }

    #[test]
    fn readdirx_fills_the_datagram() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..100 {
            // 10-byte names: 24 wire bytes per entry.
            File::create(tmp.path().join(format!("entry-{i:04}"))).unwrap();
        }
        let mut table = DirTable::default();
        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::empty(),
            SortOpt::empty(),
            b"",
        );
        let handle = table.get_open_mut(h).unwrap();
        assert_eq!(handle.entry_count(), 100);

        let reply = handle.read_batch(0);
        assert_eq!(reply.status(), Status::OK);
        // count, dir_status, dirpos, then 21 packed entries.
        assert_eq!(reply.payload()[0], 21);
        assert_eq!(reply.payload()[1], 0);
        assert_eq!(&reply.payload()[2..4], &[0, 0]);
        assert_eq!(reply.payload().len(), 4 + 21 * 24);

        let reply = handle.read_batch(0);
        assert_eq!(reply.payload()[0], 21);
        assert_eq!(&reply.payload()[2..4], &21u16.to_le_bytes());
    }

    #[test]
    fn readdirx_past_end_is_eof() {
        let tmp = tempfile::tempdir().unwrap();
        File::create(tmp.path().join("only")).unwrap();
        let mut table = DirTable::default();
        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::empty(),
            SortOpt::empty(),
            b"",
        );
        let handle = table.get_open_mut(h).unwrap();
        let reply = handle.read_batch(5);
        assert_eq!(reply.payload()[0], 1);
        assert_eq!(reply.payload()[1], DIRSTATUS_EOF);
        let reply = handle.read_batch(5);
        assert_eq!(reply.status(), Status::EOF);
        assert!(reply.payload().is_empty());
    }

    #[test]
    fn seekdir_telldir_round_trip() {
        let tmp = scratch();
        let mut table = DirTable::default();
        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::empty(),
            SortOpt::empty(),
            b"",
        );
        let handle = table.get_open_mut(h).unwrap();
        for pos in 0..handle.entry_count() as u32 {
            handle.seekdir(pos);
            assert_eq!(handle.telldir(), pos);
        }
        handle.seekdir(1000);
        assert_eq!(handle.telldir(), handle.entry_count() as u32);
    }

    #[test]
    fn traverse_reuses_cached_listing() {
        let tmp = scratch();
        let mut table = DirTable::default();
        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::TRAVERSE,
            SortOpt::empty(),
            b"",
        );
        table.close(h).unwrap();

        let (h2, reused) = table
            .allocate(
                Instant::now(),
                tmp.path(),
                DirOpt::TRAVERSE,
                SortOpt::empty(),
                b"",
            )
            .unwrap();
        assert_eq!(h, h2);
        assert!(reused);

        // Different pattern: no reuse.
        table.close(h2).unwrap();
        let (_, reused) = table
            .allocate(
                Instant::now(),
                tmp.path(),
                DirOpt::TRAVERSE,
                SortOpt::empty(),
                b"*.z80",
            )
            .unwrap();
        assert!(!reused);
    }

    #[test]
    fn expired_listing_is_not_reused() {
        let tmp = scratch();
        let mut table = DirTable::default();
        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::TRAVERSE,
            SortOpt::empty(),
            b"",
        );
        table.close(h).unwrap();
        table.handles[h as usize].open_at =
            Some(Instant::now() - DIR_HANDLE_TIMEOUT - Duration::from_secs(1));

        let (h2, reused) = table
            .allocate(
                Instant::now(),
                tmp.path(),
                DirOpt::TRAVERSE,
                SortOpt::empty(),
                b"",
            )
            .unwrap();
        assert_eq!(h2, h);
        assert!(!reused);
    }

    #[test]
    fn traverse_flattens_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        File::create(tmp.path().join("top.sna")).unwrap();
        File::create(tmp.path().join("sub/deep.sna")).unwrap();
        let mut table = DirTable::default();
        let h = open_and_load(
            &mut table,
            tmp.path(),
            DirOpt::TRAVERSE,
            SortOpt::empty(),
            b"",
        );
        assert_eq!(
            names(table.get_open_mut(h).unwrap()),
            ["sub", "sub/deep.sna", "top.sna"]
        );
    }

    #[test]
    fn bad_handle_is_ebadf_without_table_access() {
        let mut table = DirTable::default();
        assert_eq!(
            table.get_open_mut(MAX_DHND_PER_CONN as u8).unwrap_err(),
            Status::EBADF
        );
        assert_eq!(table.get_open_mut(0).unwrap_err(), Status::EBADF);
    }

    #[test]
    fn every_slot_open_means_no_handle() {
        let tmp = scratch();
        let mut table = DirTable::default();
        for _ in 0..MAX_DHND_PER_CONN {
            open_and_load(
                &mut table,
                tmp.path(),
                DirOpt::empty(),
                SortOpt::NONE,
                b"",
            );
        }
        let err = table
            .allocate(
                Instant::now(),
                tmp.path(),
                DirOpt::empty(),
                SortOpt::NONE,
                b"",
            )
            .unwrap_err();
        assert_eq!(err, Status::EMFILE);
    }

    #[test]
    fn legacy_raw_listing_is_unfiltered() {
        let tmp = tempfile::tempdir().unwrap();
        File::create(tmp.path().join(".dotfile")).unwrap();
        File::create(tmp.path().join("plain")).unwrap();
        let mut handle = DirHandle {
            path: tmp.path().to_path_buf(),
            ..DirHandle::default()
        };
        load_raw(&mut handle).unwrap();
        let mut listed = names(&handle);
        listed.sort();
        assert_eq!(listed, [".dotfile", "plain"]);
        let mut write_check = File::create(tmp.path().join("late")).unwrap();
        write_check.write_all(b"x").unwrap();
        // The listing is a snapshot; later files do not appear.
        assert_eq!(handle.entry_count(), 2);
    }
}
