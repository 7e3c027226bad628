//! Client path resolution.
//!
//! Every path a client sends is untrusted. Resolution composes
//! `global_root / session_root / client_path`, normalizes separators, and
//! guarantees the result never leaves the global root: a path carrying a
//! `..` component collapses to the global root instead of erroring, matching
//! the protocol's silent-containment rule.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::ll::tnfs_abi::{MAX_FILEPATH, MAX_TNFSPATH, Status};

/// Resolve a client-supplied path against the server root and the session's
/// mount subpath. The returned path always has `global_root` as a prefix.
pub(crate) fn resolve(
    global_root: &Path,
    session_root: &Path,
    client: &OsStr,
) -> Result<PathBuf, Status> {
    if client.len() > MAX_TNFSPATH {
        return Err(Status::ENAMETOOLONG);
    }

    let mut out = global_root.join(session_root);
    match components(client) {
        Some(parts) => {
            for part in parts {
                out.push(OsStr::from_bytes(&part));
            }
        }
        // An escape attempt voids the client path entirely.
        None => out = global_root.to_path_buf(),
    }

    // The mandatory containment check; also covers a hostile session root.
    if !out.starts_with(global_root) {
        out = global_root.to_path_buf();
    }
    if out.as_os_str().len() > MAX_FILEPATH {
        return Err(Status::ENAMETOOLONG);
    }
    Ok(out)
}

/// Resolve a MOUNT mountpoint into the subpath stored on the session,
/// relative to the global root. The directory must exist.
pub(crate) fn resolve_mountpoint(global_root: &Path, client: &OsStr) -> Result<PathBuf, Status> {
    let full = resolve(global_root, Path::new(""), client)?;
    if !full.is_dir() {
        return Err(Status::ENOENT);
    }
    // Infallible: resolve() guarantees the prefix.
    let rel = full.strip_prefix(global_root).unwrap_or(Path::new(""));
    Ok(rel.to_path_buf())
}

/// Split a client path into cleaned components. Backslashes count as
/// separators (8-bit client filesystems use them), repeated separators and
/// `.` components drop out. Returns `None` if any `..` component appears.
fn components(client: &OsStr) -> Option<Vec<Vec<u8>>> {
    let mut parts = Vec::new();
    for part in client
        .as_bytes()
        .split(|&b| b == b'/' || b == b'\\')
    {
        match part {
            b"" | b"." => continue,
            b".." => return None,
            _ => parts.push(part.to_vec()),
        }
    }
    Some(parts)
}
