//! Host errno to TNFS status translation.
//!
//! Clients only ever see the one-byte TNFS status table, so every host error
//! must collapse into it. Anything without a defined slot becomes EIO.

use std::io;

use libc::c_int;

use super::tnfs_abi::Status;

/// Translate an `io::Error` from a filesystem call into a TNFS status byte.
pub(crate) fn status_from_io_error(err: &io::Error) -> Status {
    match err.raw_os_error() {
        Some(errno) => status_from_errno(errno),
        None => Status::EIO,
    }
}

/// Translate a raw host errno into a TNFS status byte.
pub(crate) fn status_from_errno(errno: c_int) -> Status {
    match errno {
        libc::EPERM => Status::EPERM,
        libc::ENOENT => Status::ENOENT,
        libc::EIO => Status::EIO,
        libc::ENXIO => Status::ENXIO,
        libc::EBADF => Status::EBADF,
        // EWOULDBLOCK aliases EAGAIN on every platform we build for.
        libc::EAGAIN => Status::EAGAIN,
        libc::ENOMEM => Status::ENOMEM,
        libc::EACCES => Status::EACCES,
        libc::EBUSY => Status::EBUSY,
        libc::EEXIST => Status::EEXIST,
        libc::ENOTDIR => Status::ENOTDIR,
        libc::EISDIR => Status::EISDIR,
        libc::EINVAL => Status::EINVAL,
        libc::ENFILE => Status::ENFILE,
        libc::EMFILE => Status::EMFILE,
        libc::EFBIG => Status::EFBIG,
        libc::ENOSPC => Status::ENOSPC,
        libc::ESPIPE => Status::ESPIPE,
        libc::EROFS => Status::EROFS,
        libc::ENAMETOOLONG => Status::ENAMETOOLONG,
        libc::ENOSYS => Status::ENOSYS,
        libc::ENOTEMPTY => Status::ENOTEMPTY,
        libc::ELOOP => Status::ELOOP,
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        libc::ENODATA => Status::ENODATA,
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        libc::ENOSTR => Status::ENOSTR,
        libc::EPROTO => Status::EPROTO,
        #[cfg(target_os = "linux")]
        libc::EBADFD => Status::EBADFD,
        libc::ESRCH => Status::ESRCH,
        libc::ETIMEDOUT => Status::ETIMEDOUT,
        _ => Status::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_errnos_map_to_their_slot() {
        assert_eq!(status_from_errno(libc::EPERM), Status::EPERM);
        assert_eq!(status_from_errno(libc::ENOENT), Status::ENOENT);
        assert_eq!(status_from_errno(libc::ENOTEMPTY), Status::ENOTEMPTY);
        assert_eq!(status_from_errno(libc::ENAMETOOLONG), Status::ENAMETOOLONG);
    }

    #[test]
    fn unknown_errno_becomes_eio() {
        assert_eq!(status_from_errno(libc::EXDEV), Status::EIO);
        assert_eq!(status_from_errno(-1), Status::EIO);
    }

    #[test]
    fn io_error_without_raw_code_becomes_eio() {
        let err = io::Error::new(io::ErrorKind::Other, "synthetic");
        assert_eq!(status_from_io_error(&err), Status::EIO);
    }

    #[test]
    fn io_error_with_raw_code_uses_table() {
        let err = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(status_from_io_error(&err), Status::EACCES);
    }
}
