//! Some [`std::io::Error`]s are expected while running a disk cache:
//! files go missing (another process, a wipe, an NFS server), and
//! busy caches bump into file descriptor limits.  Neither should be
//! surfaced to callers as a failure.
use std::io::Error;
use std::io::ErrorKind;

/// Checks whether the error is for a missing file: NotFound, or stale
/// handle.  Things do go missing from caches, so stale NFS handles
/// are treated like any other missing entry file.
pub(crate) fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Checks whether the error means we ran out of file descriptors,
/// either for this process (EMFILE) or system-wide (ENFILE).  The
/// file limiter reacts by closing idle files and retrying.
pub(crate) fn is_fd_exhaustion(error: &Error) -> bool {
    match error.raw_os_error() {
        Some(errno) => errno == libc::EMFILE || errno == libc::ENFILE,
        None => false,
    }
}

/// Removes a file if it exists.
pub(crate) fn ensure_file_removed(path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if is_absent_file_error(&e) => Ok(()),
        err => err,
    }
}

#[test]
fn test_getters() {
    assert!(is_absent_file_error(&Error::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));
    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ENOENT)));
    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ESTALE)));
    assert!(!is_absent_file_error(&Error::from_raw_os_error(libc::EIO)));

    assert!(is_fd_exhaustion(&Error::from_raw_os_error(libc::EMFILE)));
    assert!(is_fd_exhaustion(&Error::from_raw_os_error(libc::ENFILE)));
    assert!(!is_fd_exhaustion(&Error::from_raw_os_error(libc::ENOENT)));
    assert!(!is_fd_exhaustion(&Error::new(ErrorKind::Other, "synthetic")));
}

#[test]
fn test_ensure_file_removed() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("victim", FileType::ZeroFile(10));

    ensure_file_removed(&temp.path("victim")).expect("first removal should succeed");
    assert!(!temp.path("victim").exists());
    // Removing an absent file is fine.
    ensure_file_removed(&temp.path("victim")).expect("second removal should succeed");
}
