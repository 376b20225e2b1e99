//! Filesystem path checks applied before anything is read or written.
//!
//! | Check | Error |
//! |-------|-------|
//! | path (or a component under the root) is a symbolic link | [`WeavrError::Security`] |
//! | path escapes the knowledge base root | [`WeavrError::Security`] |
//! | path missing, or of the wrong kind | [`WeavrError::NotFound`] |
//! | process cannot write the directory (write) or list it (read) | [`WeavrError::Permission`] |
//!
//! Symlinks are detected with `symlink_metadata` and never followed, so a
//! link fails with `Security` no matter where it points. All checks are pure:
//! nothing is created or modified.

use std::io::ErrorKind;
use std::path::{Component, Path};

use crate::error::{Result, WeavrError};

/// Validate a directory used as knowledge base root or output location.
pub fn validate(path: &Path, require_write: bool) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(WeavrError::not_found(path, "path does not exist"));
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(WeavrError::permission(path, e.to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    if meta.file_type().is_symlink() {
        return Err(WeavrError::security(path, "symbolic links are not allowed"));
    }
    if !meta.is_dir() {
        return Err(WeavrError::not_found(path, "not a directory"));
    }

    if require_write {
        if !can_write(path, &meta) {
            return Err(WeavrError::permission(
                path,
                "directory is not writable by this process",
            ));
        }
    } else if let Err(e) = std::fs::read_dir(path) {
        return Err(match e.kind() {
            ErrorKind::PermissionDenied => WeavrError::permission(path, "directory cannot be listed"),
            _ => e.into(),
        });
    }

    Ok(())
}

/// Whether the current process may create entries in `dir`.
///
/// Asks the kernel with the effective uid and groups, so ownership, ACLs and
/// read-only mounts are all taken into account.
#[cfg(unix)]
fn can_write(dir: &Path, _meta: &std::fs::Metadata) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(dir.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: `c_path` is a valid NUL-terminated string for the whole call.
    unsafe { libc::faccessat(libc::AT_FDCWD, c_path.as_ptr(), libc::W_OK, libc::AT_EACCESS) == 0 }
}

#[cfg(not(unix))]
fn can_write(_dir: &Path, meta: &std::fs::Metadata) -> bool {
    !meta.permissions().readonly()
}

/// Validate a document path reported by a scan or a filesystem event.
///
/// The path must be a regular file inside `root`, reached without passing
/// through a symbolic link. Components above `root` are not inspected.
pub fn validate_document(root: &Path, path: &Path) -> Result<()> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| WeavrError::security(path, "path is outside the knowledge base root"))?;

    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(WeavrError::security(
            path,
            "path contains non-normal components",
        ));
    }

    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        let meta = match std::fs::symlink_metadata(&current) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(WeavrError::not_found(path, "file does not exist"));
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(WeavrError::permission(path, e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.file_type().is_symlink() {
            return Err(WeavrError::security(
                path,
                format!("symbolic link at {}", current.display()),
            ));
        }
    }

    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_file() {
        return Err(WeavrError::not_found(path, "not a regular file"));
    }
    Ok(())
}
