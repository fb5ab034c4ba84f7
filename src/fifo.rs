//! FIFO path bookkeeping, grounded on `original_source/utils.py`'s
//! `create_fifo`/`remove_fifo`. Every stream owns exactly one IPC FIFO
//! (spec.md §3); this module is the single place that creates or removes
//! one, so no two streams can observe a half-created path.

use std::path::{Path, PathBuf};

/// Create a FIFO at `path`, or at a fresh `tempdir/uuid` path if `path` is
/// `None`. If something non-FIFO already exists at `path`, it is removed
/// first (mirrors the original's "otherwise delete the file/dir" branch).
pub fn create_fifo(path: Option<&Path>) -> std::io::Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let dir = tempfile::tempdir()?.keep();
            dir.join(uuid::Uuid::new_v4().to_string())
        }
    };

    match std::fs::symlink_metadata(&path) {
        Ok(meta) => {
            use std::os::unix::fs::FileTypeExt;
            if !meta.file_type().is_fifo() {
                if meta.is_dir() {
                    std::fs::remove_dir(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
                nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600))
                    .map_err(std::io::Error::from)?;
            }
        }
        Err(_) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600))
                .map_err(std::io::Error::from)?;
        }
    }

    Ok(path)
}

/// Remove a FIFO and its containing directory, ignoring errors the way the
/// original does (`except OSError: pass`).
pub fn remove_fifo(path: &Path) {
    let _ = std::fs::remove_file(path);
    if let Some(parent) = path.parent() {
        let _ = std::fs::remove_dir(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_fifo_at_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fifo");
        let created = create_fifo(Some(&path)).unwrap();
        assert_eq!(created, path);
        let meta = std::fs::symlink_metadata(&path).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());
    }

    #[test]
    fn replaces_non_fifo_file_at_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.fifo");
        std::fs::write(&path, b"not a fifo").unwrap();
        create_fifo(Some(&path)).unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());
    }

    #[test]
    fn creates_anonymous_fifo_when_no_path_given() {
        let path = create_fifo(None).unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());
    }
}
