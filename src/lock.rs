//! File-based locking for single-writer store access.
//!
//! Cross-platform (fs2) advisory locks on a sibling file `<store>.lock`.
//! - try_*: fail immediately if another Manager holds the store.
//! - acquire_*: block until the holder releases it.
//!
//! Lock is released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::consts::STORE_LOCK_SUFFIX;

pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // fs2 unlock errors on drop are ignored deliberately.
        let _ = self.file.unlock();
    }
}

/// `<store>.lock` рядом с файлом хранилища.
pub fn lock_file_path(store_path: &Path) -> PathBuf {
    let mut s: OsString = store_path.as_os_str().to_os_string();
    s.push(".");
    s.push(STORE_LOCK_SUFFIX);
    PathBuf::from(s)
}

fn open_lock_file(path: &Path) -> Result<std::fs::File> {
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    Ok(f)
}

/// Exclusive lock, blocks until acquired.
pub fn acquire_exclusive_lock(store_path: &Path) -> Result<LockGuard> {
    let path = lock_file_path(store_path);
    let file = open_lock_file(&path)?;
    file.lock_exclusive()
        .with_context(|| format!("lock_exclusive {}", path.display()))?;
    Ok(LockGuard { file, path })
}

/// Exclusive lock; Err if already held by someone else.
pub fn try_acquire_exclusive_lock(store_path: &Path) -> Result<LockGuard> {
    let path = lock_file_path(store_path);
    let file = open_lock_file(&path)?;
    file.try_lock_exclusive().with_context(|| {
        format!(
            "store is in use (try_lock_exclusive failed): {}",
            path.display()
        )
    })?;
    Ok(LockGuard { file, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_is_sibling() {
        let p = lock_file_path(Path::new("/tmp/x/volumes.db"));
        assert_eq!(p, PathBuf::from("/tmp/x/volumes.db.lock"));
    }

    #[test]
    fn second_try_lock_fails_until_drop() {
        let dir = std::env::temp_dir().join(format!(
            "qv-lock-{}-{}",
            std::process::id(),
            crate::util::now_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let store = dir.join("store.db");

        let g1 = try_acquire_exclusive_lock(&store).unwrap();
        assert!(g1.path().exists());
        assert!(try_acquire_exclusive_lock(&store).is_err());
        drop(g1);
        let _g2 = try_acquire_exclusive_lock(&store).unwrap();
    }
}
