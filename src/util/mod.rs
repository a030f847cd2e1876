//! util - общие утилиты (время, id томов, fsync каталога, операции над деревьями).
//!
//! Содержит:
//! - now_secs()/now_nanos(): текущее Unix-время.
//! - new_volume_id(): 128-битный случайный id (hex, 32 символа).
//! - fsync_dir(): fsync родительского каталога (best-effort на не-unix).
//! - copy_tree()/move_children()/dir_is_empty(): для провайдеров на каталогах.

use anyhow::{anyhow, Context, Result};
use std::fs;
#[cfg(unix)]
use std::fs::File;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[inline]
pub fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Новый id тома: 16 случайных байт в hex.
pub fn new_volume_id() -> String {
    let bytes: [u8; 16] = rand::random();
    to_hex(&bytes)
}

pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// fsync родительского каталога `path`.
#[cfg(unix)]
pub fn fsync_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
pub fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

pub fn dir_is_empty(dir: &Path) -> Result<bool> {
    let mut it = fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))?;
    Ok(it.next().is_none())
}

/// Recursive copy of `src` into `dst` (created if missing). Regular files,
/// directories and (on unix) symlinks; permissions are carried over.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;

    for entry in fs::read_dir(src).with_context(|| format!("read_dir {}", src.display()))? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copy_tree(&from, &to)?;
        } else if ft.is_file() {
            fs::copy(&from, &to)
                .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
        } else if ft.is_symlink() {
            copy_symlink(&from, &to)?;
        } else {
            return Err(anyhow!("unsupported file type at {}", from.display()));
        }
    }
    // права каталога - после детей (0o555 не даст в него писать)
    let perms = fs::metadata(src)
        .with_context(|| format!("stat {}", src.display()))?
        .permissions();
    fs::set_permissions(dst, perms).with_context(|| format!("chmod {}", dst.display()))?;
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = fs::read_link(from).with_context(|| format!("readlink {}", from.display()))?;
    std::os::unix::fs::symlink(&target, to)
        .with_context(|| format!("symlink {} -> {}", to.display(), target.display()))?;
    Ok(())
}
#[cfg(not(unix))]
fn copy_symlink(from: &Path, _to: &Path) -> Result<()> {
    Err(anyhow!("symlinks are not supported here: {}", from.display()))
}

/// Move every child of `src` into `dst` (rename, same filesystem). `src` stays, empty.
pub fn move_children(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    let mut moved = 0usize;
    for entry in fs::read_dir(src).with_context(|| format!("read_dir {}", src.display()))? {
        let entry = entry?;
        let to = dst.join(entry.file_name());
        fs::rename(entry.path(), &to)
            .with_context(|| format!("rename {} -> {}", entry.path().display(), to.display()))?;
        moved += 1;
    }
    Ok(moved)
}

/// remove_dir_all, но отсутствие каталога - не ошибка.
pub fn remove_tree_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", dir.display())),
    }
}
