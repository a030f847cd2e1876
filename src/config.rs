//! Centralized configuration for the volume manager and the reference backend.
//!
//! - ManagerConfig::from_env() reads QV_* env vars; builder-style setters override them.
//! - FsProviderConfig is serialized as-is into the provider bootstrap record,
//!   so it must only carry what is needed to reconstruct the provider.
//!
//! Env:
//! - QV_COMMIT_FSYNC  = 0|1 (default 1) - fsync store file + dir on each commit
//! - QV_LOCK_WAIT     = 0|1 (default 0) - block on the store lock instead of failing
//! - QV_DIFF_COMPRESS = 0|1 (default 0) - zstd file chunks in SendSnapshot streams
//! - QV_DIFF_CHUNK    = bytes (default 1 MiB, clamped to [4 KiB, 16 MiB])

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::consts::{DIFF_CHUNK_DEFAULT, DIFF_CHUNK_MAX, DIFF_CHUNK_MIN};

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "on" || s == "yes"
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Fsync the store file and its parent directory on every commit.
    /// Env: QV_COMMIT_FSYNC (default true)
    pub commit_fsync: bool,

    /// Block until the store lock is free instead of failing with OpenError.
    /// Env: QV_LOCK_WAIT (default false)
    pub lock_wait: bool,

    /// Compress file chunks with zstd when sending snapshots.
    /// Env: QV_DIFF_COMPRESS (default false)
    pub diff_compress: bool,

    /// Size of a file chunk frame in a diff stream.
    /// Env: QV_DIFF_CHUNK (default 1 MiB)
    pub diff_chunk_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            commit_fsync: true,
            lock_wait: false,
            diff_compress: false,
            diff_chunk_size: DIFF_CHUNK_DEFAULT,
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(on) = env_flag("QV_COMMIT_FSYNC") {
            cfg.commit_fsync = on;
        }
        if let Some(on) = env_flag("QV_LOCK_WAIT") {
            cfg.lock_wait = on;
        }
        if let Some(on) = env_flag("QV_DIFF_COMPRESS") {
            cfg.diff_compress = on;
        }
        if let Ok(v) = std::env::var("QV_DIFF_CHUNK") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.diff_chunk_size = clamp_chunk(n);
            }
        }

        cfg
    }

    pub fn with_commit_fsync(mut self, on: bool) -> Self {
        self.commit_fsync = on;
        self
    }

    pub fn with_lock_wait(mut self, on: bool) -> Self {
        self.lock_wait = on;
        self
    }

    pub fn with_diff_compress(mut self, on: bool) -> Self {
        self.diff_compress = on;
        self
    }

    pub fn with_diff_chunk_size(mut self, bytes: usize) -> Self {
        self.diff_chunk_size = clamp_chunk(bytes);
        self
    }

    pub fn build(self) -> Self {
        self
    }
}

fn clamp_chunk(n: usize) -> usize {
    n.clamp(DIFF_CHUNK_MIN, DIFF_CHUNK_MAX)
}

impl fmt::Display for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ManagerConfig {{ commit_fsync: {}, lock_wait: {}, diff_compress: {}, diff_chunk_size: {} }}",
            self.commit_fsync, self.lock_wait, self.diff_compress, self.diff_chunk_size
        )
    }
}

/// Configuration of the directory-backed provider. This is the body of its
/// bootstrap record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsProviderConfig {
    /// Provider root: holds mnt/, pool/, staging/ and the .provider marker.
    pub root: PathBuf,
}

impl FsProviderConfig {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_and_clamps() {
        let cfg = ManagerConfig::default()
            .with_commit_fsync(false)
            .with_diff_compress(true)
            .with_diff_chunk_size(1)
            .build();
        assert!(!cfg.commit_fsync);
        assert!(cfg.diff_compress);
        assert!(!cfg.lock_wait);
        assert_eq!(cfg.diff_chunk_size, DIFF_CHUNK_MIN);

        let big = ManagerConfig::default().with_diff_chunk_size(usize::MAX);
        assert_eq!(big.diff_chunk_size, DIFF_CHUNK_MAX);
    }

    #[test]
    fn display_mentions_every_field() {
        let s = ManagerConfig::default().to_string();
        assert!(s.contains("commit_fsync: true"));
        assert!(s.contains("lock_wait: false"));
        assert!(s.contains("diff_chunk_size: 1048576"));
    }

    #[test]
    fn fs_config_json_shape() {
        let cfg = FsProviderConfig::new("/var/lib/qv");
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["root"], "/var/lib/qv");
        let back: FsProviderConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back, cfg);
    }
}
