//! provider - storage backend contract, bootstrap records and re-attachment.
//!
//! Состав:
//! - Provider: операции над физическим хранилищем томов (allocate/fork/destroy/snapshot,
//!   reattach после рестарта, haves/send/receive для передачи снапшотов).
//! - BootstrapRecord: {kind, config} - всё, что нужно для реконструкции провайдера
//!   без повторного запуска first-time setup.
//! - restore_provider(): реконструкция по kind.
//! - fs: FsProvider (каталоги на локальной ФС).
//! - diff: формат потока различий.
//!
//! All provider calls are synchronous and may block on I/O. Errors are
//! `anyhow::Error`; stream-shape problems carry a `diff::DiffError` inside.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::consts::FS_PROVIDER_KIND;
use crate::volume::VolumeInfo;

pub mod diff;
pub mod fs;

pub use fs::FsProvider;

/// Persisted description of how to rebuild a provider instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRecord {
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Opaque content marker a volume already possesses.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Marker(pub String);

impl Marker {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Set of markers returned by `list_haves`. Empty means "send full content".
pub type Haves = BTreeSet<Marker>;

/// Result of a provider allocation.
#[derive(Clone, Debug)]
pub struct ProvidedVolume {
    pub location: PathBuf,
    /// Provider-private state stored in the volume record.
    pub state: serde_json::Value,
}

/// Stream-producing knobs (from `ManagerConfig`).
#[derive(Clone, Copy, Debug)]
pub struct SendOptions {
    pub compress: bool,
    pub chunk_size: usize,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            compress: false,
            chunk_size: crate::consts::DIFF_CHUNK_DEFAULT,
        }
    }
}

pub trait Provider: Send + Sync {
    /// Backend identifier, also the `kind` of the bootstrap record.
    fn kind(&self) -> &str;

    /// Describe this instance so it can be rebuilt by `restore_provider`.
    fn bootstrap(&self) -> Result<BootstrapRecord>;

    /// Allocate a fresh, empty volume for `id`.
    fn new_volume(&self, id: &str) -> Result<ProvidedVolume>;

    /// Allocate `id` with initial content copied from `base`.
    fn fork_volume(&self, base: &VolumeInfo, id: &str) -> Result<ProvidedVolume>;

    /// Destroy physical storage (and anything the backend considers inseparable from it).
    fn destroy_volume(&self, info: &VolumeInfo) -> Result<()>;

    /// Backend restriction on snapshotting; snapshots of snapshots are refused by default.
    fn can_snapshot(&self, info: &VolumeInfo) -> bool {
        !info.is_snapshot
    }

    /// Immutable point-in-time copy of `source` under `id`.
    fn create_snapshot(&self, source: &VolumeInfo, id: &str) -> Result<ProvidedVolume>;

    /// Make a previously known volume accessible at `info.location` again.
    fn reattach(&self, info: &VolumeInfo, state: &serde_json::Value) -> Result<()>;

    /// Content markers held by `info`.
    fn list_haves(&self, info: &VolumeInfo) -> Result<Haves>;

    /// Write the difference between `snapshot` and the baseline implied by `haves`.
    /// Returns the number of bytes written.
    fn send_snapshot(
        &self,
        snapshot: &VolumeInfo,
        haves: &Haves,
        out: &mut dyn Write,
        opts: &SendOptions,
    ) -> Result<u64>;

    /// Apply a diff stream on top of a copy of `target` and provide the result as `id`.
    /// `target` itself is only read.
    fn receive_snapshot(
        &self,
        target: &VolumeInfo,
        input: &mut dyn Read,
        id: &str,
    ) -> Result<ProvidedVolume>;
}

/// Rebuild a provider purely from its bootstrap record.
pub fn restore_provider(record: &BootstrapRecord) -> Result<Arc<dyn Provider>> {
    match record.kind.as_str() {
        FS_PROVIDER_KIND => Ok(Arc::new(FsProvider::from_bootstrap(record)?)),
        other => Err(anyhow!("unknown provider kind '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_rejected() {
        let rec = BootstrapRecord {
            kind: "zfs".into(),
            config: serde_json::Value::Null,
        };
        let err = restore_provider(&rec).err().unwrap();
        assert!(err.to_string().contains("unknown provider kind"));
    }

    #[test]
    fn markers_serialize_as_plain_strings() {
        let mut haves = Haves::new();
        haves.insert(Marker("b".into()));
        haves.insert(Marker("a".into()));
        let s = serde_json::to_string(&haves).unwrap();
        assert_eq!(s, r#"["a","b"]"#);
    }
}
