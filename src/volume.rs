//! Volume handles and their persisted form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::provider::Provider;

/// Immutable value snapshot of a volume. Compared field-for-field across restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: String,
    /// Kind of the provider owning the storage (e.g. "fs").
    pub kind: String,
    pub location: PathBuf,
    pub is_snapshot: bool,
    /// Volume this one was derived from (snapshot source, fork base or receive target).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Unix seconds.
    pub created_at: u64,
}

/// Record stored under `volumes/<id>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub info: VolumeInfo,
    /// Provider-private state, handed back to `Provider::reattach`.
    #[serde(default)]
    pub state: serde_json::Value,
}

/// A registered volume: its info plus the shared provider handle.
#[derive(Clone)]
pub struct Volume {
    info: VolumeInfo,
    provider: Arc<dyn Provider>,
}

impl Volume {
    pub(crate) fn new(info: VolumeInfo, provider: Arc<dyn Provider>) -> Self {
        Self { info, provider }
    }

    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn location(&self) -> &Path {
        &self.info.location
    }

    pub fn is_snapshot(&self) -> bool {
        self.info.is_snapshot
    }

    pub fn origin(&self) -> Option<&str> {
        self.info.origin.as_deref()
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// True when both volumes are backed by the very same provider instance.
    pub fn same_provider(&self, other: &Volume) -> bool {
        Arc::ptr_eq(&self.provider, &other.provider)
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("info", &self.info)
            .field("provider", &self.provider.kind())
            .finish()
    }
}
