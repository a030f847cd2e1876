//! Error kinds surfaced by the volume manager.
//!
//! Internals (store file I/O, provider backends, diff codec) work with
//! `anyhow::Error`; the Manager maps them onto these kinds at its boundary.

use thiserror::Error;

/// All manager errors.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// The durable store cannot be opened, created or locked.
    #[error("open error: {0:#}")]
    Open(#[source] anyhow::Error),

    /// The recorded provider cannot be reconstructed from its bootstrap record.
    #[error("provider bootstrap error: {0:#}")]
    ProviderBootstrap(#[source] anyhow::Error),

    /// A persisted volume could not be reattached at startup.
    #[error("recovery error: volume {id}: {source:#}")]
    Recovery {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Unknown volume, snapshot or base id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend operation failed; registries are unchanged.
    #[error("provider error: {0:#}")]
    Provider(#[source] anyhow::Error),

    /// Malformed or non-applying diff stream; the receiving volume is unchanged.
    #[error("protocol error: {0:#}")]
    Protocol(#[source] anyhow::Error),

    /// Store commit failed after the provider call; the operation was rolled back.
    #[error("store error: {0:#}")]
    Store(#[source] anyhow::Error),

    /// Request contradicts existing registry state (e.g. name bound with a different base).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation attempted after `Manager::close`.
    #[error("volume manager is closed")]
    Closed,
}

/// Result type for manager operations.
pub type Result<T> = std::result::Result<T, VolumeError>;

impl VolumeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VolumeError::NotFound(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, VolumeError::Closed)
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, VolumeError::Protocol(_))
    }

    /// Startup failures: no Manager is returned after one of these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VolumeError::Open(_) | VolumeError::ProviderBootstrap(_) | VolumeError::Recovery { .. }
        )
    }

    pub(crate) fn not_found(what: &str, id: &str) -> Self {
        VolumeError::NotFound(format!("{} '{}'", what, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn predicates_and_display() {
        let e = VolumeError::not_found("volume", "abc");
        assert!(e.is_not_found());
        assert_eq!(e.to_string(), "not found: volume 'abc'");

        assert!(VolumeError::Closed.is_closed());
        assert!(VolumeError::Protocol(anyhow!("bad magic")).is_protocol());

        let r = VolumeError::Recovery {
            id: "v1".into(),
            source: anyhow!("location missing"),
        };
        assert!(r.is_fatal());
        assert!(r.to_string().contains("v1"));
        assert!(!VolumeError::Provider(anyhow!("x")).is_fatal());
    }
}
