//! Helm release exporter core types: release records, the change feed and
//! the storage identifiers Helm gives to release objects.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod storage_name;

pub use storage_name::{format_storage_name, parse_storage_name, ParseError, StorageName, MAX_REVISION, STORAGE_PREFIX};

/// Rendered in place of chart metadata that could not be read.
pub const MISSING: &str = "MISSING";

/// Identity of a storage object (Secret or ConfigMap) holding one release revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Object created or updated; the body has to be fetched.
    Upsert,
    /// Object gone; only the identifier is known.
    Delete,
}

/// One notification of the change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Change {
    pub key: ObjectKey,
    pub kind: ChangeKind,
}

impl Change {
    pub fn upsert(key: ObjectKey) -> Self {
        Self { key, kind: ChangeKind::Upsert }
    }

    pub fn delete(key: ObjectKey) -> Self {
        Self { key, kind: ChangeKind::Delete }
    }
}

/// Helm release status as stored in `info.status`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Unknown,
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    /// Anything Helm may add later; kept verbatim.
    Other(String),
}

impl Status {
    /// Statuses that get their own `helm_release_status` series.
    pub const TRACKED: [Status; 5] = [
        Status::Deployed,
        Status::Failed,
        Status::PendingInstall,
        Status::PendingRollback,
        Status::PendingUpgrade,
    ];

    pub fn parse(s: &str) -> Self {
        match s {
            "unknown" => Status::Unknown,
            "deployed" => Status::Deployed,
            "uninstalled" => Status::Uninstalled,
            "superseded" => Status::Superseded,
            "failed" => Status::Failed,
            "uninstalling" => Status::Uninstalling,
            "pending-install" => Status::PendingInstall,
            "pending-upgrade" => Status::PendingUpgrade,
            "pending-rollback" => Status::PendingRollback,
            other => Status::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Status::Unknown => "unknown",
            Status::Deployed => "deployed",
            Status::Uninstalled => "uninstalled",
            Status::Superseded => "superseded",
            Status::Failed => "failed",
            Status::Uninstalling => "uninstalling",
            Status::PendingInstall => "pending-install",
            Status::PendingUpgrade => "pending-upgrade",
            Status::PendingRollback => "pending-rollback",
            Status::Other(s) => s.as_str(),
        }
    }

    pub fn is_tracked(&self) -> bool {
        Self::TRACKED.contains(self)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chart metadata of a release. `None` marks a field that could not be read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartMeta {
    pub name: Option<String>,
    pub version: Option<String>,
    pub app_version: Option<String>,
}

impl ChartMeta {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn name_label(&self) -> &str {
        self.name.as_deref().unwrap_or(MISSING)
    }

    pub fn version_label(&self) -> &str {
        self.version.as_deref().unwrap_or(MISSING)
    }

    pub fn app_version_label(&self) -> &str {
        self.app_version.as_deref().unwrap_or(MISSING)
    }
}

/// One decoded release revision. Never retained past a single notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub name: String,
    pub namespace: String,
    pub revision: u64,
    pub chart: ChartMeta,
    pub status: Status,
    /// Seconds since the Unix epoch.
    pub last_deployed: i64,
}

/// Failure to fetch the body of a storage object.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The object no longer exists.
    #[error("object not found")]
    NotFound,
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The object exists but carries no usable release payload.
    #[error("malformed object: {0}")]
    MalformedObject(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout(_) | FetchError::Transport(_))
    }
}

/// Get-by-identifier access to the raw release payload of a storage object.
#[async_trait::async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn fetch(&self, key: &ObjectKey) -> Result<Vec<u8>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_round_trip() {
        for s in Status::TRACKED.iter() {
            assert_eq!(&Status::parse(s.as_str()), s);
            assert!(s.is_tracked());
        }
        assert_eq!(Status::parse("superseded"), Status::Superseded);
        assert!(!Status::Superseded.is_tracked());
        let odd = Status::parse("rolling-sideways");
        assert_eq!(odd.as_str(), "rolling-sideways");
        assert!(!odd.is_tracked());
    }

    #[test]
    fn missing_chart_renders_sentinel() {
        let c = ChartMeta { name: Some("nginx".into()), version: None, app_version: Some(String::new()) };
        assert_eq!(c.name_label(), "nginx");
        assert_eq!(c.version_label(), MISSING);
        assert_eq!(c.app_version_label(), "");
        assert_eq!(ChartMeta::missing().name_label(), MISSING);
    }
}
