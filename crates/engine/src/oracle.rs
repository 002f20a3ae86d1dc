use std::sync::Arc;

use hrx_registry::{MetricRegistry, RegistryError};

use crate::families::REVISION;

/// Answers "highest revision reconciled so far" for a release.
pub trait RevisionOracle: Send + Sync {
    /// `Ok(None)` when the release is not tracked; `Err` only when the lookup itself failed.
    fn latest(&self, release: &str, namespace: &str) -> Result<Option<u64>, RegistryError>;
}

/// Reads the cursor back from `helm_release_revision`. The registry is the
/// only state; it must not be cleared behind the engine's back.
pub struct RegistryOracle {
    registry: Arc<dyn MetricRegistry>,
}

impl RegistryOracle {
    pub fn new(registry: Arc<dyn MetricRegistry>) -> Self {
        Self { registry }
    }
}

impl RevisionOracle for RegistryOracle {
    fn latest(&self, release: &str, namespace: &str) -> Result<Option<u64>, RegistryError> {
        let value = self.registry.get(REVISION, &[("name", release), ("namespace", namespace)])?;
        Ok(value.filter(|v| v.is_finite() && *v >= 1.0).map(|v| v as u64))
    }
}
