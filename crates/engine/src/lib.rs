//! Revision-aware reconciliation of Helm release metrics.
//!
//! Each change notification is turned into the minimal set of registry
//! mutations that leaves the `helm_release_*` families describing only the
//! latest known revision of every release. Delivery may be duplicated or
//! reordered; the revision comparison against [`RevisionOracle`] is what keeps
//! the result correct, not the order notifications arrive in.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use hrx_codec::{decode_release, DecodeError};
use hrx_core::{parse_storage_name, Change, ChangeKind, FetchError, ObjectKey, ParseError, ReleaseRecord, ReleaseSource, Status};
use hrx_registry::{Label, MetricRegistry, RegistryError};
use tracing::{debug, error, info, warn};

pub mod families;
mod oracle;

pub use families::{release_registry, ERRORS, FAMILIES, INFO, REVISION, STATUS, UPDATED};
pub use oracle::{RegistryOracle, RevisionOracle};

/// What happens to `helm_release_info` series of older revisions on upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfoRetention {
    /// Only the latest revision keeps an Info series.
    #[default]
    LatestOnly,
    /// Every revision keeps its Info series until its storage object is deleted.
    History,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on fetching the body of an upserted object.
    pub fetch_timeout: Duration,
    pub info_retention: InfoRetention,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { fetch_timeout: Duration::from_secs(10), info_retention: InfoRetention::LatestOnly }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// All families written for this revision.
    Applied { revision: u64 },
    /// A newer revision was already reconciled; nothing changed.
    Stale { revision: u64, latest: u64 },
    /// A historical revision was deleted; only its Info series went.
    Pruned { revision: u64, latest: u64 },
    /// The latest revision was deleted; every series of the release went.
    Removed { revision: u64 },
    /// Deletion of a revision the registry never tracked as latest.
    Untracked { revision: u64 },
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied { .. } => "applied",
            Outcome::Stale { .. } => "stale",
            Outcome::Pruned { .. } => "pruned",
            Outcome::Removed { .. } => "removed",
            Outcome::Untracked { .. } => "untracked",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("fetching {key}: {source}")]
    Fetch { key: ObjectKey, source: FetchError },
    #[error("decoding {key}: {source}")]
    Decode { key: ObjectKey, source: DecodeError },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
}

impl ReconcileError {
    /// Whether redelivering the same notification may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Fetch { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

pub struct ReconcileEngine {
    registry: Arc<dyn MetricRegistry>,
    oracle: Arc<dyn RevisionOracle>,
    source: Arc<dyn ReleaseSource>,
    config: EngineConfig,
}

impl ReconcileEngine {
    pub fn new(registry: Arc<dyn MetricRegistry>, source: Arc<dyn ReleaseSource>, config: EngineConfig) -> Self {
        let oracle = Arc::new(RegistryOracle::new(Arc::clone(&registry)));
        Self { registry, oracle, source, config }
    }

    /// Replace the revision cursor (defaults to reading back the registry).
    pub fn with_oracle(mut self, oracle: Arc<dyn RevisionOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Process one notification.
    pub async fn handle(&self, change: &Change) -> Result<Outcome, ReconcileError> {
        match change.kind {
            ChangeKind::Upsert => self.upsert(&change.key).await,
            ChangeKind::Delete => self.remove(&change.key),
        }
    }

    /// Fetch, decode and apply the object behind `key`. An object that is
    /// already gone is handled as a deletion of `key`.
    pub async fn upsert(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let fetched = match tokio::time::timeout(self.config.fetch_timeout, self.source.fetch(key)).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::Timeout(self.config.fetch_timeout)),
        };
        let payload = match fetched {
            Ok(p) => p,
            Err(FetchError::NotFound) => {
                debug!(namespace = %key.namespace, object = %key.name, "release object gone; handling as deletion");
                return self.remove(key);
            }
            Err(source) => {
                warn!(namespace = %key.namespace, object = %key.name, error = %source, "unable to get release");
                self.count_error(&key.namespace);
                return Err(ReconcileError::Fetch { key: key.clone(), source });
            }
        };
        let record = decode_release(&key.namespace, &payload).map_err(|source| {
            warn!(namespace = %key.namespace, object = %key.name, error = %source, "unable to decode release");
            self.count_error(&key.namespace);
            ReconcileError::Decode { key: key.clone(), source }
        })?;
        self.apply(&record)
    }

    /// Bring the registry to `record` unless a newer revision is already tracked.
    pub fn apply(&self, record: &ReleaseRecord) -> Result<Outcome, ReconcileError> {
        let res = self.apply_record(record);
        if let Err(e) = &res {
            warn!(namespace = %record.namespace, release = %record.name, revision = record.revision, error = %e, "unable to update release metrics");
            self.count_error(&record.namespace);
        }
        res
    }

    /// Retire the revision named by the storage object `key`.
    pub fn remove(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let parsed = parse_storage_name(&key.name).map_err(|e| {
            warn!(namespace = %key.namespace, object = %key.name, error = %e, "unable to parse release name from object name");
            self.count_error(&key.namespace);
            e
        })?;
        let res = self.remove_revision(&parsed.release, &key.namespace, parsed.revision);
        if let Err(e) = &res {
            warn!(namespace = %key.namespace, release = %parsed.release, revision = parsed.revision, error = %e, "unable to clean up release metrics");
            self.count_error(&key.namespace);
        }
        res
    }

    fn apply_record(&self, rec: &ReleaseRecord) -> Result<Outcome, ReconcileError> {
        let latest = self.oracle.latest(&rec.name, &rec.namespace)?.unwrap_or(0);
        if rec.revision < latest {
            debug!(namespace = %rec.namespace, release = %rec.name, revision = rec.revision, latest, "skipping as a newer revision was already seen");
            return Ok(Outcome::Stale { revision: rec.revision, latest });
        }

        let revision = rec.revision.to_string();
        let info: [Label<'_>; 6] = [
            ("name", rec.name.as_str()),
            ("namespace", rec.namespace.as_str()),
            ("chart", rec.chart.name_label()),
            ("chart_version", rec.chart.version_label()),
            ("app_version", rec.chart.app_version_label()),
            ("revision", revision.as_str()),
        ];
        // new series first: a failure below must not leave the release without Info
        self.registry.set(INFO, &info, 1.0)?;
        if latest > 0 {
            self.evict_info(rec, &info)?;
        }

        let common: [Label<'_>; 2] = [("name", rec.name.as_str()), ("namespace", rec.namespace.as_str())];
        self.registry.set(REVISION, &common, rec.revision as f64)?;
        self.registry.set(UPDATED, &common, rec.last_deployed as f64)?;
        for s in Status::TRACKED.iter() {
            let value = if s == &rec.status { 1.0 } else { 0.0 };
            self.registry.set(STATUS, &[common[0], common[1], ("status", s.as_str())], value)?;
        }

        debug!(
            namespace = %rec.namespace,
            release = %rec.name,
            chart = rec.chart.name_label(),
            chart_version = rec.chart.version_label(),
            revision = rec.revision,
            status = %rec.status,
            "release metrics updated"
        );
        Ok(Outcome::Applied { revision: rec.revision })
    }

    /// Drop Info series of the release other than `keep`, per retention mode.
    /// A series for the same revision with different chart labels always goes.
    fn evict_info(&self, rec: &ReleaseRecord, keep: &[Label<'_>]) -> Result<usize, ReconcileError> {
        let revision = rec.revision.to_string();
        let mut evicted = 0;
        for series in self.registry.select(INFO, &[("name", rec.name.as_str()), ("namespace", rec.namespace.as_str())])? {
            if keep.iter().all(|(k, v)| series.label(k) == Some(*v)) {
                continue;
            }
            let evict = match self.config.info_retention {
                InfoRetention::LatestOnly => true,
                InfoRetention::History => series.label("revision") == Some(revision.as_str()),
            };
            if evict {
                let exact: Vec<Label<'_>> = series.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                evicted += self.registry.delete_partial_match(INFO, &exact)?;
            }
        }
        Ok(evicted)
    }

    fn remove_revision(&self, name: &str, namespace: &str, revision: u64) -> Result<Outcome, ReconcileError> {
        let latest = self.oracle.latest(name, namespace)?.unwrap_or(0);
        let rev = revision.to_string();
        self.registry.delete_partial_match(INFO, &[("name", name), ("namespace", namespace), ("revision", rev.as_str())])?;

        if latest == 0 || revision > latest {
            debug!(namespace, release = name, revision, latest, "deleted revision was never the latest seen");
            return Ok(Outcome::Untracked { revision });
        }
        if revision < latest {
            debug!(namespace, release = name, revision, latest, "historical revision deleted");
            return Ok(Outcome::Pruned { revision, latest });
        }

        let common: [Label<'_>; 2] = [("name", name), ("namespace", namespace)];
        for family in [REVISION, STATUS, UPDATED, INFO] {
            self.registry.delete_partial_match(family, &common)?;
        }
        info!(namespace, release = name, revision, "latest revision deleted; release metrics removed");
        Ok(Outcome::Removed { revision })
    }

    fn count_error(&self, namespace: &str) {
        if let Err(e) = self.registry.add(ERRORS, &[("namespace", namespace)], 1.0) {
            error!(namespace, error = %e, "unable to count reconcile error");
        }
    }
}
