#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hrx_codec::encode_release;
use hrx_core::{format_storage_name, ChartMeta, FetchError, ObjectKey, ReleaseRecord, ReleaseSource, Status};
use hrx_engine::{release_registry, EngineConfig, ReconcileEngine};
use hrx_registry::{LabelRegistry, MetricRegistry, Series};

/// Release objects held in memory, keyed like the cluster would key them.
#[derive(Default)]
pub struct MemorySource {
    objects: Mutex<HashMap<ObjectKey, Vec<u8>>>,
    delay: Option<Duration>,
}

impl MemorySource {
    pub fn slow(delay: Duration) -> Self {
        Self { objects: Mutex::default(), delay: Some(delay) }
    }

    /// Store `rec` and return the key its storage object would have.
    pub fn put(&self, rec: &ReleaseRecord) -> ObjectKey {
        let key = key_of(&rec.namespace, &rec.name, rec.revision);
        self.objects.lock().unwrap().insert(key.clone(), encode_release(rec).unwrap());
        key
    }

    pub fn put_raw(&self, key: ObjectKey, payload: &[u8]) {
        self.objects.lock().unwrap().insert(key, payload.to_vec());
    }

    pub fn remove(&self, key: &ObjectKey) {
        self.objects.lock().unwrap().remove(key);
    }
}

#[async_trait::async_trait]
impl ReleaseSource for MemorySource {
    async fn fetch(&self, key: &ObjectKey) -> Result<Vec<u8>, FetchError> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.objects.lock().unwrap().get(key).cloned().ok_or(FetchError::NotFound)
    }
}

pub fn key_of(namespace: &str, release: &str, revision: u64) -> ObjectKey {
    ObjectKey::new(namespace, format_storage_name(release, revision))
}

pub fn record(name: &str, namespace: &str, revision: u64, status: Status) -> ReleaseRecord {
    ReleaseRecord {
        name: name.into(),
        namespace: namespace.into(),
        revision,
        chart: ChartMeta {
            name: Some("unicorn".into()),
            version: Some(format!("0.0.{revision}")),
            app_version: Some("1.1.0".into()),
        },
        status,
        last_deployed: 979_586_940 + revision as i64,
    }
}

pub struct Harness {
    pub registry: Arc<LabelRegistry>,
    pub source: Arc<MemorySource>,
    pub engine: ReconcileEngine,
}

pub fn harness(config: EngineConfig) -> Harness {
    harness_with(MemorySource::default(), config)
}

pub fn harness_with(source: MemorySource, config: EngineConfig) -> Harness {
    let registry = Arc::new(release_registry());
    let source = Arc::new(source);
    let engine = ReconcileEngine::new(registry.clone(), source.clone(), config);
    Harness { registry, source, engine }
}

pub fn series(reg: &dyn MetricRegistry, family: &str, name: &str, namespace: &str) -> Vec<Series> {
    reg.select(family, &[("name", name), ("namespace", namespace)]).unwrap()
}

pub fn info_revisions(reg: &dyn MetricRegistry, name: &str, namespace: &str) -> Vec<String> {
    let mut revs: Vec<String> =
        series(reg, hrx_engine::INFO, name, namespace).iter().map(|s| s.label("revision").unwrap().to_string()).collect();
    revs.sort_by_key(|r| r.parse::<u64>().unwrap());
    revs
}

pub fn revision(reg: &dyn MetricRegistry, name: &str, namespace: &str) -> Option<f64> {
    reg.get(hrx_engine::REVISION, &[("name", name), ("namespace", namespace)]).unwrap()
}

pub fn status(reg: &dyn MetricRegistry, name: &str, namespace: &str, status: &str) -> Option<f64> {
    reg.get(hrx_engine::STATUS, &[("name", name), ("namespace", namespace), ("status", status)]).unwrap()
}

pub fn errors(reg: &dyn MetricRegistry, namespace: &str) -> f64 {
    reg.get(hrx_engine::ERRORS, &[("namespace", namespace)]).unwrap().unwrap_or(0.0)
}

/// Number of series of the release across the four release families.
pub fn release_series(reg: &dyn MetricRegistry, name: &str, namespace: &str) -> usize {
    [hrx_engine::INFO, hrx_engine::REVISION, hrx_engine::STATUS, hrx_engine::UPDATED]
        .iter()
        .map(|f| series(reg, f, name, namespace).len())
        .sum()
}
