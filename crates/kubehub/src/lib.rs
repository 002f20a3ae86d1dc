//! Kubernetes side of the exporter: watches Helm storage objects and reads
//! their bodies back on demand.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use hrx_core::{Change, ChangeKind, FetchError, ObjectKey, ReleaseSource};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use metrics::counter;
use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Label Helm puts on every storage object it owns.
pub const OWNER_SELECTOR: &str = "owner=helm";

/// Data key holding the encoded release in both storage kinds.
pub const RELEASE_KEY: &str = "release";

/// Helm storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageDriver {
    #[default]
    Secret,
    ConfigMap,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported storage driver {0:?} (expected secret or configmap)")]
pub struct UnknownDriver(pub String);

impl FromStr for StorageDriver {
    type Err = UnknownDriver;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "secret" | "secrets" => Ok(StorageDriver::Secret),
            "configmap" | "configmaps" => Ok(StorageDriver::ConfigMap),
            _ => Err(UnknownDriver(s.to_string())),
        }
    }
}

impl fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageDriver::Secret => "secret",
            StorageDriver::ConfigMap => "configmap",
        })
    }
}

/// Identity of a watched object; `None` for objects without a namespace.
pub fn key_of<K: ResourceExt>(obj: &K) -> Option<ObjectKey> {
    let ns = obj.namespace()?;
    Some(ObjectKey::new(ns, obj.name_any()))
}

/// Objects the watcher has announced and not yet seen deleted. A relist is
/// diffed against it so objects that vanished while the watch was down still
/// produce a delete.
#[derive(Debug, Default)]
pub struct KnownObjects {
    keys: FxHashSet<ObjectKey>,
}

impl KnownObjects {
    pub fn len(&self) -> usize { self.keys.len() }
    pub fn is_empty(&self) -> bool { self.keys.is_empty() }

    /// Notifications carried by one watcher event. A relist re-announces every
    /// listed object and deletes every known one it no longer lists.
    pub fn changes_from<K: ResourceExt>(&mut self, event: Event<K>) -> Vec<Change> {
        match event {
            Event::Applied(o) => match key_of(&o) {
                Some(key) => {
                    self.keys.insert(key.clone());
                    vec![Change::upsert(key)]
                }
                None => Vec::new(),
            },
            Event::Deleted(o) => match key_of(&o) {
                Some(key) => {
                    self.keys.remove(&key);
                    vec![Change::delete(key)]
                }
                None => Vec::new(),
            },
            Event::Restarted(list) => {
                let listed: FxHashSet<ObjectKey> = list.iter().filter_map(key_of).collect();
                let mut gone: Vec<ObjectKey> = self.keys.difference(&listed).cloned().collect();
                gone.sort();
                let mut out: Vec<Change> = gone.into_iter().map(Change::delete).collect();
                // list order, deduplicated
                let mut seen = FxHashSet::default();
                out.extend(list.iter().filter_map(key_of).filter(|k| seen.insert(k.clone())).map(Change::upsert));
                self.keys = listed;
                out
            }
        }
    }
}

fn event_label<K>(event: &Event<K>) -> &'static str {
    match event {
        Event::Applied(_) => "applied",
        Event::Deleted(_) => "deleted",
        Event::Restarted(_) => "restarted",
    }
}

/// Encoded release held by a Secret-backed revision.
pub fn secret_payload(secret: &Secret) -> Result<Vec<u8>, FetchError> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(RELEASE_KEY))
        .map(|b| b.0.clone())
        .ok_or_else(|| FetchError::MalformedObject(format!("secret has no {RELEASE_KEY:?} key")))
}

/// Encoded release held by a ConfigMap-backed revision.
pub fn configmap_payload(cm: &ConfigMap) -> Result<Vec<u8>, FetchError> {
    cm.data
        .as_ref()
        .and_then(|d| d.get(RELEASE_KEY))
        .map(|s| s.as_bytes().to_vec())
        .ok_or_else(|| FetchError::MalformedObject(format!("configmap has no {RELEASE_KEY:?} key")))
}

/// Reads release bodies straight from the API server.
#[derive(Clone)]
pub struct KubeReleaseSource {
    client: Client,
    driver: StorageDriver,
}

impl KubeReleaseSource {
    pub fn new(client: Client, driver: StorageDriver) -> Self {
        Self { client, driver }
    }
}

#[async_trait]
impl ReleaseSource for KubeReleaseSource {
    async fn fetch(&self, key: &ObjectKey) -> Result<Vec<u8>, FetchError> {
        match self.driver {
            StorageDriver::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);
                match api.get_opt(&key.name).await {
                    Ok(Some(s)) => secret_payload(&s),
                    Ok(None) => Err(FetchError::NotFound),
                    Err(e) => Err(FetchError::Transport(e.into())),
                }
            }
            StorageDriver::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &key.namespace);
                match api.get_opt(&key.name).await {
                    Ok(Some(cm)) => configmap_payload(&cm),
                    Ok(None) => Err(FetchError::NotFound),
                    Err(e) => Err(FetchError::Transport(e.into())),
                }
            }
        }
    }
}

/// List+watch Helm storage objects and feed their changes into `tx`.
/// Returns when the receiving side is gone.
pub async fn start_watcher(client: Client, driver: StorageDriver, namespace: Option<&str>, tx: mpsc::Sender<Change>) -> Result<()> {
    match driver {
        StorageDriver::Secret => watch_objects::<Secret>(client, namespace, tx).await,
        StorageDriver::ConfigMap => watch_objects::<ConfigMap>(client, namespace, tx).await,
    }
}

async fn watch_objects<K>(client: Client, namespace: Option<&str>, tx: mpsc::Sender<Change>) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    let api: Api<K> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let cfg = watcher::Config::default().labels(OWNER_SELECTOR);
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %K::kind(&()), ns = ?namespace, selector = OWNER_SELECTOR, "watcher started");

    let mut known = KnownObjects::default();
    while let Some(ev) = stream.next().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                counter!("hrx_watch_errors_total").increment(1);
                warn!(error = %e, "watch error; retrying with backoff");
                continue;
            }
        };
        counter!("hrx_watch_events_total", "event" => event_label(&ev)).increment(1);
        let relisted = matches!(ev, Event::Restarted(_));
        let changes = known.changes_from(ev);
        if relisted {
            let gone = changes.iter().filter(|c| c.kind == ChangeKind::Delete).count();
            debug!(count = known.len(), gone, "watch (re)listed");
        }
        for change in changes {
            if tx.send(change).await.is_err() {
                info!("change receiver closed; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!("watcher stream ended");
    Ok(())
}
