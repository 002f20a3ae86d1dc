//! Label-vector metric registry.
//!
//! Families are registered up front with a fixed label schema; series are
//! addressed by their full label tuple. Unlike the `metrics` facade this store
//! can be read back and pruned by partial label match, which the reconciler
//! needs to retire series of deleted releases.

#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::sync::RwLock;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::warn;

mod expose;

pub use expose::{escape_label_value, format_value};

/// Label values in the family's label order.
type LabelValues = SmallVec<[String; 6]>;

/// One label pair as passed to and returned from the registry.
pub type Label<'a> = (&'a str, &'a str);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

/// Static description of a metric family.
#[derive(Debug, Clone, Copy)]
pub struct FamilyDesc {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
}

/// A series read back from the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

impl Series {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown metric family {0}")]
    UnknownFamily(String),
    #[error("labels do not match family {family}: {detail}")]
    LabelMismatch { family: String, detail: String },
    #[error("counter {0} cannot decrease")]
    CounterDecrease(String),
    #[error("metric family {0} lock poisoned")]
    Poisoned(String),
}

/// Store the reconciler drives. Implementations must be safe for concurrent
/// reads (scrapes) while a single writer reconciles.
pub trait MetricRegistry: Send + Sync {
    /// Set the series addressed by the full label tuple.
    fn set(&self, family: &str, labels: &[Label<'_>], value: f64) -> Result<(), RegistryError>;

    /// Add `delta` (>= 0 for counters) to the series, creating it at 0.
    fn add(&self, family: &str, labels: &[Label<'_>], delta: f64) -> Result<(), RegistryError>;

    /// Current value of the series, `None` if it does not exist.
    fn get(&self, family: &str, labels: &[Label<'_>]) -> Result<Option<f64>, RegistryError>;

    /// Remove every series whose labels include all of `subset`. Returns how many went.
    fn delete_partial_match(&self, family: &str, subset: &[Label<'_>]) -> Result<usize, RegistryError>;

    /// Every series whose labels include all of `subset`.
    fn select(&self, family: &str, subset: &[Label<'_>]) -> Result<Vec<Series>, RegistryError>;
}

struct Family {
    desc: FamilyDesc,
    series: RwLock<FxHashMap<LabelValues, f64>>,
}

impl Family {
    fn mismatch(&self, detail: String) -> RegistryError {
        RegistryError::LabelMismatch { family: self.desc.name.to_string(), detail }
    }

    fn poisoned(&self) -> RegistryError {
        RegistryError::Poisoned(self.desc.name.to_string())
    }

    /// Resolve a full label tuple into values in schema order.
    fn values(&self, labels: &[Label<'_>]) -> Result<LabelValues, RegistryError> {
        if labels.len() != self.desc.labels.len() {
            return Err(self.mismatch(format!("expected {} labels, got {}", self.desc.labels.len(), labels.len())));
        }
        self.desc
            .labels
            .iter()
            .map(|want| {
                labels
                    .iter()
                    .find(|(k, _)| k == want)
                    .map(|(_, v)| (*v).to_string())
                    .ok_or_else(|| self.mismatch(format!("label {want} missing")))
            })
            .collect()
    }

    /// Resolve a label subset into (position, value) matchers.
    fn matchers<'a>(&self, subset: &[Label<'a>]) -> Result<SmallVec<[(usize, &'a str); 6]>, RegistryError> {
        subset
            .iter()
            .map(|(k, v)| {
                self.desc
                    .labels
                    .iter()
                    .position(|l| l == k)
                    .map(|idx| (idx, *v))
                    .ok_or_else(|| self.mismatch(format!("unknown label {k}")))
            })
            .collect()
    }

    fn pairs(&self, values: &LabelValues) -> Vec<(String, String)> {
        self.desc.labels.iter().zip(values.iter()).map(|(k, v)| (k.to_string(), v.clone())).collect()
    }
}

fn matches(values: &LabelValues, matchers: &[(usize, &str)]) -> bool {
    matchers.iter().all(|(idx, v)| values.get(*idx).map(String::as_str) == Some(*v))
}

/// In-memory [`MetricRegistry`] with one lock per family.
pub struct LabelRegistry {
    families: FxHashMap<&'static str, Family>,
    order: Vec<&'static str>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self { families: FxHashMap::default(), order: Vec::new() }
    }

    pub fn with_families(descs: impl IntoIterator<Item = FamilyDesc>) -> Self {
        let mut me = Self::new();
        for d in descs {
            me.register(d);
        }
        me
    }

    /// Register a family. Re-registering a name replaces it and drops its series.
    pub fn register(&mut self, desc: FamilyDesc) {
        if self.families.insert(desc.name, Family { desc, series: RwLock::new(FxHashMap::default()) }).is_none() {
            self.order.push(desc.name);
        }
    }

    fn family(&self, name: &str) -> Result<&Family, RegistryError> {
        self.families.get(name).ok_or_else(|| RegistryError::UnknownFamily(name.to_string()))
    }

    /// Render every non-empty family in Prometheus text format 0.0.4.
    /// Series are sorted by label values so output is stable across scrapes.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for name in &self.order {
            let Some(fam) = self.families.get(name) else { continue };
            let series = match fam.series.read() {
                Ok(g) => {
                    let mut v: Vec<(LabelValues, f64)> = g.iter().map(|(k, v)| (k.clone(), *v)).collect();
                    v.sort_by(|a, b| a.0.cmp(&b.0));
                    v
                }
                Err(_) => {
                    warn!(family = fam.desc.name, "skipping poisoned metric family");
                    continue;
                }
            };
            if series.is_empty() {
                continue;
            }
            let _ = writeln!(out, "# HELP {} {}", fam.desc.name, fam.desc.help);
            let _ = writeln!(out, "# TYPE {} {}", fam.desc.name, fam.desc.kind.as_str());
            for (values, value) in series {
                out.push_str(fam.desc.name);
                if !values.is_empty() {
                    out.push('{');
                    for (i, (k, v)) in fam.desc.labels.iter().zip(values.iter()).enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        let _ = write!(out, "{}=\"{}\"", k, escape_label_value(v));
                    }
                    out.push('}');
                }
                let _ = writeln!(out, " {}", format_value(value));
            }
        }
        out
    }
}

impl Default for LabelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry for LabelRegistry {
    fn set(&self, family: &str, labels: &[Label<'_>], value: f64) -> Result<(), RegistryError> {
        let fam = self.family(family)?;
        let key = fam.values(labels)?;
        let mut series = fam.series.write().map_err(|_| fam.poisoned())?;
        series.insert(key, value);
        Ok(())
    }

    fn add(&self, family: &str, labels: &[Label<'_>], delta: f64) -> Result<(), RegistryError> {
        let fam = self.family(family)?;
        if fam.desc.kind == MetricKind::Counter && delta < 0.0 {
            return Err(RegistryError::CounterDecrease(family.to_string()));
        }
        let key = fam.values(labels)?;
        let mut series = fam.series.write().map_err(|_| fam.poisoned())?;
        *series.entry(key).or_insert(0.0) += delta;
        Ok(())
    }

    fn get(&self, family: &str, labels: &[Label<'_>]) -> Result<Option<f64>, RegistryError> {
        let fam = self.family(family)?;
        let key = fam.values(labels)?;
        let series = fam.series.read().map_err(|_| fam.poisoned())?;
        Ok(series.get(&key).copied())
    }

    fn delete_partial_match(&self, family: &str, subset: &[Label<'_>]) -> Result<usize, RegistryError> {
        let fam = self.family(family)?;
        let matchers = fam.matchers(subset)?;
        let mut series = fam.series.write().map_err(|_| fam.poisoned())?;
        let before = series.len();
        series.retain(|values, _| !matches(values, &matchers));
        Ok(before - series.len())
    }

    fn select(&self, family: &str, subset: &[Label<'_>]) -> Result<Vec<Series>, RegistryError> {
        let fam = self.family(family)?;
        let matchers = fam.matchers(subset)?;
        let series = fam.series.read().map_err(|_| fam.poisoned())?;
        let mut out: Vec<Series> = series
            .iter()
            .filter(|(values, _)| matches(values, &matchers))
            .map(|(values, value)| Series { labels: fam.pairs(values), value: *value })
            .collect();
        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(out)
    }
}
