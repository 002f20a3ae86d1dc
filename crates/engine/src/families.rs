//! The `helm_release_*` metric families.

use hrx_registry::{FamilyDesc, LabelRegistry, MetricKind};

pub const INFO: &str = "helm_release_info";
pub const REVISION: &str = "helm_release_revision";
pub const STATUS: &str = "helm_release_status";
pub const UPDATED: &str = "helm_release_updated";
pub const ERRORS: &str = "helm_release_errors";

pub const FAMILIES: [FamilyDesc; 5] = [
    FamilyDesc {
        name: INFO,
        help: "Information about helm release",
        kind: MetricKind::Gauge,
        labels: &["name", "namespace", "chart", "chart_version", "app_version", "revision"],
    },
    FamilyDesc {
        name: REVISION,
        help: "Currently deployed helm chart revision",
        kind: MetricKind::Gauge,
        labels: &["name", "namespace"],
    },
    FamilyDesc {
        name: STATUS,
        help: "Status of a helm release",
        kind: MetricKind::Gauge,
        labels: &["name", "namespace", "status"],
    },
    FamilyDesc {
        name: UPDATED,
        help: "Release update Unix time",
        kind: MetricKind::Gauge,
        labels: &["name", "namespace"],
    },
    FamilyDesc {
        name: ERRORS,
        help: "Errors occurred during metrics generation per namespace",
        kind: MetricKind::Counter,
        labels: &["namespace"],
    },
];

/// A registry with every release family registered.
pub fn release_registry() -> LabelRegistry {
    LabelRegistry::with_families(FAMILIES)
}
