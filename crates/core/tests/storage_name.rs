#![forbid(unsafe_code)]

use hrx_core::{format_storage_name, parse_storage_name, StorageName, MAX_REVISION};

fn ok(name: &str) -> StorageName {
    match parse_storage_name(name) {
        Ok(n) => n,
        Err(e) => panic!("expected {name:?} to parse: {e}"),
    }
}

#[test]
fn parses_helm3_secret_names() {
    assert_eq!(ok("sh.helm.release.v1.punkunicorn.v1"), StorageName { release: "punkunicorn".into(), revision: 1 });
    assert_eq!(ok("sh.helm.release.v1.kube-prometheus-stack.v42"), StorageName { release: "kube-prometheus-stack".into(), revision: 42 });
    // storage version is not pinned to 1
    assert_eq!(ok("sh.helm.release.v7.a.v3").revision, 3);
    assert_eq!(ok("sh.helm.release.v1.a.v007").revision, 7);
}

#[test]
fn format_is_the_inverse_of_parse() {
    let name = format_storage_name("pinkunicorn", 12);
    assert_eq!(name, "sh.helm.release.v1.pinkunicorn.v12");
    assert_eq!(ok(&name), StorageName { release: "pinkunicorn".into(), revision: 12 });
}

#[test]
fn rejects_names_outside_the_grammar() {
    let bad = [
        "",
        "punkunicorn",
        "sh.helm.release.v1.punkunicorn",
        "sh.helm.release.v1.punkunicorn.1",
        "sh.helm.release.v1.punkunicorn.v",
        "sh.helm.release.v1.punkunicorn.vx",
        "sh.helm.release.v1..v1",
        "sh.helm.release.v1.dotted.name.v1",
        "sh.helm.release.vX.punkunicorn.v1",
        "sh.helm.release.punkunicorn.v1",
        "helm.release.v1.punkunicorn.v1",
        "xsh.helm.release.v1.punkunicorn.v1",
        "sh.helm.release.v1.punkunicorn.v1.bak",
        "sh-helm-release-v1-punkunicorn-v1",
        "sh.helm.release.v1.punkunicorn.v-1",
    ];
    for name in bad {
        let err = parse_storage_name(name).expect_err(name);
        assert_eq!(err.name, name);
    }
}

#[test]
fn rejects_zero_and_overflowing_revisions() {
    assert_eq!(parse_storage_name("sh.helm.release.v1.a.v0").unwrap_err().reason, "revision must be positive");
    let huge = format!("sh.helm.release.v1.a.v{}0", u64::MAX);
    assert_eq!(parse_storage_name(&huge).unwrap_err().reason, "revision out of range");
    assert_eq!(parse_storage_name(&format!("sh.helm.release.v1.a.v{}", u64::MAX)).unwrap_err().reason, "revision out of range");
}

#[test]
fn revisions_stay_exact_as_metric_values() {
    assert_eq!(ok(&format!("sh.helm.release.v1.a.v{MAX_REVISION}")).revision, MAX_REVISION);
    assert_eq!(MAX_REVISION as f64 as u64, MAX_REVISION);
    let above = format!("sh.helm.release.v1.a.v{}", MAX_REVISION + 1);
    assert_eq!(parse_storage_name(&above).unwrap_err().reason, "revision out of range");
}
