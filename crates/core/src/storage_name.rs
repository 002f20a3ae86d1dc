//! Release identity recovered from a storage object name.
//!
//! Helm names every storage object `sh.helm.release.v<storage-version>.<release>.v<revision>`.
//! Deletions carry no body, so this name is the only place the release and
//! revision can be read from. Any change of that convention must fail here
//! instead of silently dropping metric cleanup.

use once_cell::sync::Lazy;
use regex::Regex;

/// Prefix Helm 3 uses for the objects it stores releases in.
pub const STORAGE_PREFIX: &str = "sh.helm.release.v1";

/// Highest revision accepted. Revisions are exported as f64 samples and read
/// back as the revision cursor, so they must stay exactly representable.
pub const MAX_REVISION: u64 = 1 << 53;

static RE_STORAGE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^sh\.helm\.release\.v\d+\.([^.]+)\.v(\d+)$").expect("static storage name regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageName {
    pub release: String,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unable to parse release name from storage object name {name:?}: {reason}")]
pub struct ParseError {
    pub name: String,
    pub reason: &'static str,
}

pub fn parse_storage_name(name: &str) -> Result<StorageName, ParseError> {
    let err = |reason| ParseError { name: name.to_string(), reason };
    let caps = RE_STORAGE_NAME.captures(name).ok_or_else(|| err("does not match sh.helm.release.v<n>.<release>.v<revision>"))?;
    let release = caps.get(1).map(|m| m.as_str()).ok_or_else(|| err("release segment missing"))?;
    let revision = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .filter(|r| *r <= MAX_REVISION)
        .ok_or_else(|| err("revision out of range"))?;
    if revision == 0 {
        return Err(err("revision must be positive"));
    }
    Ok(StorageName { release: release.to_string(), revision })
}

pub fn format_storage_name(release: &str, revision: u64) -> String {
    format!("{STORAGE_PREFIX}.{release}.v{revision}")
}
