//! Helm release payload codec.
//!
//! Helm keeps each revision in the `release` key of a Secret or ConfigMap:
//! base64 text of (usually gzip-compressed) JSON. Only the handful of fields
//! the exporter reports are read; chart metadata degrades field by field to
//! [`MISSING`](hrx_core::MISSING) instead of failing the record.

#![forbid(unsafe_code)]

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hrx_core::{ChartMeta, ReleaseRecord, Status, MAX_REVISION};
use serde::Deserialize;
use serde_json::{json, Value};

const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty release payload")]
    Empty,
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("gzip: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("release field {0} missing")]
    MissingField(&'static str),
    #[error("invalid revision {0}")]
    InvalidRevision(i64),
    #[error("invalid last_deployed timestamp {0:?}")]
    InvalidTimestamp(String),
}

#[derive(Deserialize)]
struct StoredRelease {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: i64,
    info: Option<StoredInfo>,
    #[serde(default)]
    chart: Value,
}

#[derive(Deserialize)]
struct StoredInfo {
    #[serde(default)]
    status: String,
    #[serde(default)]
    last_deployed: Option<String>,
}

/// Decode the `release` payload of the storage object living in `namespace`.
///
/// The record is labelled with the storage namespace, not the one inside the
/// payload: deletions only know the former.
pub fn decode_release(namespace: &str, payload: &[u8]) -> Result<ReleaseRecord, DecodeError> {
    let text = payload.trim_ascii();
    if text.is_empty() {
        return Err(DecodeError::Empty);
    }
    let raw = STANDARD.decode(text)?;
    let json = if raw.len() > GZIP_MAGIC.len() && raw.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::with_capacity(raw.len() * 4);
        GzDecoder::new(raw.as_slice()).read_to_end(&mut out).map_err(DecodeError::Gzip)?;
        out
    } else {
        raw
    };
    let stored: StoredRelease = serde_json::from_slice(&json)?;

    if stored.name.is_empty() {
        return Err(DecodeError::MissingField("name"));
    }
    if stored.version <= 0 || stored.version as u64 > MAX_REVISION {
        return Err(DecodeError::InvalidRevision(stored.version));
    }
    let info = stored.info.ok_or(DecodeError::MissingField("info"))?;
    let last_deployed = match info.last_deployed.as_deref() {
        None | Some("") => 0,
        Some(ts) => chrono::DateTime::parse_from_rfc3339(ts)
            .map(|dt| dt.timestamp())
            .map_err(|_| DecodeError::InvalidTimestamp(ts.to_string()))?,
    };

    Ok(ReleaseRecord {
        name: stored.name,
        namespace: namespace.to_string(),
        revision: stored.version as u64,
        chart: chart_meta(&stored.chart),
        status: Status::parse(&info.status),
        last_deployed,
    })
}

fn chart_meta(chart: &Value) -> ChartMeta {
    let Some(meta) = chart.get("metadata").and_then(Value::as_object) else {
        // seen in production, see helm/helm#1347
        return ChartMeta::missing();
    };
    let field = |key: &str| match meta.get(key) {
        None | Some(Value::Null) => Some(String::new()),
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => None,
    };
    ChartMeta { name: field("name"), version: field("version"), app_version: field("appVersion") }
}

/// Encode `record` the way Helm stores it: JSON, gzip, base64.
pub fn encode_release(record: &ReleaseRecord) -> std::io::Result<Vec<u8>> {
    let last_deployed = chrono::DateTime::from_timestamp(record.last_deployed, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default();
    let mut metadata = serde_json::Map::new();
    for (key, value) in [
        ("name", &record.chart.name),
        ("version", &record.chart.version),
        ("appVersion", &record.chart.app_version),
    ] {
        if let Some(v) = value {
            metadata.insert(key.to_string(), Value::String(v.clone()));
        }
    }
    let chart = if metadata.is_empty() { Value::Null } else { json!({ "metadata": metadata }) };
    let doc = json!({
        "name": record.name,
        "namespace": record.namespace,
        "version": record.revision,
        "info": {
            "status": record.status.as_str(),
            "last_deployed": last_deployed,
        },
        "chart": chart,
    });
    encode_payload(&serde_json::to_vec(&doc)?)
}

/// gzip + base64 an already serialized release document.
pub fn encode_payload(json: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(json)?;
    let compressed = gz.finish()?;
    Ok(STANDARD.encode(compressed).into_bytes())
}
