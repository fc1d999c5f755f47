//! Delta object naming
//!
//! Every delta is written to `<target-namespace>/<source-key>_<YYYYMMDDHHMMSS>`
//! so downstream consumers can list the namespace under a known prefix and
//! order deltas by parsing the UTC timestamp suffix.

use crate::storage::{ObjectUri, TargetNamespace};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Timestamp format of the delta suffix (second granularity, UTC)
pub const DELTA_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

const SUFFIX_LEN: usize = 14;

/// Derive the target identifier for a delta exported at `timestamp`.
///
/// Two exports of the same source within the same second produce the same
/// name.
pub fn derive_target(
    namespace: &TargetNamespace,
    source: &ObjectUri,
    timestamp: DateTime<Utc>,
) -> ObjectUri {
    let key = format!(
        "{}_{}",
        source.key(),
        timestamp.format(DELTA_TIMESTAMP_FORMAT)
    );
    namespace.join(&key)
}

/// Split a delta key into the original source key and its export timestamp
pub fn parse_delta_name(key: &str) -> Option<(&str, DateTime<Utc>)> {
    let (source_key, suffix) = key.rsplit_once('_')?;
    if source_key.is_empty() || suffix.len() != SUFFIX_LEN || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(suffix, DELTA_TIMESTAMP_FORMAT).ok()?;
    Some((source_key, naive.and_utc()))
}
