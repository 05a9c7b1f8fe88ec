//! Serde adapter for durations written as humantime strings ("250ms", "3m").
//!
//! Use with `#[serde(with = "shardrun_types::humantime_duration")]`.

use serde::{de::Error, Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serialize as e.g. `"1m 30s"`.
pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&humantime::format_duration(*duration).to_string())
}

/// Parse any humantime duration.
pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(D::Error::custom)
}
