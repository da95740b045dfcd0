//! Human-readable duration parsing and serde codecs.
//!
//! cachi2's `RequestFlags` carries a couple of timeouts
//! (`fetch_read_timeout`, `fetch_total_timeout`). This crate supplies the
//! `serde(with = "...")` modules for reading those as humantime strings
//! (`"60s"`, `"10m"`) when a request arrives as YAML/TOML/JSON rather than
//! already-constructed Rust values, plus the display-side formatter used by
//! diagnostic events and the CLI's progress reporter.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// `#[serde(with = "cachi2_duration::as_humantime")]` for a plain `Duration`
/// field.
pub mod as_humantime {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Same as [`as_humantime`] but for `Option<Duration>`.
pub mod as_humantime_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => humantime::format_duration(*d).to_string().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Parses a free-form duration string (`"1h30m"`, `"90s"`, `"500ms"`) the
/// way a CLI flag value would be parsed: same grammar as [`as_humantime`],
/// exposed directly for `clap`'s `value_parser`.
pub fn parse(raw: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw)
}

/// Formats a duration the way diagnostic events and progress output do:
/// whole seconds when the value is exact, otherwise humantime's default
/// rendering.
pub fn format(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "as_humantime")]
        timeout: Duration,
    }

    #[test]
    fn round_trips_through_json() {
        let value = Wrapper {
            timeout: Duration::from_secs(90),
        };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"timeout":"1m 30s"}"#);
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn parse_accepts_plain_seconds() {
        assert_eq!(parse("60s").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse("not-a-duration").is_err());
    }

    #[test]
    fn format_matches_humantime() {
        assert_eq!(format(Duration::from_secs(32)), "32s");
    }
}
