//! Serde helpers for optional durations in declarative config.
//!
//! Accepts strings with a unit suffix (`"250ms"`, `"1s"`, `"2m"`, `"1h"`) or a bare integer
//! number of milliseconds. Serializes as milliseconds with an `ms` suffix.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

/// Parse a duration string such as `"100ms"`, `"30s"`, `"5m"` or `"1h"`.
///
/// A bare number is interpreted as milliseconds.
///
/// # Errors
///
/// Returns an error message if the string has no recognised unit or is not a number.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let parse = |n: &str| {
        n.trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid duration '{s}'"))
    };
    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(ms)?))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(secs)?))
    } else if let Some(mins) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(mins)? * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        Ok(Duration::from_secs(parse(hours)? * 3600))
    } else {
        Ok(Duration::from_millis(parse(s)?))
    }
}

pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.serialize_str(&format!("{}ms", d.as_millis())),
        None => serializer.serialize_none(),
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
        Some(RawDuration::Text(s)) => parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Holder {
        #[serde(default, with = "super")]
        d: Option<Duration>,
    }

    #[test]
    fn parses_units_and_bare_millis() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("3m"), Ok(Duration::from_secs(180)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("40"), Ok(Duration::from_millis(40)));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn deserializes_strings_numbers_and_missing() {
        let h: Holder = serde_json::from_str(r#"{"d":"1s"}"#).expect("string");
        assert_eq!(h.d, Some(Duration::from_secs(1)));
        let h: Holder = serde_json::from_str(r#"{"d":150}"#).expect("number");
        assert_eq!(h.d, Some(Duration::from_millis(150)));
        let h: Holder = serde_json::from_str("{}").expect("missing");
        assert_eq!(h.d, None);

        let out = serde_json::to_string(&Holder {
            d: Some(Duration::from_millis(1500)),
        })
        .expect("serialize");
        assert_eq!(out, r#"{"d":"1500ms"}"#);
    }
}
