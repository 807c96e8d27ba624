//! Shared serialization/deserialization utilities for configuration

/// Go-style duration strings (`"168h"`, `"1h30m"`, `"500ms"`).
///
/// Bare integers are read as seconds so hand-written configs can stay terse.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct App {
///     #[serde(with = "oms_core::config::serde_utils::go_duration")]
///     temp_date: Duration,
/// }
/// ```
pub mod go_duration {
    use serde::{self, de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(de::Error::custom),
        }
    }

    /// Parse a sequence of `<number><unit>` pairs.
    pub fn parse(input: &str) -> Result<Duration, String> {
        let s = input.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }
        if s == "0" {
            return Ok(Duration::ZERO);
        }

        let mut total = 0f64;
        let mut rest = s;
        while !rest.is_empty() {
            let num_end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| format!("missing unit in duration {input:?}"))?;
            if num_end == 0 {
                return Err(format!("invalid duration {input:?}"));
            }
            let value: f64 = rest[..num_end]
                .parse()
                .map_err(|_| format!("invalid number in duration {input:?}"))?;
            rest = &rest[num_end..];

            let unit_end = rest
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(rest.len());
            let scale = match &rest[..unit_end] {
                "ns" => 1e-9,
                "us" | "µs" => 1e-6,
                "ms" => 1e-3,
                "s" => 1.0,
                "m" => 60.0,
                "h" => 3600.0,
                other => return Err(format!("unknown unit {other:?} in duration {input:?}")),
            };
            total += value * scale;
            rest = &rest[unit_end..];
        }

        Ok(Duration::from_secs_f64(total))
    }

    /// Render as the shortest `XhYmZs` form.
    pub fn format(duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs == 0 {
            return format!("{}ms", duration.as_millis());
        }
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        let mut out = String::new();
        if h > 0 {
            out.push_str(&format!("{h}h"));
        }
        if m > 0 {
            out.push_str(&format!("{m}m"));
        }
        if s > 0 || out.is_empty() {
            out.push_str(&format!("{s}s"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::go_duration;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        #[serde(with = "go_duration")]
        keep: Duration,
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(
            go_duration::parse("1h30m").unwrap(),
            Duration::from_secs(5400)
        );
        assert_eq!(
            go_duration::parse("168h").unwrap(),
            Duration::from_secs(168 * 3600)
        );
        assert_eq!(
            go_duration::parse("500ms").unwrap(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(go_duration::parse("").is_err());
        assert!(go_duration::parse("10").is_err());
        assert!(go_duration::parse("10d").is_err());
        assert!(go_duration::parse("h").is_err());
    }

    #[test]
    fn test_yaml_accepts_string_or_seconds() {
        let a: TestConfig = serde_yaml::from_str("keep: 2h").unwrap();
        assert_eq!(a.keep, Duration::from_secs(7200));
        let b: TestConfig = serde_yaml::from_str("keep: 90").unwrap();
        assert_eq!(b.keep, Duration::from_secs(90));
    }

    #[test]
    fn test_format() {
        assert_eq!(go_duration::format(Duration::from_secs(5400)), "1h30m");
        assert_eq!(go_duration::format(Duration::from_secs(61)), "1m1s");
        assert_eq!(go_duration::format(Duration::from_millis(120)), "120ms");
    }
}
