//! CLI to Config conversion utilities

use anyhow::{Context, Result};

/// Parse a memory string (e.g., "1000", "512m", "2g") to megabytes
///
/// A bare number is already in MB.
pub fn parse_memory_mb(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with("gb") || s.ends_with('g') {
        (s.trim_end_matches("gb").trim_end_matches('g'), 1024u64)
    } else if s.ends_with("mb") || s.ends_with('m') {
        (s.trim_end_matches("mb").trim_end_matches('m'), 1)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str.parse()
        .with_context(|| format!("Invalid memory format: {}", s))?;

    Ok(num * multiplier)
}

/// Parse a duration string (e.g., "500ms", "3s", "1m") to milliseconds
///
/// A bare number is taken as milliseconds.
pub fn parse_duration_ms(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with("ms") {
        (s.trim_end_matches("ms"), 1u64)
    } else if s.ends_with("sec") || s.ends_with('s') {
        (s.trim_end_matches("sec").trim_end_matches('s'), 1000)
    } else if s.ends_with("min") || s.ends_with('m') {
        (s.trim_end_matches("min").trim_end_matches('m'), 60_000)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str.parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;

    Ok(num * multiplier)
}

/// Parse a `KEY=VALUE` environment override
///
/// Splits at the first `=`; a bare `KEY` maps to an empty value.
pub fn parse_env_pair(s: &str) -> Result<(String, String)> {
    let s = s.trim();
    let (key, value) = match s.find('=') {
        Some(index) => (&s[..index], &s[index + 1..]),
        None => (s, ""),
    };
    if key.is_empty() {
        anyhow::bail!("Environment override '{}' has an empty key", s);
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_mb() {
        assert_eq!(parse_memory_mb("1000").unwrap(), 1000);
        assert_eq!(parse_memory_mb("512m").unwrap(), 512);
        assert_eq!(parse_memory_mb("512MB").unwrap(), 512);
        assert_eq!(parse_memory_mb("2g").unwrap(), 2048);
        assert!(parse_memory_mb("lots").is_err());
    }

    #[test]
    fn test_parse_duration_ms() {
        assert_eq!(parse_duration_ms("250").unwrap(), 250);
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("3s").unwrap(), 3000);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
    }

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("PATH=/bin:/usr/bin").unwrap(),
            ("PATH".to_string(), "/bin:/usr/bin".to_string())
        );
        assert_eq!(
            parse_env_pair("OPTS=a=b").unwrap(),
            ("OPTS".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_env_pair(" FLAG ").unwrap(), ("FLAG".to_string(), String::new()));
        assert_eq!(parse_env_pair("EMPTY=").unwrap(), ("EMPTY".to_string(), String::new()));
        assert!(parse_env_pair("=value").is_err());
    }
}
