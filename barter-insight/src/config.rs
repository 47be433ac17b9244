//! Environment driven configuration helpers.
//!
//! Every component exposes a plain `*Config` struct with a [`Default`], `with_*` builder methods
//! and a `from_env()` constructor. Unset or unparsable variables fall back to the default value.

use std::{num::ParseIntError, str::FromStr, time::Duration};
use tracing::warn;

/// Parse the environment variable `key`, falling back to `default` when unset or invalid.
pub fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(&raw).unwrap_or_else(|| {
            warn!(key, value = %raw, "ignoring unparsable environment variable");
            default
        }),
        Err(_) => default,
    }
}

/// Parse the environment variable `key` as a number of milliseconds. Zero counts as unset.
pub fn env_millis_or(key: &str, default: Duration) -> Duration {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };

    match parse_millis(&raw) {
        Ok(Some(duration)) => duration,
        Ok(None) => default,
        Err(error) => {
            warn!(key, value = %raw, %error, "ignoring unparsable environment variable");
            default
        }
    }
}

fn parse_value<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

/// `Ok(None)` for zero, which counts as unset.
fn parse_millis(raw: &str) -> Result<Option<Duration>, ParseIntError> {
    raw.trim()
        .parse::<u64>()
        .map(|millis| (millis > 0).then(|| Duration::from_millis(millis)))
}
