//! Environment variable access over an injectable lookup.
//!
//! Process environment mutation is not thread-safe, so configuration parsing goes
//! through a lookup function and tests feed it a map instead of touching `std::env`.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use super::{ConfigError, ConfigResult};

/// Read-only view over environment-style key/value pairs.
pub struct EnvReader<F> {
    lookup: F,
}

impl EnvReader<fn(&str) -> Option<String>> {
    /// Reader over the process environment.
    pub fn process() -> Self {
        fn from_process(key: &str) -> Option<String> {
            std::env::var(key).ok()
        }
        Self {
            lookup: from_process,
        }
    }
}

impl<'a> EnvReader<Box<dyn Fn(&str) -> Option<String> + 'a>> {
    /// Reader over an in-memory map.
    pub fn from_map(map: &'a HashMap<String, String>) -> Self {
        Self {
            lookup: Box::new(move |key: &str| map.get(key).cloned()),
        }
    }
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Get an optional value. Blank values count as unset.
    pub fn opt(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Get an optional secret value.
    pub fn secret(&self, key: &str) -> Option<SecretString> {
        self.opt(key).map(SecretString::from)
    }

    /// Parse a boolean flag.
    ///
    /// Returns `true` if the value is "1", "true" or "yes" (case-insensitive).
    pub fn flag(&self, key: &str) -> bool {
        self.opt(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false)
    }

    /// Get a value with fallback keys.
    pub fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.opt(key))
    }

    /// Get a secret with fallback keys.
    pub fn first_secret(&self, keys: &[&str]) -> Option<SecretString> {
        self.first(keys).map(SecretString::from)
    }

    /// Parse a value, reporting the key on failure.
    pub fn parse<T>(&self, key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.opt(key) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Parse a whole number of seconds.
    pub fn seconds(&self, key: &str) -> ConfigResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }
}
