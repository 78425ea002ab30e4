//! Typed access to the string-keyed option maps passed to `configure`.

use std::collections::HashMap;

use crate::NsError;

/// Option key: path of the changelog file of an in-memory service.
pub const CHANGELOG_PATH: &str = "changelog_path";

/// Option key: SQLite database file of a key-value service.
pub const SQLITE_PATH: &str = "sqlite_path";

/// Option key: soft cap on entities kept in a key-value service cache.
pub const CACHE_SIZE: &str = "cache_size";

/// Default value of [`CACHE_SIZE`].
pub const DEFAULT_CACHE_SIZE: u64 = 100_000;

/// Borrowed view over an option map.
///
/// ```rust
/// use std::collections::HashMap;
/// use namespace_md::Options;
///
/// let mut map = HashMap::new();
/// map.insert("cache_size".to_string(), "64".to_string());
/// let options = Options::new(&map);
/// assert_eq!(options.get_u64("cache_size", 10).unwrap(), 64);
/// assert_eq!(options.get_u64("missing", 10).unwrap(), 10);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Options<'a> {
    map: &'a HashMap<String, String>,
}

impl<'a> Options<'a> {
    /// Wrap an option map.
    pub fn new(map: &'a HashMap<String, String>) -> Self {
        Self { map }
    }

    /// Raw string value, trimmed; empty values count as absent.
    pub fn get_str(&self, key: &str) -> Option<&'a str> {
        self.map
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Unsigned integer value or `default` when absent.
    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64, NsError> {
        match self.get_str(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| NsError::InvalidConfig {
                key: key.into(),
                reason: format!("expected an unsigned integer, got {raw:?}"),
            }),
        }
    }

    /// Boolean value (`true/false`, `yes/no`, `1/0`, `on/off`) or `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, NsError> {
        match self.get_str(key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                _ => Err(NsError::InvalidConfig {
                    key: key.into(),
                    reason: format!("expected a boolean, got {raw:?}"),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_value_is_absent() {
        let m = map(&[(CHANGELOG_PATH, "  ")]);
        assert_eq!(Options::new(&m).get_str(CHANGELOG_PATH), None);
    }

    #[test]
    fn bad_integer_is_invalid_config() {
        let m = map(&[(CACHE_SIZE, "lots")]);
        let err = Options::new(&m).get_u64(CACHE_SIZE, 1).unwrap_err();
        assert!(matches!(err, NsError::InvalidConfig { ref key, .. } if key == CACHE_SIZE));
    }

    #[test]
    fn booleans() {
        let m = map(&[("a", "Yes"), ("b", "off"), ("c", "maybe")]);
        let options = Options::new(&m);
        assert!(options.get_bool("a", false).unwrap());
        assert!(!options.get_bool("b", true).unwrap());
        assert!(options.get_bool("c", true).is_err());
        assert!(options.get_bool("d", true).unwrap());
    }
}
