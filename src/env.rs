//! Configuration lookups.
//!
//! The collector asks the environment for configuration through three typed
//! accessors. A missing key is a valid negative answer, not an error.

use std::collections::HashMap;

/// Prefix of environment variables consulted by [`EnvConfig`].
pub const ENV_PREFIX: &str = "GCENV_";

pub trait ConfigSource: Send + Sync {
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_int(&self, key: &str) -> Option<i64>;
    fn get_string(&self, key: &str) -> Option<String>;
}

/// Parses integers the way heap sizes are usually written: decimal, `0x` hex,
/// or a number followed by a `k`/`m`/`g` factor with an optional trailing `b`.
pub fn parse_int(value: &str) -> Option<i64> {
    let mut value = value.trim();
    if value.is_empty() {
        return None;
    }

    let negative = value.starts_with('-');
    if negative {
        value = &value[1..];
    }

    let parsed = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        let (number, factor) = split_factor(value);
        if number.contains('.') {
            (number.parse::<f64>().ok()? * factor as f64) as i64
        } else {
            number.parse::<i64>().ok()?.checked_mul(factor)?
        }
    };

    Some(if negative { -parsed } else { parsed })
}

fn split_factor(value: &str) -> (&str, i64) {
    let mut value = value;
    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    let factor = match value.as_bytes().last() {
        Some(b'g') | Some(b'G') => 1024 * 1024 * 1024,
        Some(b'm') | Some(b'M') => 1024 * 1024,
        Some(b'k') | Some(b'K') => 1024,
        _ => return (value, 1),
    };

    (&value[..value.len() - 1], factor)
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let value = parse_int(&std::env::var(var).ok()?)?;
    usize::try_from(value).ok()
}

pub fn read_string_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Reads `GCENV_<key>` from the process environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    prefix: String,
}

impl EnvConfig {
    pub fn new() -> Self {
        Self::with_prefix(ENV_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var(&self, key: &str) -> Option<String> {
        let name = format!("{}{}", self.prefix, key);
        let value = read_string_from_env(&name);
        log::trace!(target: "gc-config", "{} = {:?}", name, value);
        value
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for EnvConfig {
    fn get_bool(&self, key: &str) -> Option<bool> {
        parse_bool(&self.var(key)?)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        parse_int(&self.var(key)?)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.var(key)
    }
}

/// In-memory configuration. Values are stored as text and parsed on lookup.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(key.into(), value.to_string());
        self
    }
}

impl ConfigSource for MapConfig {
    fn get_bool(&self, key: &str) -> Option<bool> {
        parse_bool(self.values.get(key)?)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        parse_int(self.values.get(key)?)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

pub const KEY_SUSPEND_WARN_MS: &str = "GCSuspendWarnMs";
pub const KEY_ALLOC_QUANTUM: &str = "GCgen0AllocQuantum";
pub const KEY_HEAP_HARD_LIMIT: &str = "GCHeapHardLimit";
pub const KEY_FORCE_BLOCKING: &str = "GCForceBlocking";

/// Options resolved once when an environment is created.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GcConfig {
    pub suspend_warn_timeout_ms: u64,
    pub alloc_quantum: usize,
    pub heap_hard_limit: usize,
    pub force_blocking: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            suspend_warn_timeout_ms: 1000,
            alloc_quantum: 8 * 1024,
            heap_hard_limit: 64 * 1024 * 1024,
            force_blocking: false,
        }
    }
}

impl GcConfig {
    pub fn resolve(source: &dyn ConfigSource) -> Self {
        let defaults = Self::default();
        let positive = |key: &str| {
            source
                .get_int(key)
                .filter(|v| *v > 0)
                .map(|v| v as u64)
        };

        let config = Self {
            suspend_warn_timeout_ms: positive(KEY_SUSPEND_WARN_MS)
                .unwrap_or(defaults.suspend_warn_timeout_ms),
            alloc_quantum: positive(KEY_ALLOC_QUANTUM)
                .map(|v| v as usize)
                .unwrap_or(defaults.alloc_quantum),
            heap_hard_limit: positive(KEY_HEAP_HARD_LIMIT)
                .map(|v| v as usize)
                .unwrap_or(defaults.heap_hard_limit),
            force_blocking: source
                .get_bool(KEY_FORCE_BLOCKING)
                .unwrap_or(defaults.force_blocking),
        };
        log::debug!(target: "gc-config", "{:?}", config);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ints_accept_hex_and_size_factors() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("0x10"), Some(16));
        assert_eq!(parse_int("4k"), Some(4096));
        assert_eq!(parse_int("2MB"), Some(2 * 1024 * 1024));
        assert_eq!(parse_int("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_int("-3"), Some(-3));
        assert_eq!(parse_int("0.5k"), Some(512));
        assert_eq!(parse_int(""), None);
        assert_eq!(parse_int("abc"), None);
    }

    #[test]
    fn bools_accept_common_spellings() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn missing_keys_are_not_found() {
        let config = MapConfig::new().set("GCgen0size", "0x1000");
        assert_eq!(config.get_int("GCgen0size"), Some(0x1000));
        assert_eq!(config.get_int("GCgen1size"), None);
        assert_eq!(config.get_bool("GCgen0size"), None);
        assert_eq!(config.get_string("GCgen0size").as_deref(), Some("0x1000"));
    }

    #[test]
    fn env_config_reads_prefixed_variables() {
        std::env::set_var("GCENV_TEST_ENV_CONFIG_server", "1");
        let config = EnvConfig::new();
        assert_eq!(config.get_bool("TEST_ENV_CONFIG_server"), Some(true));
        assert_eq!(config.get_bool("TEST_ENV_CONFIG_absent"), None);
    }

    #[test]
    fn resolve_falls_back_to_defaults() {
        let config = MapConfig::new()
            .set(KEY_ALLOC_QUANTUM, "16k")
            .set(KEY_SUSPEND_WARN_MS, "-1");
        let resolved = GcConfig::resolve(&config);
        assert_eq!(resolved.alloc_quantum, 16 * 1024);
        assert_eq!(resolved.suspend_warn_timeout_ms, 1000);
        assert!(!resolved.force_blocking);
    }
}
