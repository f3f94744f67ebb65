//! Configuration Registry: a declarative, typed parameter table with
//! category grouping, validation, and sensitive-value masking.
//!
//! Loading configuration from environment files is out of scope for this
//! crate (the composition root resolves key/value pairs, e.g. from
//! `std::env::vars()`, and hands them to `ConfigRegistry::load`); the
//! registry itself performs no I/O, which keeps it trivially testable.

use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

pub const MASK_TOKEN: &str = "***REDACTED***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
}

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub key: &'static str,
    pub category: &'static str,
    pub data_type: DataType,
    pub required: bool,
    pub default: Option<String>,
    pub sensitive: bool,
    pub validator: Option<fn(&str) -> Result<(), String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl ConfigValue {
    pub fn as_str(&self) -> String {
        match self {
            ConfigValue::String(s) => s.clone(),
            ConfigValue::Integer(i) => i.to_string(),
            ConfigValue::Float(f) => f.to_string(),
            ConfigValue::Boolean(b) => b.to_string(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Integer(i) => Some(*i as f64),
            ConfigValue::String(s) => s.parse().ok(),
            ConfigValue::Boolean(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::Integer(i) => Some(*i as u64),
            ConfigValue::Float(f) => Some(*f as u64),
            ConfigValue::String(s) => s.parse().ok(),
            ConfigValue::Boolean(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Boolean(b) => Some(*b),
            ConfigValue::String(s) => Some(coerce_bool(s)),
            _ => None,
        }
    }
}

/// Booleans accept true/1/yes/on case-insensitively.
fn coerce_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn coerce(data_type: DataType, raw: &str) -> Result<ConfigValue, String> {
    match data_type {
        DataType::String => Ok(ConfigValue::String(raw.to_string())),
        DataType::Integer => raw
            .parse::<i64>()
            .map(ConfigValue::Integer)
            .map_err(|e| format!("not an integer: {e}")),
        DataType::Float => raw
            .parse::<f64>()
            .map(ConfigValue::Float)
            .map_err(|e| format!("not a float: {e}")),
        DataType::Boolean => Ok(ConfigValue::Boolean(coerce_bool(raw))),
    }
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub valid: Vec<String>,
    pub invalid: Vec<(String, String)>,
    pub missing_required: Vec<String>,
    pub warnings: Vec<String>,
}

struct Entry {
    meta: ConfigEntry,
    value: ConfigValue,
}

/// Process-wide singleton, read-mostly, guarded by a read/write lock; writes
/// happen only on load/reload.
pub struct ConfigRegistry {
    entries: RwLock<HashMap<&'static str, Entry>>,
    schema: Vec<ConfigEntry>,
}

impl ConfigRegistry {
    pub fn new(schema: Vec<ConfigEntry>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            schema,
        }
    }

    /// Load already-resolved key/value pairs (e.g. sourced from the process
    /// environment by the composition root). Values are coerced, validated,
    /// and cached; missing optional keys fall back to their schema default.
    pub fn load(&self, values: &HashMap<String, String>) -> ValidationReport {
        let mut report = ValidationReport::default();
        let mut entries = self.entries.write().unwrap();
        entries.clear();

        for meta in &self.schema {
            let raw = values
                .get(meta.key)
                .cloned()
                .or_else(|| meta.default.clone());

            let raw = match raw {
                Some(r) => r,
                None => {
                    if meta.required {
                        report.missing_required.push(meta.key.to_string());
                    }
                    continue;
                }
            };

            match coerce(meta.data_type, &raw) {
                Ok(value) => {
                    if let Some(validator) = meta.validator {
                        if let Err(e) = validator(&raw) {
                            report.invalid.push((meta.key.to_string(), e));
                            continue;
                        }
                    }
                    entries.insert(meta.key, Entry { meta: meta.clone(), value });
                    report.valid.push(meta.key.to_string());
                }
                Err(e) => report.invalid.push((meta.key.to_string(), e)),
            }
        }

        if !report.invalid.is_empty() || !report.missing_required.is_empty() {
            warn!(
                invalid = report.invalid.len(),
                missing_required = report.missing_required.len(),
                "configuration validation found problems"
            );
        } else {
            info!(loaded = report.valid.len(), "configuration loaded");
        }

        report
    }

    /// Reload recomputes values and logs a diff against the previous state.
    pub fn reload(&self, values: &HashMap<String, String>) -> ValidationReport {
        let before: HashMap<&'static str, String> = {
            let entries = self.entries.read().unwrap();
            entries.iter().map(|(k, e)| (*k, e.value.as_str())).collect()
        };
        let report = self.load(values);
        let entries = self.entries.read().unwrap();
        for (key, entry) in entries.iter() {
            if let Some(prev) = before.get(key) {
                let now = entry.value.as_str();
                if *prev != now {
                    let shown = if entry.meta.sensitive { MASK_TOKEN } else { prev };
                    let shown_now = if entry.meta.sensitive { MASK_TOKEN } else { &now };
                    info!(key = *key, from = shown, to = shown_now, "configuration value changed on reload");
                }
            }
        }
        report
    }

    pub fn get(&self, key: &str) -> Option<ConfigValue> {
        self.entries.read().unwrap().get(key).map(|e| e.value.clone())
    }

    pub fn get_or(&self, key: &str, default: ConfigValue) -> ConfigValue {
        self.get(key).unwrap_or(default)
    }

    pub fn get_by_category(&self, category: &str) -> HashMap<String, ConfigValue> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.meta.category == category)
            .map(|(k, e)| (k.to_string(), e.value.clone()))
            .collect()
    }

    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        let entries = self.entries.read().unwrap();
        for meta in &self.schema {
            if entries.contains_key(meta.key) {
                report.valid.push(meta.key.to_string());
            } else if meta.required {
                report.missing_required.push(meta.key.to_string());
            } else {
                report.warnings.push(format!("{} not set, using default", meta.key));
            }
        }
        report
    }

    /// Render every currently-loaded entry, masking sensitive values — for
    /// logs, diagnostics, and config exports.
    pub fn render_masked(&self) -> HashMap<String, String> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|(k, e)| {
                let v = if e.meta.sensitive { MASK_TOKEN.to_string() } else { e.value.as_str() };
                (k.to_string(), v)
            })
            .collect()
    }
}

/// The schema enumerated in §6: WebSocket, endpoint, price-monitor, and
/// monitoring categories.
pub fn default_schema() -> Vec<ConfigEntry> {
    use DataType::*;
    vec![
        entry("WEBSOCKET_DEFAULT_RECONNECT_DELAY", "websocket", Float, "1.0"),
        entry("WEBSOCKET_MAX_RECONNECT_DELAY", "websocket", Float, "30.0"),
        entry("WEBSOCKET_PING_INTERVAL", "websocket", Integer, "20"),
        entry("WEBSOCKET_PING_TIMEOUT", "websocket", Integer, "20"),
        entry("WEBSOCKET_CONNECT_TIMEOUT", "websocket", Integer, "30"),
        entry("WEBSOCKET_SUBSCRIPTION_TIMEOUT", "websocket", Integer, "60"),
        entry("WEBSOCKET_MAX_RETRIES_PER_ENDPOINT", "websocket", Integer, "3"),
        entry("WEBSOCKET_MAX_MESSAGE_SIZE", "websocket", Integer, "10485760"),
        entry("MAX_ENDPOINT_FAILURES", "endpoints", Integer, "3"),
        entry("ENDPOINT_FAILURE_RESET_SECONDS", "endpoints", Integer, "300"),
        sensitive_entry("PRIMARY_RPC_URL", "endpoints", String, "https://api.mainnet-beta.solana.com"),
        sensitive_entry("PRIMARY_WSS_URL", "endpoints", String, "wss://api.mainnet-beta.solana.com"),
        sensitive_entry("FALLBACK_RPC_URL", "endpoints", String, ""),
        sensitive_entry("FALLBACK_WSS_URL", "endpoints", String, ""),
        sensitive_entry("RPC_API_KEY", "endpoints", String, ""),
        entry("PRICEMONITOR_INTERVAL", "price_monitor", Integer, "30"),
        entry("SOL_PRICE_CACHE_DURATION", "price_monitor", Integer, "300"),
        entry("MAX_PRICE_HISTORY", "price_monitor", Integer, "100"),
        entry("REFERENCE_CURRENCY_FALLBACK_PRICE", "price_monitor", Float, "150.0"),
        sensitive_entry("REFERENCE_CURRENCY_PRIMARY_URL", "price_monitor", String, "https://price.jup.ag/v6/price"),
        sensitive_entry("REFERENCE_CURRENCY_BACKUP_URL", "price_monitor", String, "https://api.coingecko.com/api/v3/simple/price"),
        entry("MONITORING_INTERVAL_SECONDS", "monitoring", Integer, "60"),
        entry("CIRCUIT_BREAKER_MAX_CONSECUTIVE_FAILURES", "monitoring", Integer, "5"),
        entry("CIRCUIT_BREAKER_RESET_AFTER_MINUTES", "monitoring", Integer, "2"),
    ]
}

fn entry(key: &'static str, category: &'static str, data_type: DataType, default: &'static str) -> ConfigEntry {
    ConfigEntry {
        key,
        category,
        data_type,
        required: false,
        default: Some(default.to_string()),
        sensitive: false,
        validator: None,
    }
}

fn sensitive_entry(key: &'static str, category: &'static str, data_type: DataType, default: &'static str) -> ConfigEntry {
    ConfigEntry {
        sensitive: true,
        ..entry(key, category, data_type, default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_coercion_accepts_common_spellings() {
        for truthy in ["true", "1", "yes", "on", "TRUE", "On"] {
            assert!(coerce_bool(truthy), "{truthy} should coerce to true");
        }
        assert!(!coerce_bool("false"));
        assert!(!coerce_bool("nope"));
    }

    #[test]
    fn sensitive_values_are_masked_on_render() {
        let registry = ConfigRegistry::new(default_schema());
        let mut values = HashMap::new();
        values.insert("RPC_API_KEY".to_string(), "super-secret".to_string());
        registry.load(&values);
        let rendered = registry.render_masked();
        assert_eq!(rendered.get("RPC_API_KEY").unwrap(), MASK_TOKEN);
    }

    #[test]
    fn missing_required_key_is_reported() {
        let schema = vec![ConfigEntry {
            required: true,
            default: None,
            ..entry("MUST_BE_SET", "test", DataType::String, "")
        }];
        let registry = ConfigRegistry::new(schema);
        let report = registry.load(&HashMap::new());
        assert_eq!(report.missing_required, vec!["MUST_BE_SET".to_string()]);
    }

    #[test]
    fn get_by_category_filters() {
        let registry = ConfigRegistry::new(default_schema());
        registry.load(&HashMap::new());
        let ws = registry.get_by_category("websocket");
        assert!(ws.contains_key("WEBSOCKET_PING_INTERVAL"));
        assert!(!ws.contains_key("PRICEMONITOR_INTERVAL"));
    }
}
