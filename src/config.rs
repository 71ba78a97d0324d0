use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PermError, PermResult};

/// Engine settings. Unspecified fields keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Skip the built-in default-allow rules for view actions.
    pub default_deny: bool,
    /// Without this, `execute-sql` carries an instance-wide deny.
    pub default_allow_sql: bool,
    /// Grant the actor with id "root" an instance-wide allow.
    pub root_enabled: bool,
    /// Bound on one resolution call; 0 disables the bound.
    pub resolution_timeout_ms: u64,
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// Number of recent point checks kept for debugging.
    pub check_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_deny: false,
            default_allow_sql: false,
            root_enabled: false,
            resolution_timeout_ms: 0,
            default_page_size: 50,
            max_page_size: 1000,
            check_log_capacity: 200,
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_num<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl EngineConfig {
    /// Overlay `PERMSQL_*` environment variables on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_bool("PERMSQL_DEFAULT_DENY") { self.default_deny = v; }
        if let Some(v) = env_bool("PERMSQL_DEFAULT_ALLOW_SQL") { self.default_allow_sql = v; }
        if let Some(v) = env_bool("PERMSQL_ROOT_ENABLED") { self.root_enabled = v; }
        if let Some(v) = env_num("PERMSQL_TIMEOUT_MS") { self.resolution_timeout_ms = v; }
        if let Some(v) = env_num("PERMSQL_PAGE_SIZE") { self.default_page_size = v; }
        self
    }

    pub fn validate(&self) -> PermResult<()> {
        if self.max_page_size == 0 || self.max_page_size > 1000 {
            return Err(PermError::Config(format!("max_page_size must be within 1..=1000, got {}", self.max_page_size)));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(PermError::Config(format!(
                "default_page_size must be within 1..={}, got {}",
                self.max_page_size, self.default_page_size
            )));
        }
        Ok(())
    }
}

/// Declarative permissions document.
///
/// ```json
/// {
///   "permissions": {"view-instance": {"id": "admin"}},
///   "allow": {"id": "*"},
///   "allow_sql": {"id": "analyst"},
///   "databases": {
///     "sales": {
///       "permissions": {"view-database": true},
///       "allow": {"team": "sales"},
///       "tables": {"orders": {"allow": {"id": "carol"}}},
///       "queries": {"top": {"permissions": {"view-query": {"id": "bob"}}}}
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct PermissionsConfig(pub Value);

impl PermissionsConfig {
    pub fn empty() -> Self { Self(Value::Object(Default::default())) }

    pub fn get(&self, key: &str) -> Option<&Value> { self.0.get(key).filter(|v| !v.is_null()) }
}

/// On-disk file: `{"settings": {...}, "permissions": {...}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    #[serde(default)]
    pub settings: EngineConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
}

pub fn load_config_file<P: AsRef<Path>>(path: P) -> PermResult<ConfigFile> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| PermError::Config(format!("read {}: {}", path.display(), e)))?;
    let mut file: ConfigFile = serde_json::from_str(&text)?;
    if file.permissions.0.is_null() { file.permissions = PermissionsConfig::empty(); }
    file.settings = file.settings.with_env_overrides();
    file.settings.validate()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = EngineConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.max_page_size, 1000);
        assert!(!c.default_allow_sql);
    }

    #[test]
    fn validate_bounds() {
        let c = EngineConfig { max_page_size: 2000, ..Default::default() };
        assert!(c.validate().is_err());
        let c = EngineConfig { default_page_size: 0, ..Default::default() };
        assert!(c.validate().is_err());
    }

    #[test]
    fn partial_settings_keep_defaults() {
        let c: EngineConfig = serde_json::from_str(r#"{"default_deny": true}"#).unwrap();
        assert!(c.default_deny);
        assert_eq!(c.default_page_size, 50);
    }

    #[test]
    fn load_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("perms.json");
        std::fs::write(&p, r#"{"settings": {"root_enabled": true}, "permissions": {"allow": {"id": "*"}}}"#).unwrap();
        let f = load_config_file(&p).unwrap();
        assert!(f.settings.root_enabled);
        assert!(f.permissions.get("allow").is_some());
        assert!(f.permissions.get("databases").is_none());
    }

    #[test]
    fn load_file_errors_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("bad.json");
        std::fs::write(&p, "{not json").unwrap();
        assert!(matches!(load_config_file(&p), Err(PermError::Config(_))));
        assert!(matches!(load_config_file(dir.path().join("missing.json")), Err(PermError::Config(_))));
    }
}
