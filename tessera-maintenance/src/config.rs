//! Maintenance service configuration
//!
//! Configuration is layered:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. `TESSERA_*` environment variables
//! 4. Command line flags (applied by the binary)

use crate::overrides::{RedundancyOverride, RepairOverrides};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tessera_core::SigningIdentity;
use tessera_metabase::{DbConfig, GcConfig};
use tessera_overlay::{AuditHistoryConfig, OrderConfig, OverlayConfig, ReputationConfig};
use thiserror::Error;
use tracing::warn;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Repair worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Segments repaired at the same time
    pub max_concurrent_repairs: usize,
    /// Upper bound on one repair attempt, end to end
    pub per_job_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    /// Extra upload targets as a fraction of the pieces needed
    pub max_excess_rate_over_optimal: f64,
    /// Keep downloaded pieces in memory instead of temp files
    pub in_memory_repair: bool,
    /// Directory for temp files; the system temp dir if unset
    pub temp_dir: Option<PathBuf>,
    /// Attempts before a segment is reported irreparable
    pub max_attempts: u32,
    /// How often an empty durable queue is polled
    pub queue_poll_interval_ms: u64,
    /// Replacement nodes need at least this audit score
    pub min_node_reputation: f64,
    pub overrides: Vec<RedundancyOverride>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_concurrent_repairs: 5,
            per_job_timeout_secs: 300,
            download_timeout_secs: 60,
            upload_timeout_secs: 60,
            max_excess_rate_over_optimal: 0.05,
            in_memory_repair: false,
            temp_dir: None,
            max_attempts: 5,
            queue_poll_interval_ms: 500,
            min_node_reputation: 0.0,
            overrides: Vec::new(),
        }
    }
}

impl RepairConfig {
    pub fn per_job_timeout(&self) -> Duration {
        Duration::from_secs(self.per_job_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    /// Build the override map
    pub fn repair_overrides(&self) -> Result<RepairOverrides> {
        RepairOverrides::new(&self.overrides)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_repairs == 0 {
            return Err(ConfigError::Validation(
                "repair.max_concurrent_repairs must be > 0".to_string(),
            ));
        }
        for (name, secs) in [
            ("per_job_timeout_secs", self.per_job_timeout_secs),
            ("download_timeout_secs", self.download_timeout_secs),
            ("upload_timeout_secs", self.upload_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Validation(format!("repair.{} must be > 0", name)));
            }
        }
        if !(0.0..1.0).contains(&self.max_excess_rate_over_optimal) {
            return Err(ConfigError::Validation(format!(
                "repair.max_excess_rate_over_optimal {} outside [0, 1)",
                self.max_excess_rate_over_optimal
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "repair.max_attempts must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_node_reputation) {
            return Err(ConfigError::Validation(format!(
                "repair.min_node_reputation {} outside [0, 1]",
                self.min_node_reputation
            )));
        }
        self.repair_overrides()?;
        Ok(())
    }
}

/// Prometheus exporter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Satellite signing identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex-encoded ed25519 secret key
    pub secret_key_hex: Option<String>,
}

impl IdentityConfig {
    /// Load the configured identity, or generate an ephemeral one
    pub fn signing_identity(&self) -> Result<SigningIdentity> {
        match &self.secret_key_hex {
            Some(hex) => SigningIdentity::from_hex(hex)
                .map_err(|e| ConfigError::Validation(format!("identity.secret_key_hex: {}", e))),
            None => {
                warn!("No signing key configured, using an ephemeral identity");
                Ok(SigningIdentity::generate())
            }
        }
    }
}

/// Full maintenance service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub database: DbConfig,
    pub repair: RepairConfig,
    pub gc: GcConfig,
    pub reputation: ReputationConfig,
    pub audit_history: AuditHistoryConfig,
    pub overlay: OverlayConfig,
    pub orders: OrderConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    pub identity: IdentityConfig,
}

impl MaintenanceConfig {
    /// Defaults, then the file at `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Override fields from `TESSERA_*` variables returned by `lookup`
    ///
    /// Unparseable values are ignored and leave the field unchanged.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key);

        // ===== Database =====
        if let Some(url) = var("TESSERA_DATABASE_URL").or_else(|| var("DATABASE_URL")) {
            self.database.url = url;
        }
        set(&mut self.database.dialect, var("TESSERA_DATABASE_DIALECT"));
        set(&mut self.database.max_connections, var("TESSERA_DATABASE_MAX_CONNECTIONS"));

        // ===== Repair =====
        set(&mut self.repair.max_concurrent_repairs, var("TESSERA_MAX_CONCURRENT_REPAIRS"));
        set(&mut self.repair.per_job_timeout_secs, var("TESSERA_PER_JOB_TIMEOUT"));
        set(&mut self.repair.download_timeout_secs, var("TESSERA_DOWNLOAD_TIMEOUT"));
        set(&mut self.repair.upload_timeout_secs, var("TESSERA_UPLOAD_TIMEOUT"));
        set(&mut self.repair.max_excess_rate_over_optimal, var("TESSERA_MAX_EXCESS_RATE"));
        set_bool(&mut self.repair.in_memory_repair, var("TESSERA_IN_MEMORY_REPAIR"));
        set(&mut self.repair.max_attempts, var("TESSERA_REPAIR_MAX_ATTEMPTS"));
        set(&mut self.repair.min_node_reputation, var("TESSERA_MIN_NODE_REPUTATION"));
        if let Some(dir) = var("TESSERA_REPAIR_TEMP_DIR") {
            self.repair.temp_dir = Some(PathBuf::from(dir));
        }

        // ===== GC =====
        set(&mut self.gc.interval_secs, var("TESSERA_GC_INTERVAL"));
        set(&mut self.gc.batch_size, var("TESSERA_GC_BATCH_SIZE"));
        set(&mut self.gc.as_of_system_interval_secs, var("TESSERA_GC_AS_OF_INTERVAL"));
        set_bool(&mut self.gc.delete_expired, var("TESSERA_GC_DELETE_EXPIRED"));
        set_bool(&mut self.gc.delete_zombies, var("TESSERA_GC_DELETE_ZOMBIES"));

        // ===== Observability =====
        set_bool(&mut self.metrics.enabled, var("TESSERA_METRICS_ENABLED"));
        set(&mut self.metrics.port, var("TESSERA_METRICS_PORT"));
        if let Some(level) = var("TESSERA_LOG_LEVEL") {
            self.logging.level = level;
        }
        set_bool(&mut self.logging.json, var("TESSERA_LOG_JSON"));

        if let Some(key) = var("TESSERA_IDENTITY_SECRET") {
            self.identity.secret_key_hex = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Validation("database.url is empty".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be > 0".to_string(),
            ));
        }
        if self.gc.interval_secs == 0 {
            return Err(ConfigError::Validation("gc.interval_secs must be > 0".to_string()));
        }
        self.repair.validate()?;
        self.reputation
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        self.audit_history
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if self.orders.max_piece_size == 0 {
            return Err(ConfigError::Validation(
                "orders.max_piece_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn set<T: FromStr>(field: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.parse().ok()) {
        *field = parsed;
    }
}

fn set_bool(field: &mut bool, value: Option<String>) {
    if let Some(v) = value {
        *field = v == "true" || v == "1";
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tessera_metabase::Dialect;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.repair.max_concurrent_repairs, 5);
        assert_eq!(config.repair.per_job_timeout(), Duration::from_secs(300));
        assert_eq!(config.gc.batch_size, 1000);
        assert_eq!(config.metrics.port, 9090);
        assert!(!config.repair.in_memory_repair);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MaintenanceConfig::from_toml(
            r#"
            [database]
            url = "postgres://db/meta"
            dialect = "cockroach"

            [repair]
            max_concurrent_repairs = 12
            in_memory_repair = true

            [[repair.overrides]]
            required = 29
            optimal = 52
            total = 80
            repair_threshold = 40
            "#,
        )
        .unwrap();

        assert_eq!(config.database.url, "postgres://db/meta");
        assert_eq!(config.database.dialect, Dialect::Cockroach);
        assert_eq!(config.repair.max_concurrent_repairs, 12);
        assert!(config.repair.in_memory_repair);
        assert_eq!(config.repair.download_timeout_secs, 60);
        assert_eq!(config.repair.repair_overrides().unwrap().len(), 1);
        assert_eq!(config.gc.interval_secs, 3600);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = MaintenanceConfig::from_toml("[gc]\nbatch_size = 50\n").unwrap();
        config.apply_env(env(&[
            ("TESSERA_GC_BATCH_SIZE", "200"),
            ("TESSERA_MAX_CONCURRENT_REPAIRS", "9"),
            ("TESSERA_IN_MEMORY_REPAIR", "1"),
            ("TESSERA_DATABASE_DIALECT", "cockroachdb"),
            ("TESSERA_METRICS_PORT", "not-a-port"),
        ]));

        assert_eq!(config.gc.batch_size, 200);
        assert_eq!(config.repair.max_concurrent_repairs, 9);
        assert!(config.repair.in_memory_repair);
        assert_eq!(config.database.dialect, Dialect::Cockroach);
        assert_eq!(config.metrics.port, 9090);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = MaintenanceConfig::default();
        config.repair.max_concurrent_repairs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = MaintenanceConfig::default();
        config.repair.max_excess_rate_over_optimal = 1.5;
        assert!(config.validate().is_err());

        let mut config = MaintenanceConfig::default();
        config.reputation.audit_lambda = 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_and_print() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[metrics]\nenabled = false").unwrap();

        let config = MaintenanceConfig::from_file(file.path()).unwrap();
        assert!(!config.metrics.enabled);

        let rendered = config.to_toml().unwrap();
        let reparsed = MaintenanceConfig::from_toml(&rendered).unwrap();
        assert!(!reparsed.metrics.enabled);
        assert_eq!(reparsed.repair.max_attempts, config.repair.max_attempts);
    }

    #[test]
    fn test_identity_from_hex() {
        let config = IdentityConfig {
            secret_key_hex: Some("zz".to_string()),
        };
        assert!(config.signing_identity().is_err());
        assert!(IdentityConfig::default().signing_identity().is_ok());
    }
}
