//! Configuration for the escrow ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Minimum payment of a fresh ledger: 0.001 base units
pub const DEFAULT_MINIMUM_PAYMENT: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Minimum payment for new packages.
    ///
    /// Only applied when the store is created; an existing store keeps the
    /// value it was created with.
    pub minimum_payment: Decimal,

    /// Emit logs as JSON lines
    pub log_json: bool,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/escrow"),
            service_name: "delivery-escrow".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            minimum_payment: DEFAULT_MINIMUM_PAYMENT,
            log_json: false,
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync the WAL on every commit
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 2,
            max_background_jobs: 2,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("ESCROW_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(amount) = std::env::var("ESCROW_MINIMUM_PAYMENT") {
            config.minimum_payment = Decimal::from_str(&amount).map_err(|e| {
                crate::Error::Config(format!("Invalid ESCROW_MINIMUM_PAYMENT {:?}: {}", amount, e))
            })?;
        }

        if let Ok(flag) = std::env::var("ESCROW_LOG_JSON") {
            config.log_json = matches!(flag.as_str(), "1" | "true" | "TRUE" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.minimum_payment <= Decimal::ZERO {
            return Err(crate::Error::Config(format!(
                "minimum_payment must be positive, got {}",
                self.minimum_payment
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "delivery-escrow");
        assert_eq!(config.minimum_payment, Decimal::new(1, 3));
        assert!(config.rocksdb.sync_writes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/escrow"
minimum_payment = "0.01"

[rocksdb]
sync_writes = false
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/escrow"));
        assert_eq!(config.minimum_payment, Decimal::new(1, 2));
        assert!(!config.rocksdb.sync_writes);
        assert_eq!(config.rocksdb.max_background_jobs, 2);
        assert_eq!(config.service_name, "delivery-escrow");
    }

    #[test]
    fn test_rejects_non_positive_minimum() {
        let config = Config {
            minimum_payment: Decimal::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_from_file_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.toml");
        std::fs::write(&path, "data_dir = [").unwrap();
        assert!(matches!(Config::from_file(&path), Err(crate::Error::Config(_))));
    }
}
