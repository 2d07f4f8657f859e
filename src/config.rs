// drivevault configuration
// JSON config file plus the separate character replacement table

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunked::{ChunkSettings, DEFAULT_CHUNK_SIZE, DEFAULT_READ_SIZE};
use crate::path_translator::{default_replacements, PathTranslator, ReplacementRule, NAMESPACE_PREFIX};
use crate::providers::{DriveError, HttpRetryConfig, ReqwestTransport};
use crate::transforms::{AesCtrTransform, DeflateTransform, EncryptionKey, StreamTransform, TransformPipeline};

pub const DEFAULT_API_BASE_URL: &str = "https://storage.prod.mdl.swisscom.ch";
pub const DEFAULT_BACKUP_ROOT: &str = "/Drive/backup/";
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;
pub const MIN_READ_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// REST API base URL
    pub api_base_url: String,
    /// Local directory mirrored below `backup_root`
    pub local_base: PathBuf,
    /// Remote root, must start with /Drive/
    pub backup_root: String,
    /// Part object size in bytes
    pub chunk_size: u64,
    /// Local read size in bytes
    pub read_size: usize,
    pub encrypted: bool,
    pub compressed: bool,
    /// Ordered character replacements for remote names
    pub replacements: Vec<ReplacementRule>,
    pub retry: HttpRetryConfig,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    /// Salt for passphrase-derived encryption keys (hex)
    pub key_salt: Option<String>,
    /// OAuth2 client for refreshable sessions
    pub oauth_client_id: Option<String>,
    pub oauth_token_url: Option<String>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            local_base: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            backup_root: DEFAULT_BACKUP_ROOT.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_size: DEFAULT_READ_SIZE,
            encrypted: false,
            compressed: false,
            replacements: default_replacements(),
            retry: HttpRetryConfig::default(),
            request_timeout_secs: 300,
            connect_timeout_secs: 30,
            user_agent: format!("drivevault/{}", env!("CARGO_PKG_VERSION")),
            key_salt: None,
            oauth_client_id: None,
            oauth_token_url: None,
        }
    }
}

impl DriveConfig {
    /// `<config dir>/drivevault/config.json`
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
        config_dir.join("drivevault").join("config.json")
    }

    pub fn load(path: &Path) -> Result<Self, DriveError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| DriveError::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Config from the default location, falling back to defaults
    pub fn load_or_default() -> Self {
        let config_path = Self::default_path();
        if config_path.exists() {
            match Self::load(&config_path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("Ignoring config at {:?}: {}", config_path, e),
            }
        }
        Self::default()
    }

    pub fn save(&self, path: &Path) -> Result<(), DriveError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::info!("Config saved to {:?}", path);
        Ok(())
    }

    /// Clamp sizes into their valid ranges and check the remote root
    pub fn validate(mut self) -> Result<Self, DriveError> {
        if !self.backup_root.starts_with(NAMESPACE_PREFIX) {
            return Err(DriveError::PathConfiguration(format!(
                "Backup root '{}' must start with {}",
                self.backup_root, NAMESPACE_PREFIX
            )));
        }
        url::Url::parse(&self.api_base_url)
            .map_err(|e| DriveError::InvalidConfig(format!("Invalid API URL '{}': {}", self.api_base_url, e)))?;
        if self.replacements.iter().any(|r| r.character.is_empty()) {
            return Err(DriveError::InvalidConfig("Replacement rule with empty character".into()));
        }

        self.chunk_size = self.chunk_size.max(MIN_CHUNK_SIZE);
        let max_read = usize::try_from(self.chunk_size).unwrap_or(usize::MAX);
        self.read_size = self.read_size.clamp(MIN_READ_SIZE, max_read);
        Ok(self)
    }

    pub fn chunk_settings(&self) -> ChunkSettings {
        ChunkSettings {
            chunk_size: self.chunk_size,
            read_size: self.read_size,
        }
    }

    pub fn translator(&self) -> Result<PathTranslator, DriveError> {
        PathTranslator::new(&self.local_base, &self.backup_root, self.replacements.clone())
    }

    /// Compression runs before encryption; `key` is required when `encrypted` is set
    pub fn pipeline(&self, key: Option<EncryptionKey>) -> Result<TransformPipeline, DriveError> {
        let mut pipeline = TransformPipeline::default();
        if self.compressed {
            pipeline = pipeline.with(StreamTransform::Compression(DeflateTransform::default()));
        }
        if self.encrypted {
            let key = key.ok_or_else(|| DriveError::InvalidConfig("Encryption enabled but no key configured".into()))?;
            pipeline = pipeline.with(StreamTransform::Encryption(AesCtrTransform::new(key)));
        }
        Ok(pipeline)
    }

    /// Hex-encoded salt for passphrase keys
    pub fn key_salt_bytes(&self) -> Result<Vec<u8>, DriveError> {
        let salt = self
            .key_salt
            .as_deref()
            .ok_or_else(|| DriveError::InvalidConfig("Passphrase keys need `key_salt` in the config".into()))?;
        let bytes = hex::decode(salt).map_err(|e| DriveError::InvalidConfig(format!("Invalid key salt: {}", e)))?;
        if bytes.len() < 16 {
            return Err(DriveError::InvalidConfig("Key salt must be at least 16 bytes".into()));
        }
        Ok(bytes)
    }

    pub fn transport(&self) -> Result<ReqwestTransport, DriveError> {
        ReqwestTransport::new(
            Duration::from_secs(self.request_timeout_secs),
            Duration::from_secs(self.connect_timeout_secs),
        )
    }
}

/// Replacement table from a JSON file: `[{"character": ":", "replacement": "_"}]`
pub fn load_replacements(path: &Path) -> Result<Vec<ReplacementRule>, DriveError> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| DriveError::InvalidConfig(format!("Invalid replacement table {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriveConfig::default();
        assert_eq!(config.backup_root, "/Drive/backup/");
        assert_eq!(config.chunk_size, 5_120_000);
        assert_eq!(config.read_size, 65_536);
        assert!(!config.encrypted);
        assert!(config.user_agent.starts_with("drivevault/"));
        assert!(config.replacements.iter().any(|r| r.character == ":"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: DriveConfig = serde_json::from_str(r#"{"encrypted": true, "retry": {"max_retries": 5}}"#).unwrap();
        assert!(config.encrypted);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_validate_clamps_sizes() {
        let config = DriveConfig {
            chunk_size: 10,
            read_size: 1,
            ..DriveConfig::default()
        }
        .validate()
        .unwrap();
        assert_eq!(config.chunk_size, MIN_CHUNK_SIZE);
        assert_eq!(config.read_size, MIN_READ_SIZE);

        let config = DriveConfig {
            chunk_size: 100_000,
            read_size: 1_000_000,
            ..DriveConfig::default()
        }
        .validate()
        .unwrap();
        assert_eq!(config.read_size, 100_000);
    }

    #[test]
    fn test_validate_rejects_bad_root() {
        let config = DriveConfig {
            backup_root: "/Photos/".to_string(),
            ..DriveConfig::default()
        };
        assert!(matches!(config.validate(), Err(DriveError::PathConfiguration(_))));
    }

    #[test]
    fn test_pipeline_order() {
        let config = DriveConfig {
            encrypted: true,
            compressed: true,
            ..DriveConfig::default()
        };
        assert!(matches!(config.pipeline(None), Err(DriveError::InvalidConfig(_))));

        let key = EncryptionKey::from_master(&[3u8; 32]).unwrap();
        let pipeline = config.pipeline(Some(key)).unwrap();
        assert_eq!(pipeline.names(), vec!["deflate", "aes-256-ctr-hmac-sha256"]);
        assert!(DriveConfig::default().pipeline(None).unwrap().is_empty());
    }

    #[test]
    fn test_transport_from_config() {
        let config = DriveConfig {
            request_timeout_secs: 5,
            connect_timeout_secs: 1,
            ..DriveConfig::default()
        };
        assert!(config.transport().is_ok());
    }

    #[test]
    fn test_key_salt() {
        let mut config = DriveConfig::default();
        assert!(config.key_salt_bytes().is_err());
        config.key_salt = Some("00".repeat(8));
        assert!(config.key_salt_bytes().is_err());
        config.key_salt = Some("ab".repeat(16));
        assert_eq!(config.key_salt_bytes().unwrap(), vec![0xab; 16]);
    }

    #[test]
    fn test_save_load_and_replacements() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = DriveConfig {
            compressed: true,
            ..DriveConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(DriveConfig::load(&path).unwrap(), config);

        let table = dir.path().join("replacements.json");
        fs::write(&table, r##"[{"character": "#", "replacement": "-"}]"##).unwrap();
        let rules = load_replacements(&table).unwrap();
        assert_eq!(rules, vec![ReplacementRule::new("#", "-")]);

        fs::write(&table, "not json").unwrap();
        assert!(matches!(load_replacements(&table), Err(DriveError::InvalidConfig(_))));
    }
}
