//! Engine configuration.
//!
//! Loaded once at startup from TOML, then overridden by `EFGS_SYNC_*`
//! environment variables. Every field has a default so a config file only
//! needs the deployment-specific settings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "EFGS_SYNC_";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Federation gateway base URL.
    pub gateway_url: String,
    /// Verification server base URL.
    pub verification_url: String,
    /// Key server base URL.
    pub keyserver_url: String,

    /// Maximum keys per gateway upload.
    pub upload_batch_size: usize,
    /// Maximum keys per key server publish.
    pub keyserver_batch_size: usize,
    /// Maximum keys sharing a start interval within one publish.
    pub max_overlapping: usize,
    /// Keys older than this are neither uploaded nor kept.
    pub retention_days: i64,

    /// Lock name of the scheduled download job.
    pub download_lock_name: String,
    pub lock_lease_secs: u64,

    pub http_timeout_secs: u64,
    /// Retries of a request answered with 429 before giving up.
    pub max_throttle_retries: u32,

    /// PEM certificate used to sign upload batches.
    pub signing_certificate_path: Option<PathBuf>,
    /// PEM private key matching the signing certificate.
    pub signing_key_path: Option<PathBuf>,
    /// PEM bundle (certificate + key) for gateway mutual TLS.
    pub gateway_identity_path: Option<PathBuf>,

    pub verification_admin_api_key: String,
    pub verification_device_api_key: String,
    /// Test type requested when issuing verification codes.
    pub verification_test_type: String,

    /// SQLite file holding the key table and the lock table.
    pub database_path: Option<PathBuf>,

    /// Country code to Health Authority ID overrides.
    pub authorities: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gateway_url: String::new(),
            verification_url: String::new(),
            keyserver_url: String::new(),
            upload_batch_size: 5000,
            keyserver_batch_size: 250,
            max_overlapping: 15,
            retention_days: 14,
            download_lock_name: "efgs-download".to_string(),
            lock_lease_secs: 60 * 60,
            http_timeout_secs: 30,
            max_throttle_retries: 3,
            signing_certificate_path: None,
            signing_key_path: None,
            gateway_identity_path: None,
            verification_admin_api_key: String::new(),
            verification_device_api_key: String::new(),
            verification_test_type: "confirmed".to_string(),
            database_path: None,
            authorities: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml(&text)?;
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `EFGS_SYNC_*` overrides from `(name, value)` pairs.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(field) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "GATEWAY_URL" => self.gateway_url = value,
                "VERIFICATION_URL" => self.verification_url = value,
                "KEYSERVER_URL" => self.keyserver_url = value,
                "UPLOAD_BATCH_SIZE" => self.upload_batch_size = parse("upload_batch_size", &value)?,
                "KEYSERVER_BATCH_SIZE" => {
                    self.keyserver_batch_size = parse("keyserver_batch_size", &value)?
                }
                "MAX_OVERLAPPING" => self.max_overlapping = parse("max_overlapping", &value)?,
                "RETENTION_DAYS" => self.retention_days = parse("retention_days", &value)?,
                "DOWNLOAD_LOCK_NAME" => self.download_lock_name = value,
                "LOCK_LEASE_SECS" => self.lock_lease_secs = parse("lock_lease_secs", &value)?,
                "HTTP_TIMEOUT_SECS" => {
                    self.http_timeout_secs = parse("http_timeout_secs", &value)?
                }
                "MAX_THROTTLE_RETRIES" => {
                    self.max_throttle_retries = parse("max_throttle_retries", &value)?
                }
                "SIGNING_CERTIFICATE_PATH" => self.signing_certificate_path = Some(value.into()),
                "SIGNING_KEY_PATH" => self.signing_key_path = Some(value.into()),
                "GATEWAY_IDENTITY_PATH" => self.gateway_identity_path = Some(value.into()),
                "VERIFICATION_ADMIN_API_KEY" => self.verification_admin_api_key = value,
                "VERIFICATION_DEVICE_API_KEY" => self.verification_device_api_key = value,
                "DATABASE_PATH" => self.database_path = Some(value.into()),
                _ => log::warn!("CONFIG_UNKNOWN_OVERRIDE name={}", name),
            }
        }
        Ok(())
    }

    /// Reject settings no engine can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, url) in [
            ("gateway_url", &self.gateway_url),
            ("verification_url", &self.verification_url),
            ("keyserver_url", &self.keyserver_url),
        ] {
            if url.trim().is_empty() {
                return Err(ConfigError::Missing(field));
            }
        }

        for (field, value) in [
            ("upload_batch_size", self.upload_batch_size),
            ("keyserver_batch_size", self.keyserver_batch_size),
            ("max_overlapping", self.max_overlapping),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.retention_days <= 0 {
            return Err(ConfigError::Invalid {
                field: "retention_days",
                reason: format!("must be positive, got {}", self.retention_days),
            });
        }

        Ok(())
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn parse<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        gateway_url = "https://efgs.example"
        verification_url = "https://verify.example"
        keyserver_url = "https://keys.example"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = EngineConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.upload_batch_size, 5000);
        assert_eq!(config.retention_days, 14);
        assert_eq!(config.lock_lease(), Duration::from_secs(3600));
        assert_eq!(config.download_lock_name, "efgs-download");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_authority_overrides_parse() {
        let text = format!("{}\n[authorities]\nDE = \"rki\"\n", MINIMAL);
        let config = EngineConfig::from_toml(&text).unwrap();
        assert_eq!(config.authorities.get("DE").map(String::as_str), Some("rki"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::from_toml(MINIMAL).unwrap();
        config
            .apply_overrides(vec![
                ("EFGS_SYNC_UPLOAD_BATCH_SIZE".to_string(), "100".to_string()),
                ("EFGS_SYNC_GATEWAY_URL".to_string(), "https://other".to_string()),
                ("EFGS_SYNC_DATABASE_PATH".to_string(), "/var/lib/efgs/sync.db".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ])
            .unwrap();
        assert_eq!(config.upload_batch_size, 100);
        assert_eq!(config.gateway_url, "https://other");
        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/var/lib/efgs/sync.db"))
        );
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(vec![(
                "EFGS_SYNC_RETENTION_DAYS".to_string(),
                "two weeks".to_string(),
            )])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "retention_days", .. }));
    }

    #[test]
    fn test_validate_rejects_missing_url_and_zero_sizes() {
        assert!(matches!(
            EngineConfig::default().validate(),
            Err(ConfigError::Missing("gateway_url"))
        ));

        let mut config = EngineConfig::from_toml(MINIMAL).unwrap();
        config.keyserver_batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "keyserver_batch_size", .. })
        ));
    }
}
