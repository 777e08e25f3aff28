//! EFGS Sync - Federation gateway synchronization engine
//!
//! Moves exposure-notification diagnosis keys between a national backend and
//! the federation gateway:
//!
//! 1. **Upload** - locally published keys are batched, tagged, signed and
//!    posted to the gateway, with per-key retry bookkeeping
//! 2. **Download** - keys other countries published are fetched page by
//!    page and republished to the local key server, one group per country
//!
//! ## Architecture
//!
//! The crate is organized into modules:
//! - `pipeline` - Upload, download and publish orchestration
//! - `encoding` - Canonical key bytes, batch tags and wire formats
//! - `security` - Batch signing and key-set HMACs
//! - `batching` - Contiguous and overlap-bounded chunking
//! - `coordination` - Lease-based distributed lock
//! - `clients` - Gateway, verification server and key server clients
//! - `validation` - Downloaded key validation
//! - `routing` - Country to Health Authority ID routing
//! - `storage` - Key models and the export table
//! - `logging` - Structured logging with run context

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;

pub mod batching;
pub mod clients;
pub mod config;
pub mod coordination;
pub mod encoding;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod routing;
pub mod security;
pub mod storage;
pub mod validation;

pub use config::EngineConfig;
pub use error::SyncError;

use clients::{
    Gateway, HttpGateway, HttpKeyServer, HttpSettings, HttpVerificationServer, KeyServer,
    VerificationServer,
};
use coordination::lock::{DistributedLock, LockStore};
use coordination::sqlite::SqliteLockStore;
use error::ConfigError;
use pipeline::{
    DownloadPipeline, DownloadReport, PublishPipeline, RunContext, UploadPipeline, UploadReport,
};
use routing::authority::AuthorityMap;
use security::signing::BatchSigner;
use storage::models::{ExposureKey, ReportType};
use storage::sqlite::SqliteKeyStore;
use storage::store::KeyStore;

/// Initialize the process-wide logger. Safe to call more than once.
pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_millis()
        .parse_default_env()
        .try_init();
}

/// Collaborators the engine drives.
pub struct EngineParts {
    pub store: Arc<dyn KeyStore>,
    pub lock_store: Arc<dyn LockStore>,
    pub signer: BatchSigner,
    pub gateway: Box<dyn Gateway>,
    pub verification: Box<dyn VerificationServer>,
    pub keyserver: Box<dyn KeyServer>,
}

/// Composed once at startup and passed by reference to every invocation.
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn KeyStore>,
    lock: DistributedLock,
    signer: BatchSigner,
    gateway: Box<dyn Gateway>,
    verification: Box<dyn VerificationServer>,
    keyserver: Box<dyn KeyServer>,
    authorities: AuthorityMap,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("gateway_url", &self.config.gateway_url)
            .field("signer", &self.signer)
            .field("authorities", &self.authorities.len())
            .finish_non_exhaustive()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })
}

impl SyncEngine {
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        let authorities = AuthorityMap::with_overrides(&config.authorities);
        let lock = DistributedLock::new(parts.lock_store, config.lock_lease());
        Self {
            config,
            store: parts.store,
            lock,
            signer: parts.signer,
            gateway: parts.gateway,
            verification: parts.verification,
            keyserver: parts.keyserver,
            authorities,
        }
    }

    /// Build the HTTP clients and signer a deployment needs from `config`.
    pub fn from_config(
        config: EngineConfig,
        store: Arc<dyn KeyStore>,
        lock_store: Arc<dyn LockStore>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let certificate_path = config
            .signing_certificate_path
            .as_deref()
            .ok_or(ConfigError::Missing("signing_certificate_path"))?;
        let key_path = config
            .signing_key_path
            .as_deref()
            .ok_or(ConfigError::Missing("signing_key_path"))?;
        let signer = BatchSigner::from_pem(&read_pem(certificate_path)?, &read_pem(key_path)?)?;

        let identity = config
            .gateway_identity_path
            .as_deref()
            .map(read_pem)
            .transpose()?;

        let settings = HttpSettings {
            timeout: config.http_timeout(),
            max_throttle_retries: config.max_throttle_retries,
        };

        let gateway = HttpGateway::new(&config.gateway_url, identity.as_deref(), settings)?;
        let verification = HttpVerificationServer::new(
            &config.verification_url,
            &config.verification_admin_api_key,
            &config.verification_device_api_key,
            &config.verification_test_type,
            settings,
        )?;
        let keyserver = HttpKeyServer::new(&config.keyserver_url, settings)?;

        log::info!(
            "ENGINE_CONFIGURED signer={} gateway={} mtls={}",
            signer.subject(),
            config.gateway_url,
            identity.is_some()
        );

        Ok(Self::new(
            config,
            EngineParts {
                store,
                lock_store,
                signer,
                gateway: Box::new(gateway),
                verification: Box::new(verification),
                keyserver: Box::new(keyserver),
            },
        ))
    }

    /// Build the engine over the SQLite key and lock tables at
    /// `database_path`. Instances sharing the file share the download lock.
    pub fn open(config: EngineConfig) -> Result<Self, SyncError> {
        let path = config
            .database_path
            .clone()
            .ok_or(ConfigError::Missing("database_path"))?;
        let store = SqliteKeyStore::open(&path)?;
        let lock_store = SqliteLockStore::open(&path)?;
        Self::from_config(config, Arc::new(store), Arc::new(lock_store))
    }

    /// Load config from a TOML file (plus environment overrides) and build
    /// the engine.
    pub fn from_config_file(
        path: &Path,
        store: Arc<dyn KeyStore>,
        lock_store: Arc<dyn LockStore>,
    ) -> anyhow::Result<Self> {
        let config = EngineConfig::load(path)
            .with_context(|| format!("loading engine config from {}", path.display()))?;
        Self::from_config(config, store, lock_store).context("building sync engine")
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Record keys the local key server just published so the next upload
    /// forwards them. Keys that do not convert are skipped and logged.
    pub fn record_published(
        &self,
        keys: &[ExposureKey],
        symptom_onset: NaiveDate,
        origin: &str,
        visited_countries: &BTreeSet<String>,
        report_type: ReportType,
        run: &RunContext,
    ) -> Result<usize, SyncError> {
        let ctx = run.log_context();
        let mut inserted = 0;

        for key in keys {
            match key.to_diagnosis_key(symptom_onset, origin, visited_countries, report_type) {
                Ok(diagnosis_key) => {
                    self.store.insert(diagnosis_key, run.started_at)?;
                    inserted += 1;
                }
                Err(reason) => {
                    crate::log_warn!(
                        ctx,
                        "KEY_SKIPPED",
                        interval = key.interval_number,
                        reason = reason
                    );
                }
            }
        }

        log::info!(
            "{} KEYS_RECORDED inserted={} skipped={}",
            ctx,
            inserted,
            keys.len() - inserted
        );
        Ok(inserted)
    }

    /// Upload pending keys to the gateway.
    pub fn upload(&self, run: &RunContext) -> Result<UploadReport, SyncError> {
        UploadPipeline {
            store: self.store.as_ref(),
            gateway: self.gateway.as_ref(),
            signer: &self.signer,
            batch_size: self.config.upload_batch_size,
            retention: self.config.retention(),
        }
        .run(run)
    }

    /// Import the gateway's keys for `date` into the local key server.
    pub fn download(&self, date: NaiveDate, run: &RunContext) -> Result<DownloadReport, SyncError> {
        DownloadPipeline {
            gateway: self.gateway.as_ref(),
            lock: &self.lock,
            lock_name: &self.config.download_lock_name,
            authorities: &self.authorities,
            publisher: PublishPipeline {
                verification: self.verification.as_ref(),
                keyserver: self.keyserver.as_ref(),
                test_type: &self.config.verification_test_type,
                batch_size: self.config.keyserver_batch_size,
                max_overlapping: self.config.max_overlapping,
            },
        }
        .run(date, run)
    }

    /// Delete terminal keys and keys past the retention window.
    pub fn purge(&self, run: &RunContext) -> Result<usize, SyncError> {
        let cutoff = run.started_at - self.config.retention();
        let purged = self.store.purge(cutoff)?;
        crate::log_info!(
            run.log_context(),
            "KEYS_PURGED",
            count = purged,
            cutoff = cutoff.to_rfc3339()
        );
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose, Engine as _};
    use chrono::{Duration, Utc};
    use parking_lot::Mutex;

    use super::*;
    use crate::clients::gateway::{DownloadPage, UploadRequest, UploadResponse};
    use crate::coordination::lock::MemoryLockStore;
    use crate::encoding::wire::DiagnosisKeyRecord;
    use crate::error::ClientError;
    use crate::pipeline::publish::tests::{FakeKeyServer, FakeVerification};
    use crate::security::signing::tests::test_signing_material;
    use crate::storage::models::date_interval;
    use crate::storage::store::MemoryKeyStore;

    /// Gateway accepting every upload and serving a single download page.
    #[derive(Default)]
    struct LoopbackGateway {
        uploads: Mutex<Vec<UploadRequest>>,
        page: Vec<DiagnosisKeyRecord>,
    }

    impl Gateway for LoopbackGateway {
        fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, ClientError> {
            self.uploads.lock().push(request.clone());
            Ok(UploadResponse {
                status: 201,
                body: String::new(),
            })
        }

        fn download_page(
            &self,
            _date: NaiveDate,
            _batch_tag: Option<&str>,
        ) -> Result<DownloadPage, ClientError> {
            Ok(DownloadPage {
                keys: self.page.clone(),
                next_batch_tag: None,
            })
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::from_toml(
            r#"
            gateway_url = "https://efgs.example"
            verification_url = "https://verify.example"
            keyserver_url = "https://keys.example"
            "#,
        )
        .unwrap();
        config.authorities.insert("NL".to_string(), "rivm".to_string());
        config
    }

    fn engine(store: Arc<MemoryKeyStore>, gateway: LoopbackGateway) -> SyncEngine {
        let (cert, key) = test_signing_material("efgs-engine-test");
        SyncEngine::new(
            config(),
            EngineParts {
                store,
                lock_store: Arc::new(MemoryLockStore::new()),
                signer: BatchSigner::from_pem(&cert, &key).unwrap(),
                gateway: Box::new(gateway),
                verification: Box::new(FakeVerification::default()),
                keyserver: Box::new(FakeKeyServer::default()),
            },
        )
    }

    fn exposure_key(byte: u8, date: NaiveDate) -> ExposureKey {
        ExposureKey {
            key: general_purpose::STANDARD.encode([byte; 16]),
            interval_number: date_interval(date),
            interval_count: 144,
            transmission_risk: 1,
        }
    }

    #[test]
    fn test_record_then_upload_drains_store() {
        let store = Arc::new(MemoryKeyStore::new());
        let engine = engine(store.clone(), LoopbackGateway::default());
        let run = RunContext::new();
        let today = run.run_date();

        let visited: BTreeSet<String> = ["DE".to_string()].into_iter().collect();
        let keys = vec![
            exposure_key(1, today),
            exposure_key(2, today - Duration::days(1)),
            ExposureKey {
                key: "not-base64!".to_string(),
                ..exposure_key(3, today)
            },
        ];

        let inserted = engine
            .record_published(&keys, today, "ie", &visited, ReportType::ConfirmedTest, &run)
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.len(), 2);

        let report = engine.upload(&run).unwrap();
        assert_eq!(report.accepted(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_download_uses_authority_overrides() {
        let record = DiagnosisKeyRecord {
            key_data: general_purpose::STANDARD.encode([7u8; 16]),
            rolling_start_interval_number: 2_680_128,
            rolling_period: 144,
            transmission_risk_level: 1,
            visited_countries: vec![],
            origin: "NL".to_string(),
            report_type: ReportType::ConfirmedTest,
            days_since_onset_of_symptoms: 0,
        };
        let gateway = LoopbackGateway {
            page: vec![record],
            ..Default::default()
        };
        let engine = engine(Arc::new(MemoryKeyStore::new()), gateway);

        let report = engine
            .download(NaiveDate::from_ymd_opt(2020, 12, 10).unwrap(), &RunContext::new())
            .unwrap();
        assert_eq!(report.published["NL"].sent(), 1);
    }

    #[test]
    fn test_purge_uses_retention_window() {
        let store = Arc::new(MemoryKeyStore::new());
        let engine = engine(store.clone(), LoopbackGateway::default());
        let run = RunContext::new();
        let key = exposure_key(1, run.run_date())
            .to_diagnosis_key(run.run_date(), "IE", &BTreeSet::new(), ReportType::ConfirmedTest)
            .unwrap();

        store.insert(key.clone(), Utc::now()).unwrap();
        store.insert(key, Utc::now() - Duration::days(15)).unwrap();

        assert_eq!(engine.purge(&run).unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_from_config_requires_signing_material() {
        let err = SyncEngine::from_config(
            config(),
            Arc::new(MemoryKeyStore::new()),
            Arc::new(MemoryLockStore::new()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Config(ConfigError::Missing("signing_certificate_path"))
        ));
    }

    /// Write signing material into `dir` and point `config` at it.
    fn with_signing_files(mut config: EngineConfig, dir: &Path) -> EngineConfig {
        let (cert, key) = test_signing_material("efgs-config-test");
        let cert_path = dir.join("signing.crt");
        let key_path = dir.join("signing.key");
        std::fs::write(&cert_path, cert).unwrap();
        std::fs::write(&key_path, key).unwrap();
        config.signing_certificate_path = Some(cert_path);
        config.signing_key_path = Some(key_path);
        config
    }

    #[test]
    fn test_from_config_file_builds_engine() {
        let dir = tempfile::tempdir().unwrap();
        let config = with_signing_files(config(), dir.path());

        let config_path = dir.path().join("engine.toml");
        std::fs::write(
            &config_path,
            format!(
                "gateway_url = \"https://efgs.example\"\n\
                 verification_url = \"https://verify.example\"\n\
                 keyserver_url = \"https://keys.example\"\n\
                 signing_certificate_path = {:?}\n\
                 signing_key_path = {:?}\n",
                config.signing_certificate_path.unwrap().display().to_string(),
                config.signing_key_path.unwrap().display().to_string()
            ),
        )
        .unwrap();

        let engine = SyncEngine::from_config_file(
            &config_path,
            Arc::new(MemoryKeyStore::new()),
            Arc::new(MemoryLockStore::new()),
        )
        .unwrap();
        assert_eq!(engine.config().upload_batch_size, 5000);
    }

    #[test]
    fn test_open_requires_database_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = SyncEngine::open(with_signing_files(config(), dir.path())).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Config(ConfigError::Missing("database_path"))
        ));
    }

    #[test]
    fn test_recorded_keys_survive_engine_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = with_signing_files(config(), dir.path());
        config.database_path = Some(dir.path().join("efgs-sync.db"));

        let run = RunContext::new();
        let today = run.run_date();
        let keys = vec![exposure_key(1, today), exposure_key(2, today)];

        let engine = SyncEngine::open(config.clone()).unwrap();
        let inserted = engine
            .record_published(&keys, today, "IE", &BTreeSet::new(), ReportType::ConfirmedTest, &run)
            .unwrap();
        assert_eq!(inserted, 2);
        drop(engine);

        let store = SqliteKeyStore::open(config.database_path.as_deref().unwrap()).unwrap();
        let pending = store
            .pending_since(run.started_at - Duration::days(1))
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].key.origin, "IE");
    }
}
