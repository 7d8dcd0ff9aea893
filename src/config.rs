use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::certificate::Identity;
use crate::constants::*;

const CONFIG_FILE: &str = "conf.toml";
const KEY_FILE: &str = "key";
const CERTIFICATE_FILE: &str = "certificate";
const AUTHORITY_FILE: &str = "authority.pub";

fn foreign<E: std::error::Error + Send + Sync + 'static>(err: E) -> ConfigError {
    ConfigError::Foreign(Box::new(err))
}

/// Tunables of a management-layer peer.
///
/// Every field has a default, so a `conf.toml` only needs the keys it changes. Any key can
/// be overridden from the environment with the `VOLUNTLIB_` prefix, e.g.
/// `VOLUNTLIB_WORKER_SLEEP_MS=1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    pub config_path: PathBuf,
    /// Directory holding one `.job` file per known job.
    pub storage_path: PathBuf,
    /// Subjects treated as administrators by the bundled certificate service.
    pub admins: Vec<String>,
    pub max_job_payload_size: usize,
    pub max_bitmask_size: u32,
    /// Jobs per outgoing job-list message.
    pub job_list_batch_size: usize,
    pub share_interval_ms: u64,
    pub request_job_list_interval_ms: u64,
    pub payload_request_interval_ms: u64,
    pub serialization_interval_ms: u64,
    pub progress_update_interval_ms: u64,
    pub housekeeping_interval_ms: u64,
    pub deletion_grace_period_secs: u64,
    pub worker_sleep_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        ManagementConfig {
            config_path: PathBuf::from(".voluntlib"),
            storage_path: PathBuf::from(".voluntlib/jobs"),
            admins: Vec::new(),
            max_job_payload_size: DEFAULT_MAX_JOB_PAYLOAD_SIZE,
            max_bitmask_size: DEFAULT_MAX_BITMASK_SIZE,
            job_list_batch_size: DEFAULT_JOB_LIST_BATCH_SIZE,
            share_interval_ms: DEFAULT_SHARE_INTERVAL_MS,
            request_job_list_interval_ms: DEFAULT_REQUEST_JOB_LIST_INTERVAL_MS,
            payload_request_interval_ms: DEFAULT_PAYLOAD_REQUEST_INTERVAL_MS,
            serialization_interval_ms: DEFAULT_SERIALIZATION_INTERVAL_MS,
            progress_update_interval_ms: DEFAULT_PROGRESS_UPDATE_INTERVAL_MS,
            housekeeping_interval_ms: DEFAULT_HOUSEKEEPING_INTERVAL_MS,
            deletion_grace_period_secs: DEFAULT_DELETION_GRACE_PERIOD_SECS,
            worker_sleep_ms: DEFAULT_WORKER_SLEEP_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl ManagementConfig {
    /// Loads the configuration kept in directory `path`.
    ///
    /// The directory and a default `conf.toml` are created when missing. Values from the
    /// file are then overlaid with `VOLUNTLIB_*` environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        if !config_path.exists() {
            fs::create_dir_all(&config_path).map_err(foreign)?;
        }
        let config_path = config_path.canonicalize().map_err(foreign)?;

        let conf_file = config_path.join(CONFIG_FILE);
        if !conf_file.exists() {
            let defaults = ManagementConfig {
                config_path: config_path.clone(),
                storage_path: config_path.join("jobs"),
                ..ManagementConfig::default()
            };
            let toml = toml::to_string_pretty(&defaults).map_err(foreign)?;
            fs::write(&conf_file, toml).map_err(foreign)?;
        }

        debug!("📝 Loaded config at path: {:#?}", config_path);
        let settings = Config::builder()
            .add_source(config::File::from(conf_file))
            .add_source(config::Environment::with_prefix("VOLUNTLIB"))
            .build()?;

        let mut loaded: ManagementConfig = settings.try_deserialize()?;
        loaded.config_path = config_path;
        Ok(loaded.with_bounded_limits())
    }

    /// Caps `max_job_payload_size` and `max_bitmask_size` to what fits the wire format.
    ///
    /// Even at the caps a payload and a bitmask together can exceed one frame, which
    /// `JobManager::create_job` reports.
    pub fn with_bounded_limits(mut self) -> Self {
        if self.max_job_payload_size > MAX_JOB_PAYLOAD_SIZE {
            warn!(
                configured = self.max_job_payload_size,
                max = MAX_JOB_PAYLOAD_SIZE,
                "max_job_payload_size is too large, capping it"
            );
            self.max_job_payload_size = MAX_JOB_PAYLOAD_SIZE;
        }
        let bounded = self.max_bitmask_size.clamp(1, MAX_BITMASK_SIZE);
        if bounded != self.max_bitmask_size {
            warn!(configured = self.max_bitmask_size, bounded, "max_bitmask_size is out of range, bounding it");
            self.max_bitmask_size = bounded;
        }
        self
    }

    pub fn share_interval(&self) -> Duration {
        Duration::from_millis(self.share_interval_ms)
    }

    pub fn request_job_list_interval(&self) -> Duration {
        Duration::from_millis(self.request_job_list_interval_ms)
    }

    pub fn payload_request_interval(&self) -> Duration {
        Duration::from_millis(self.payload_request_interval_ms)
    }

    pub fn serialization_interval(&self) -> Duration {
        Duration::from_millis(self.serialization_interval_ms)
    }

    pub fn progress_update_interval(&self) -> Duration {
        Duration::from_millis(self.progress_update_interval_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    pub fn deletion_grace_period(&self) -> Duration {
        Duration::from_secs(self.deletion_grace_period_secs)
    }

    pub fn worker_sleep(&self) -> Duration {
        Duration::from_millis(self.worker_sleep_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn has_identity(&self) -> bool {
        self.config_path.join(KEY_FILE).exists() && self.config_path.join(CERTIFICATE_FILE).exists()
    }

    /// Stores the identity and the authority's public key hex-encoded next to `conf.toml`.
    pub fn store_identity(&self, identity: &Identity, authority: &VerifyingKey) -> Result<(), ConfigError> {
        fs::write(self.config_path.join(KEY_FILE), hex::encode(identity.secret_bytes())).map_err(foreign)?;
        fs::write(self.config_path.join(CERTIFICATE_FILE), hex::encode(identity.certificate())).map_err(foreign)?;
        fs::write(self.config_path.join(AUTHORITY_FILE), hex::encode(authority.to_bytes())).map_err(foreign)?;
        Ok(())
    }

    fn read_hex(&self, file: &str) -> Result<Vec<u8>, ConfigError> {
        let encoded = fs::read_to_string(self.config_path.join(file)).map_err(foreign)?;
        hex::decode(encoded.trim()).map_err(foreign)
    }

    fn read_key(&self, file: &str) -> Result<[u8; 32], ConfigError> {
        self.read_hex(file)?
            .try_into()
            .map_err(|_| ConfigError::Message(format!("{file} does not hold a 32 byte key")))
    }

    pub fn identity(&self) -> Result<Identity, ConfigError> {
        let secret = self.read_key(KEY_FILE)?;
        let certificate = self.read_hex(CERTIFICATE_FILE)?;
        Identity::from_parts(&secret, certificate).map_err(foreign)
    }

    pub fn authority_key(&self) -> Result<VerifyingKey, ConfigError> {
        let key = self.read_key(AUTHORITY_FILE)?;
        VerifyingKey::from_bytes(&key).map_err(|err| ConfigError::Message(err.to_string()))
    }
}
