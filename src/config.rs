//! Application configuration
//!
//! Loaded from `config/{env}.yaml`; secrets may be overridden from the
//! environment so they never have to live in the file.

use std::fs;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::ledger::{EngineConfig, SweeperConfig};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// `never`, `hourly` or `daily`
    pub rotation: String,
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub sweeper: SweeperSettings,
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of the callback queue between webhook and worker
    pub callback_queue_size: usize,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_body_limit() -> usize {
    crate::api::DEFAULT_BODY_LIMIT
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineSettings {
    pub pending_sla_secs: u64,
    pub max_initiate_attempts: u32,
    pub initiate_backoff_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pending_sla_secs: 180,
            max_initiate_attempts: 3,
            initiate_backoff_ms: 500,
        }
    }
}

impl EngineSettings {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            pending_sla: Duration::from_secs(self.pending_sla_secs),
            max_initiate_attempts: self.max_initiate_attempts,
            initiate_backoff: Duration::from_millis(self.initiate_backoff_ms),
            ..EngineConfig::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SweeperSettings {
    pub enabled: bool,
    pub scan_interval_secs: u64,
    pub batch_size: usize,
    pub reconcile_with_gateway: bool,
    /// Age after which a CREATED record is failed as never submitted.
    /// Must outlast the slowest possible initiate on any instance.
    #[serde(default = "default_abandon_after_secs")]
    pub abandon_after_secs: u64,
}

fn default_abandon_after_secs() -> u64 {
    600
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 15,
            batch_size: 100,
            reconcile_with_gateway: true,
            abandon_after_secs: default_abandon_after_secs(),
        }
    }
}

impl SweeperSettings {
    pub fn to_sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            scan_interval: Duration::from_secs(self.scan_interval_secs.max(1)),
            batch_size: self.batch_size.max(1),
            reconcile_with_gateway: self.reconcile_with_gateway,
            abandon_after: Duration::from_secs(self.abandon_after_secs),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    /// HS256 secret shared with the identity provider
    #[serde(default)]
    pub jwt_secret: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayProvider {
    Simulated,
    Daraja,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub provider: GatewayProvider,
    /// Shared secret for callback signatures
    #[serde(default)]
    pub callback_secret: String,
    /// Simulated provider only: settle every request after this many ms
    #[serde(default)]
    pub auto_settle_ms: Option<u64>,
    #[serde(default)]
    pub daraja: DarajaConfig,
}

/// Safaricom Daraja credentials and endpoints
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DarajaConfig {
    pub base_url: String,
    /// Public base URL of this service, used to build callback URLs
    pub callback_base_url: String,
    #[serde(default)]
    pub consumer_key: String,
    #[serde(default)]
    pub consumer_secret: String,
    pub business_short_code: String,
    #[serde(default)]
    pub passkey: String,
    pub initiator_name: String,
    #[serde(default)]
    pub security_credential: String,
    pub request_timeout_secs: u64,
}

impl Default for DarajaConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sandbox.safaricom.co.ke".to_string(),
            callback_base_url: "http://localhost:8080".to_string(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            business_short_code: "174379".to_string(),
            passkey: String::new(),
            initiator_name: "testapi".to_string(),
            security_credential: String::new(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL URL; the in-memory store is used when absent
    #[serde(default)]
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml` and apply environment overrides.
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Override secrets and URLs from `lookup` (the process environment in production).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *target = value;
            }
        };
        set(&mut self.auth.jwt_secret, "JWT_SECRET");
        set(&mut self.gateway.callback_secret, "CALLBACK_SECRET");
        set(&mut self.gateway.daraja.consumer_key, "MPESA_CONSUMER_KEY");
        set(&mut self.gateway.daraja.consumer_secret, "MPESA_CONSUMER_SECRET");
        set(&mut self.gateway.daraja.passkey, "MPESA_PASSKEY");
        set(
            &mut self.gateway.daraja.security_credential,
            "MPESA_SECURITY_CREDENTIAL",
        );
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database.url = Some(url);
        }
    }

    /// Longest a single create can spend inside the gateway retry loop.
    ///
    /// Each attempt may need an OAuth token fetch and the call itself, both
    /// bounded by the HTTP timeout, and attempt `n` is followed by `n` backoffs.
    pub fn worst_case_initiate(&self) -> Duration {
        let attempts = self.engine.max_initiate_attempts.max(1);
        let per_attempt = Duration::from_secs(self.gateway.daraja.request_timeout_secs) * 2;
        let backoff_steps = attempts * (attempts - 1) / 2;
        per_attempt * attempts + Duration::from_millis(self.engine.initiate_backoff_ms) * backoff_steps
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.len() < 16 {
            bail!("auth.jwt_secret must be at least 16 bytes (set JWT_SECRET)");
        }
        if self.gateway.callback_secret.len() < 16 {
            bail!("gateway.callback_secret must be at least 16 bytes (set CALLBACK_SECRET)");
        }
        if self.engine.max_initiate_attempts == 0 {
            bail!("engine.max_initiate_attempts must be at least 1");
        }
        let worst_case = self.worst_case_initiate();
        if Duration::from_secs(self.sweeper.abandon_after_secs) <= worst_case {
            bail!(
                "sweeper.abandon_after_secs ({}) must exceed the slowest initiate ({}s), \
                 or another instance may fail a record the gateway is still accepting",
                self.sweeper.abandon_after_secs,
                worst_case.as_secs_f64().ceil()
            );
        }
        if self.gateway.provider == GatewayProvider::Daraja {
            let d = &self.gateway.daraja;
            if d.consumer_key.is_empty() || d.consumer_secret.is_empty() || d.passkey.is_empty() {
                bail!(
                    "daraja provider needs MPESA_CONSUMER_KEY, MPESA_CONSUMER_SECRET and MPESA_PASSKEY"
                );
            }
        }
        Ok(())
    }
}
