//! Configuration types.
//!
//! Everything is read from the environment once at startup. [`Config::from_vars`]
//! takes a lookup function so the parsing can be tested without touching the
//! process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::auth::GOOGLE_TOKEN_URI;
use crate::crypto::Cipher;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::provider::gmail::GMAIL_API_BASE;

const DEFAULT_DB_PATH: &str = "./data/inbox-sync.db";

/// Every 15 minutes, on the minute.
const DEFAULT_SYNC_SCHEDULE: &str = "0 */15 * * * *";

/// Daily at 03:00 UTC.
const DEFAULT_RECONCILE_SCHEDULE: &str = "0 0 3 * * *";

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    /// Base64-encoded 32-byte AES key. Validated on load.
    pub encryption_key: SecretString,
    pub google: GoogleConfig,
    pub llm: LlmConfig,
    pub sync: SyncConfig,
    pub enrich: EnrichConfig,
    pub queue: QueueConfig,
    pub schedule: ScheduleConfig,
    /// When set, logs are also written to a daily file in this directory.
    pub log_dir: Option<PathBuf>,
}

/// OAuth client and Gmail API settings.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_uri: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Listing page size for incremental sync (a single page is fetched).
    pub page_size: u32,
    pub reconcile_page_size: u32,
    /// Reconciliation refuses to act on a listing longer than this.
    pub reconcile_max_pages: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            reconcile_page_size: 500,
            reconcile_max_pages: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub batch_size: usize,
    /// Body excerpt length sent to the classifier, in characters.
    pub excerpt_chars: usize,
    /// Omissions tolerated before a message is dead-lettered.
    pub max_attempts: u32,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            excerpt_chars: 2500,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// How long a claimed task stays invisible to other workers.
    pub lease: Duration,
    /// Idle wait between polls when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 5,
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(1800),
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Cron expressions (seconds field first) for periodic work.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub sync: String,
    pub reconcile: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sync: DEFAULT_SYNC_SCHEDULE.to_string(),
            reconcile: DEFAULT_RECONCILE_SCHEDULE.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let encryption_key = SecretString::from(required(&lookup, "INBOX_SYNC_ENCRYPTION_KEY")?);
        Cipher::from_base64(encryption_key.expose_secret()).map_err(|e| {
            ConfigError::InvalidValue {
                key: "INBOX_SYNC_ENCRYPTION_KEY".into(),
                message: e.to_string(),
            }
        })?;

        let google = GoogleConfig {
            client_id: required(&lookup, "GOOGLE_CLIENT_ID")?,
            client_secret: SecretString::from(required(&lookup, "GOOGLE_CLIENT_SECRET")?),
            token_uri: lookup("GOOGLE_TOKEN_URI").unwrap_or_else(|| GOOGLE_TOKEN_URI.to_string()),
            api_base: lookup("GMAIL_API_BASE").unwrap_or_else(|| GMAIL_API_BASE.to_string()),
        };

        let backend = match lookup("LLM_BACKEND") {
            Some(raw) => raw
                .parse::<LlmBackend>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "LLM_BACKEND".into(),
                    message,
                })?,
            None => LlmBackend::Anthropic,
        };
        let llm = LlmConfig {
            backend,
            api_key: SecretString::from(required(&lookup, "LLM_API_KEY")?),
            model: lookup("LLM_MODEL").unwrap_or_else(|| default_model(backend).to_string()),
        };

        let sync_defaults = SyncConfig::default();
        let sync = SyncConfig {
            page_size: parse_or(&lookup, "SYNC_PAGE_SIZE", sync_defaults.page_size)?,
            reconcile_page_size: parse_or(
                &lookup,
                "RECONCILE_PAGE_SIZE",
                sync_defaults.reconcile_page_size,
            )?,
            reconcile_max_pages: parse_or(
                &lookup,
                "RECONCILE_MAX_PAGES",
                sync_defaults.reconcile_max_pages,
            )?,
        };

        let enrich_defaults = EnrichConfig::default();
        let enrich = EnrichConfig {
            batch_size: parse_or(&lookup, "ENRICH_BATCH_SIZE", enrich_defaults.batch_size)?,
            excerpt_chars: parse_or(&lookup, "ENRICH_EXCERPT_CHARS", enrich_defaults.excerpt_chars)?,
            max_attempts: parse_or(&lookup, "ENRICH_MAX_ATTEMPTS", enrich_defaults.max_attempts)?,
        };

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", queue_defaults.concurrency)?,
            max_attempts: parse_or(&lookup, "TASK_MAX_ATTEMPTS", queue_defaults.max_attempts)?,
            retry_base: secs_or(&lookup, "TASK_RETRY_BASE_SECS", queue_defaults.retry_base)?,
            retry_max: secs_or(&lookup, "TASK_RETRY_MAX_SECS", queue_defaults.retry_max)?,
            lease: secs_or(&lookup, "TASK_LEASE_SECS", queue_defaults.lease)?,
            poll_interval: secs_or(&lookup, "WORKER_POLL_SECS", queue_defaults.poll_interval)?,
        };

        let schedule = ScheduleConfig {
            sync: lookup("SYNC_SCHEDULE").unwrap_or_else(|| DEFAULT_SYNC_SCHEDULE.to_string()),
            reconcile: lookup("RECONCILE_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_RECONCILE_SCHEDULE.to_string()),
        };

        let config = Self {
            database_path: lookup("INBOX_SYNC_DB_PATH")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
                .into(),
            encryption_key,
            google,
            llm,
            sync,
            enrich,
            queue,
            schedule,
            log_dir: lookup("INBOX_SYNC_LOG_DIR").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("SYNC_PAGE_SIZE", self.sync.page_size as u64),
            ("RECONCILE_PAGE_SIZE", self.sync.reconcile_page_size as u64),
            ("RECONCILE_MAX_PAGES", self.sync.reconcile_max_pages as u64),
            ("ENRICH_BATCH_SIZE", self.enrich.batch_size as u64),
            ("ENRICH_MAX_ATTEMPTS", self.enrich.max_attempts as u64),
            ("WORKER_CONCURRENCY", self.queue.concurrency as u64),
            ("TASK_MAX_ATTEMPTS", self.queue.max_attempts as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: "must be greater than zero".into(),
                });
            }
        }
        if self.queue.retry_max < self.queue.retry_base {
            return Err(ConfigError::InvalidValue {
                key: "TASK_RETRY_MAX_SECS".into(),
                message: "must not be smaller than TASK_RETRY_BASE_SECS".into(),
            });
        }
        for (key, expr) in [
            ("SYNC_SCHEDULE", &self.schedule.sync),
            ("RECONCILE_SCHEDULE", &self.schedule.reconcile),
        ] {
            cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
                key: key.into(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

fn default_model(backend: LlmBackend) -> &'static str {
    match backend {
        LlmBackend::Anthropic => "claude-3-5-haiku-latest",
        LlmBackend::OpenAi => "gpt-4o-mini",
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}
