//! Error types for inbox-sync.
//!
//! Per-item failures (`DecodeError`, a bad date) are handled where they
//! occur and never reach these top-level types. Everything else bubbles up
//! to the task layer, which asks `is_transient()` to decide on a retry.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the binary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Encryption service errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid encrypted data format: {0}")]
    InvalidFormat(String),
}

/// Errors from remote HTTP collaborators (mail API, token endpoint).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{service} rate limited, retry after {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("{service} temporarily unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    #[error("{service} rejected the access token")]
    Unauthorized { service: String },

    #[error("{service} has no item {id}")]
    NotFound { service: String, id: String },

    #[error("{service} request failed: {reason}")]
    RequestFailed { service: String, reason: String },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },
}

impl ProviderError {
    /// Rate limiting and outages are worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Failure of a refresh-token exchange.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The grant is revoked, expired, or the client is no longer authorized.
    #[error("refresh grant rejected: {error} ({description})")]
    Rejected { error: String, description: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Credential lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Credentials for user {user_id} expired and no refresh token is stored")]
    Expired { user_id: i64 },

    #[error("Refresh grant for user {user_id} was rejected: {reason}")]
    Revoked { user_id: i64, reason: String },

    #[error("User {user_id} has no stored access token")]
    MissingToken { user_id: i64 },

    #[error("Token endpoint error: {0}")]
    Endpoint(#[from] ProviderError),

    #[error("Stored token could not be decrypted: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl AuthError {
    /// True when the user has to go through the consent flow again.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Self::Expired { .. } | Self::Revoked { .. } | Self::MissingToken { .. }
        )
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Endpoint(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Failure to decode a single message part.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid base64 body data: {0}")]
    Base64(String),

    #[error("Body is not valid UTF-8: {0}")]
    Utf8(String),

    #[error("Message {message_id} has no payload")]
    MissingPayload { message_id: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// AI classification errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("Classification call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Malformed classification response: {0}")]
    Malformed(String),
}

impl ClassificationError {
    /// Quota exhaustion is the only classification failure worth a retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Llm(LlmError::RateLimited { .. }))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Llm(LlmError::RateLimited { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }
}

/// Sync and reconciliation errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("Mail provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Remote listing exceeded {pages} pages; refusing to reconcile a partial view")]
    IncompleteListing { pages: usize },
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Auth(e) => e.is_transient(),
            Self::Provider(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Auth(AuthError::Endpoint(e)) | Self::Provider(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Enrichment batch errors.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl EnrichError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Classification(e) => e.is_transient(),
            Self::Database(_) => false,
        }
    }
}

/// Task queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task {id} payload could not be decoded: {reason}")]
    InvalidPayload { id: Uuid, reason: String },

    #[error("Task serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error from a single task execution.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Enrichment error: {0}")]
    Enrich(#[from] EnrichError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl TaskError {
    /// Whether the queue's retry-with-backoff policy applies.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Auth(e) => e.is_transient(),
            Self::Sync(e) => e.is_transient(),
            Self::Enrich(e) => e.is_transient(),
            Self::Database(_) | Self::Queue(_) => false,
        }
    }

    /// Provider-supplied retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Auth(AuthError::Endpoint(e)) => e.retry_after(),
            Self::Sync(e) => e.retry_after(),
            Self::Enrich(EnrichError::Classification(e)) => e.retry_after(),
            _ => None,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
