//! Remote mailbox access.
//!
//! [`MailProvider`] is the read-only view the sync and reconciliation
//! engines need. [`GmailClient`] implements it over the Gmail REST API.

pub mod gmail;

pub use gmail::GmailClient;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::auth::Credential;
use crate::error::ProviderError;
use crate::sync::mime::MimePart;

/// Parameters for one listing call.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Provider search filter, e.g. `after:1700000000`.
    pub query: Option<String>,
    pub page_size: u32,
    pub page_token: Option<String>,
}

/// Identity of one remote message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: Option<String>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

/// A fully fetched remote message.
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub id: String,
    pub thread_id: Option<String>,
    /// Top-level headers in wire order.
    pub headers: Vec<(String, String)>,
    /// `None` when the provider returned no payload.
    pub payload: Option<MimePart>,
}

/// Read-only mail API.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_messages(
        &self,
        credential: &Credential,
        query: &ListQuery,
    ) -> Result<MessagePage, ProviderError>;

    async fn get_message(
        &self,
        credential: &Credential,
        id: &str,
    ) -> Result<RemoteMessage, ProviderError>;
}

// ── Shared HTTP helpers ─────────────────────────────────────────────

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Classify a transport-level reqwest failure.
pub(crate) fn transport_error(service: &str, e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::Unavailable {
            service: service.to_string(),
            reason: e.to_string(),
        }
    } else {
        ProviderError::RequestFailed {
            service: service.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Classify a non-success HTTP status.
///
/// `body` is only used to spot quota errors reported as 403 and to give
/// context in the message. It is truncated before being embedded.
pub(crate) fn status_error(
    service: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderError {
    let service = service.to_string();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            service,
            retry_after,
        },
        StatusCode::FORBIDDEN
            if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") =>
        {
            ProviderError::RateLimited {
                service,
                retry_after,
            }
        }
        StatusCode::UNAUTHORIZED => ProviderError::Unauthorized { service },
        s if s.is_server_error() => ProviderError::Unavailable {
            service,
            reason: format!("status {s}"),
        },
        s => ProviderError::RequestFailed {
            service,
            reason: format!("status {s}: {}", body.chars().take(300).collect::<String>()),
        },
    }
}
