//! OAuth token endpoint: the refresh-token exchange.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ProviderError, RefreshError};
use crate::provider::{parse_retry_after, status_error, transport_error};

/// Google's OAuth 2.0 token endpoint.
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const SERVICE: &str = "oauth";

/// OAuth error codes that mean the grant itself is dead.
const REJECTION_CODES: &[&str] = &["invalid_grant", "unauthorized_client", "invalid_client"];

/// Result of a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: SecretString,
    pub expires_at: Option<DateTime<Utc>>,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<SecretString>,
}

/// Exchanges refresh tokens for fresh access tokens.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    fn token_uri(&self) -> &str;

    /// The application's OAuth client id.
    fn client_id(&self) -> &str;

    async fn refresh(&self, refresh_token: &SecretString) -> Result<RefreshedToken, RefreshError>;
}

/// `refresh_token` grant against Google (or any RFC 6749 endpoint).
pub struct GoogleTokenEndpoint {
    client: Client,
    token_uri: String,
    client_id: String,
    client_secret: SecretString,
}

impl GoogleTokenEndpoint {
    pub fn new(
        client: Client,
        token_uri: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            client,
            token_uri: token_uri.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Turn a token endpoint reply into a refresh outcome.
fn interpret_response(
    status: reqwest::StatusCode,
    retry_after: Option<std::time::Duration>,
    body: &str,
    now: DateTime<Utc>,
) -> Result<RefreshedToken, RefreshError> {
    if !status.is_success() {
        if let Ok(err) = serde_json::from_str::<ErrorResponse>(body)
            && REJECTION_CODES.contains(&err.error.as_str())
        {
            return Err(RefreshError::Rejected {
                error: err.error,
                description: err.error_description,
            });
        }
        return Err(status_error(SERVICE, status, retry_after, body).into());
    }

    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::InvalidResponse {
            service: SERVICE.into(),
            reason: format!("token response: {e}"),
        })?;

    Ok(RefreshedToken {
        access_token: SecretString::from(parsed.access_token),
        expires_at: parsed.expires_in.map(|secs| now + Duration::seconds(secs)),
        refresh_token: parsed
            .refresh_token
            .filter(|t| !t.is_empty())
            .map(SecretString::from),
    })
}

#[async_trait]
impl TokenEndpoint for GoogleTokenEndpoint {
    fn token_uri(&self) -> &str {
        &self.token_uri
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<RefreshedToken, RefreshError> {
        debug!(token_uri = %self.token_uri, "Exchanging refresh token");

        let resp = self
            .client
            .post(&self.token_uri)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("refresh_token", refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let outcome = interpret_response(status, retry_after, &body, Utc::now());
        if let Err(RefreshError::Rejected { error, .. }) = &outcome {
            warn!(error = %error, "Token endpoint rejected the refresh grant");
        }
        outcome
    }
}
