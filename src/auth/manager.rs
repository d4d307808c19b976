//! Credential lifecycle manager.
//!
//! The only component that reads or writes stored tokens. Everything that
//! talks to the mail provider gets its [`Credential`] from here.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::auth::credential::{Credential, Validity};
use crate::auth::token_endpoint::TokenEndpoint;
use crate::crypto::Cipher;
use crate::error::{AuthError, DatabaseError, RefreshError};
use crate::locks::{LockScope, UserLocks};
use crate::store::{Database, NewUser, TokenUpdate, User};

/// What the (out-of-scope) consent flow hands over after a successful login.
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub email: String,
    pub full_name: Option<String>,
    pub provider_subject_id: SecretString,
    pub access_token: SecretString,
    /// Providers do not reissue this on every consent.
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Token-exchange result as handed to `inbox-sync register`.
#[derive(Deserialize)]
struct GrantJson {
    provider_subject_id: String,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl AuthorizationGrant {
    /// Parse a token-exchange JSON object; `expires_in` counts from `now`.
    pub fn from_token_json(
        email: &str,
        full_name: Option<String>,
        json: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let parsed: GrantJson = serde_json::from_str(json)?;
        Ok(Self {
            email: email.to_string(),
            full_name,
            provider_subject_id: SecretString::from(parsed.provider_subject_id),
            access_token: SecretString::from(parsed.access_token),
            refresh_token: parsed
                .refresh_token
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            expires_at: parsed.expires_in.map(|secs| now + Duration::seconds(secs)),
        })
    }
}

pub struct CredentialManager {
    db: Arc<dyn Database>,
    cipher: Arc<Cipher>,
    endpoint: Arc<dyn TokenEndpoint>,
    locks: Arc<UserLocks>,
}

impl CredentialManager {
    pub fn new(
        db: Arc<dyn Database>,
        cipher: Arc<Cipher>,
        endpoint: Arc<dyn TokenEndpoint>,
        locks: Arc<UserLocks>,
    ) -> Self {
        Self {
            db,
            cipher,
            endpoint,
            locks,
        }
    }

    /// Store the tokens from a completed consent flow.
    ///
    /// New users get their signup watermark set to now. Returning users keep
    /// their watermark, and their refresh token unless a new one was issued.
    pub async fn register_grant(&self, grant: &AuthorizationGrant) -> Result<User, AuthError> {
        let encrypted_refresh_token = grant
            .refresh_token
            .as_ref()
            .map(|t| self.cipher.encrypt_str(t.expose_secret()))
            .transpose()?;

        let user = self
            .db
            .upsert_user(&NewUser {
                email: grant.email.clone(),
                full_name: grant.full_name.clone(),
                encrypted_provider_subject_id: self
                    .cipher
                    .encrypt_str(grant.provider_subject_id.expose_secret())?,
                encrypted_access_token: self.cipher.encrypt_str(grant.access_token.expose_secret())?,
                encrypted_refresh_token,
                token_expires_at: grant.expires_at,
            })
            .await?;

        info!(
            user_id = user.id,
            has_refresh_token = user.encrypted_refresh_token.is_some(),
            "Authorization grant stored"
        );
        Ok(user)
    }

    /// Return a credential that can be used right now, refreshing if needed.
    ///
    /// Fails with [`AuthError::Expired`] when the token is known to be
    /// expired and there is no refresh token. No network call is made in
    /// that case. A rejected refresh is [`AuthError::Revoked`].
    pub async fn obtain_usable_credential(&self, user: &User) -> Result<Credential, AuthError> {
        let credential = self.decrypt(user)?;
        match credential.validity() {
            Validity::Valid => return Ok(credential),
            // Validity cannot be confirmed and there is nothing to renew with.
            Validity::Unknown if !credential.can_refresh() => return Ok(credential),
            Validity::Expired if !credential.can_refresh() => {
                warn!(user_id = user.id, "Access token expired and no refresh token is stored");
                return Err(AuthError::Expired { user_id: user.id });
            }
            _ => {}
        }

        let _guard = self.locks.acquire(LockScope::Refresh, user.id).await;

        // Another task may have refreshed while we waited for the lock.
        let current = self
            .db
            .get_user(user.id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "user".into(),
                id: user.id.to_string(),
            })?;
        let credential = self.decrypt(&current)?;
        if credential.validity() == Validity::Valid {
            debug!(user_id = user.id, "Reusing token refreshed by a concurrent task");
            return Ok(credential);
        }
        let Some(refresh_token) = credential.refresh_token.clone() else {
            return Err(AuthError::Expired { user_id: user.id });
        };

        let refreshed = match self.endpoint.refresh(&refresh_token).await {
            Ok(t) => t,
            Err(RefreshError::Rejected { error, description }) => {
                warn!(user_id = user.id, error = %error, "Refresh grant revoked");
                return Err(AuthError::Revoked {
                    user_id: user.id,
                    reason: if description.is_empty() {
                        error
                    } else {
                        format!("{error}: {description}")
                    },
                });
            }
            Err(RefreshError::Provider(e)) => return Err(AuthError::Endpoint(e)),
        };

        let update = TokenUpdate {
            encrypted_access_token: self
                .cipher
                .encrypt_str(refreshed.access_token.expose_secret())?,
            encrypted_refresh_token: refreshed
                .refresh_token
                .as_ref()
                .map(|t| self.cipher.encrypt_str(t.expose_secret()))
                .transpose()?,
            token_expires_at: refreshed.expires_at,
        };
        self.db.update_user_tokens(user.id, &update).await?;
        info!(
            user_id = user.id,
            rotated = refreshed.refresh_token.is_some(),
            "Access token refreshed"
        );

        Ok(Credential {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
            expires_at: refreshed.expires_at,
            ..credential
        })
    }

    fn decrypt(&self, user: &User) -> Result<Credential, AuthError> {
        let access_blob = user
            .encrypted_access_token
            .as_deref()
            .ok_or(AuthError::MissingToken { user_id: user.id })?;
        let refresh_token = user
            .encrypted_refresh_token
            .as_deref()
            .map(|blob| self.cipher.decrypt_secret(blob))
            .transpose()?;

        Ok(Credential {
            user_id: user.id,
            access_token: self.cipher.decrypt_secret(access_blob)?,
            refresh_token,
            expires_at: user.token_expires_at,
            token_uri: self.endpoint.token_uri().to_string(),
            client_id: self.endpoint.client_id().to_string(),
        })
    }
}
