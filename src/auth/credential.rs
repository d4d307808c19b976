//! Short-lived, usable provider credential.

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;

/// Tokens are treated as expired this long before their reported expiry.
pub const EXPIRY_SKEW_SECS: i64 = 60;

/// A bearer token plus enough metadata to renew it.
///
/// Tokens are `SecretString`, so `Debug` output is redacted.
#[derive(Debug, Clone)]
pub struct Credential {
    pub user_id: i64,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// `None` when the provider never reported an expiry.
    pub expires_at: Option<DateTime<Utc>>,
    pub token_uri: String,
    pub client_id: String,
}

/// Whether an access token may still be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Expired,
    /// No expiry is known, so validity cannot be confirmed locally.
    Unknown,
}

impl Credential {
    pub fn validity_at(&self, now: DateTime<Utc>) -> Validity {
        match self.expires_at {
            None => Validity::Unknown,
            Some(exp) if now + Duration::seconds(EXPIRY_SKEW_SECS) >= exp => Validity::Expired,
            Some(_) => Validity::Valid,
        }
    }

    pub fn validity(&self) -> Validity {
        self.validity_at(Utc::now())
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_at: Option<DateTime<Utc>>) -> Credential {
        Credential {
            user_id: 1,
            access_token: SecretString::from("ya29.a"),
            refresh_token: None,
            expires_at,
            token_uri: "https://oauth2.googleapis.com/token".into(),
            client_id: "client".into(),
        }
    }

    #[test]
    fn validity_applies_skew() {
        let now = Utc::now();
        assert_eq!(
            credential(Some(now + Duration::minutes(10))).validity_at(now),
            Validity::Valid
        );
        assert_eq!(
            credential(Some(now + Duration::seconds(30))).validity_at(now),
            Validity::Expired
        );
        assert_eq!(
            credential(Some(now - Duration::hours(1))).validity_at(now),
            Validity::Expired
        );
        assert_eq!(credential(None).validity_at(now), Validity::Unknown);
    }

    #[test]
    fn debug_redacts_tokens() {
        let c = credential(None);
        assert!(!format!("{c:?}").contains("ya29"));
    }
}
