//! Incremental sync: pull new remote messages into the store.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::auth::CredentialManager;
use crate::crypto::Cipher;
use crate::error::{DecodeError, ProviderError, SyncError};
use crate::provider::{ListQuery, MailProvider, RemoteMessage};
use crate::store::{Database, NewMessage, User};
use crate::sync::headers::{find_header, parse_date};
use crate::sync::mailbox_error;
use crate::sync::mime::extract_body;

/// Counters for one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// New messages committed to the store.
    pub fetched: usize,
    /// Listed ids already present locally.
    pub skipped_existing: usize,
    /// Listed messages that could not be read (no payload, bad encoding, gone).
    pub skipped_invalid: usize,
}

pub struct SyncEngine {
    db: Arc<dyn Database>,
    cipher: Arc<Cipher>,
    provider: Arc<dyn MailProvider>,
    credentials: Arc<CredentialManager>,
    page_size: u32,
}

impl SyncEngine {
    pub fn new(
        db: Arc<dyn Database>,
        cipher: Arc<Cipher>,
        provider: Arc<dyn MailProvider>,
        credentials: Arc<CredentialManager>,
        page_size: u32,
    ) -> Self {
        Self {
            db,
            cipher,
            provider,
            credentials,
            page_size,
        }
    }

    /// Fetch one page of messages newer than the user's signup watermark.
    ///
    /// Already-stored ids are skipped before any fetch, so re-running is
    /// idempotent. New rows are committed together at the end of the page.
    pub async fn sync_new_messages(&self, user: &User) -> Result<SyncResult, SyncError> {
        let credential = self.credentials.obtain_usable_credential(user).await?;

        let query = ListQuery {
            query: Some(format!("after:{}", user.created_at.timestamp())),
            page_size: self.page_size,
            page_token: None,
        };
        let page = self
            .provider
            .list_messages(&credential, &query)
            .await
            .map_err(|e| mailbox_error(user.id, e))?;

        let mut result = SyncResult::default();
        let mut batch = Vec::new();

        for entry in page.messages {
            if self.db.message_exists(user.id, &entry.id).await? {
                result.skipped_existing += 1;
                continue;
            }

            let remote = match self.provider.get_message(&credential, &entry.id).await {
                Ok(m) => m,
                Err(ProviderError::NotFound { .. }) => {
                    warn!(user_id = user.id, message_id = %entry.id, "Listed message vanished before fetch");
                    result.skipped_invalid += 1;
                    continue;
                }
                Err(e) => return Err(mailbox_error(user.id, e)),
            };

            match self.build_row(user.id, remote) {
                Ok(row) => batch.push(row),
                Err(SyncRowError::Decode(e)) => {
                    warn!(user_id = user.id, message_id = %entry.id, error = %e, "Skipping unreadable message");
                    result.skipped_invalid += 1;
                }
                Err(SyncRowError::Sync(e)) => return Err(e),
            }
        }

        if !batch.is_empty() {
            result.fetched = self.db.insert_messages(&batch).await?;
        }

        info!(
            user_id = user.id,
            fetched = result.fetched,
            skipped_existing = result.skipped_existing,
            skipped_invalid = result.skipped_invalid,
            "Sync complete"
        );
        Ok(result)
    }

    fn build_row(&self, user_id: i64, remote: RemoteMessage) -> Result<NewMessage, SyncRowError> {
        let payload = remote.payload.as_ref().ok_or_else(|| DecodeError::MissingPayload {
            message_id: remote.id.clone(),
        })?;
        let body = extract_body(payload)?;

        let received_at = match find_header(&remote.headers, "Date") {
            Some(raw) => {
                let parsed = parse_date(raw);
                if parsed.is_none() {
                    warn!(user_id, message_id = %remote.id, date = raw, "Unparseable Date header");
                }
                parsed
            }
            None => None,
        };
        debug!(user_id, message_id = %remote.id, body_len = body.len(), "Message extracted");

        Ok(NewMessage {
            user_id,
            sender: find_header(&remote.headers, "From").map(str::to_string),
            subject: find_header(&remote.headers, "Subject").map(str::to_string),
            received_at,
            body_encrypted: self
                .cipher
                .encrypt_str(&body)
                .map_err(|e| SyncRowError::Sync(e.into()))?,
            provider_message_id: remote.id,
            thread_id: remote.thread_id,
        })
    }
}

/// Per-message outcome: decode failures skip the message, the rest abort.
enum SyncRowError {
    Decode(DecodeError),
    Sync(SyncError),
}

impl From<DecodeError> for SyncRowError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthorizationGrant, RefreshedToken, TokenEndpoint};
    use crate::auth::Credential;
    use crate::crypto::KEY_SIZE;
    use crate::error::{AuthError, RefreshError};
    use crate::locks::UserLocks;
    use crate::provider::{MessagePage, MessageRef};
    use crate::store::{LibSqlBackend, MessageFilter};
    use crate::sync::mime::MimePart;
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use chrono::{Duration, Utc};
    use secrecy::SecretString;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoRefresh;

    #[async_trait]
    impl TokenEndpoint for NoRefresh {
        fn token_uri(&self) -> &str {
            "https://oauth.test/token"
        }
        fn client_id(&self) -> &str {
            "client"
        }
        async fn refresh(&self, _: &SecretString) -> Result<RefreshedToken, RefreshError> {
            panic!("refresh not expected");
        }
    }

    #[derive(Default)]
    struct FakeMailbox {
        listed: Vec<String>,
        messages: HashMap<String, RemoteMessage>,
        queries: Mutex<Vec<ListQuery>>,
        fetches: AtomicUsize,
        /// Answer every call with a 401.
        reject_token: bool,
    }

    #[async_trait]
    impl MailProvider for FakeMailbox {
        async fn list_messages(
            &self,
            _: &Credential,
            query: &ListQuery,
        ) -> Result<MessagePage, ProviderError> {
            self.queries.lock().unwrap().push(query.clone());
            if self.reject_token {
                return Err(ProviderError::Unauthorized {
                    service: "fake".into(),
                });
            }
            Ok(MessagePage {
                messages: self
                    .listed
                    .iter()
                    .map(|id| MessageRef {
                        id: id.clone(),
                        thread_id: None,
                    })
                    .collect(),
                next_page_token: None,
            })
        }

        async fn get_message(&self, _: &Credential, id: &str) -> Result<RemoteMessage, ProviderError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.messages.get(id).cloned().ok_or(ProviderError::NotFound {
                service: "fake".into(),
                id: id.into(),
            })
        }
    }

    fn b64(s: &str) -> String {
        URL_SAFE_NO_PAD.encode(s)
    }

    fn remote(id: &str, payload: Option<MimePart>, date: &str) -> RemoteMessage {
        RemoteMessage {
            id: id.into(),
            thread_id: Some(format!("t-{id}")),
            headers: vec![
                ("Subject".into(), format!("Subject {id}")),
                ("From".into(), "Alice <alice@example.com>".into()),
                ("Date".into(), date.into()),
            ],
            payload,
        }
    }

    async fn setup(mailbox: FakeMailbox) -> (Arc<LibSqlBackend>, Arc<Cipher>, Arc<FakeMailbox>, SyncEngine, User) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let cipher = Arc::new(Cipher::new(&[9u8; KEY_SIZE]));
        let credentials = Arc::new(CredentialManager::new(
            db.clone(),
            cipher.clone(),
            Arc::new(NoRefresh),
            Arc::new(UserLocks::new()),
        ));
        let user = credentials
            .register_grant(&AuthorizationGrant {
                email: "bob@example.com".into(),
                full_name: None,
                provider_subject_id: SecretString::from("sub"),
                access_token: SecretString::from("access"),
                refresh_token: None,
                expires_at: Some(Utc::now() + Duration::hours(1)),
            })
            .await
            .unwrap();
        let mailbox = Arc::new(mailbox);
        let engine = SyncEngine::new(db.clone(), cipher.clone(), mailbox.clone(), credentials, 50);
        (db, cipher, mailbox, engine, user)
    }

    #[tokio::test]
    async fn rejected_access_token_requires_reauth() {
        let mailbox = FakeMailbox {
            listed: vec!["m1".into()],
            reject_token: true,
            ..Default::default()
        };
        let (db, _, _, engine, user) = setup(mailbox).await;

        let err = engine.sync_new_messages(&user).await.unwrap_err();
        assert!(
            matches!(&err, SyncError::Auth(auth) if auth.requires_reauth()),
            "{err:?}"
        );
        assert!(!err.is_transient());
        assert!(db.list_messages(user.id, &MessageFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let mut mailbox = FakeMailbox {
            listed: vec!["m1".into(), "m2".into()],
            ..Default::default()
        };
        for id in ["m1", "m2"] {
            mailbox.messages.insert(
                id.into(),
                remote(id, Some(MimePart::plain(b64("Hello"))), "Tue, 1 Jul 2025 10:00:00 +0000"),
            );
        }
        let (db, cipher, mailbox, engine, user) = setup(mailbox).await;

        let first = engine.sync_new_messages(&user).await.unwrap();
        assert_eq!(first.fetched, 2);
        assert_eq!(mailbox.fetches.load(Ordering::SeqCst), 2);

        let second = engine.sync_new_messages(&user).await.unwrap();
        assert_eq!(second.fetched, 0);
        assert_eq!(second.skipped_existing, 2);
        assert_eq!(mailbox.fetches.load(Ordering::SeqCst), 2);

        let stored = db.list_messages(user.id, &MessageFilter::default()).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(cipher.decrypt_str(&stored[0].body_encrypted).unwrap(), "Hello");
        assert_eq!(stored[0].sender.as_deref(), Some("Alice <alice@example.com>"));
        assert!(stored[0].received_at.is_some());
    }

    #[tokio::test]
    async fn query_uses_signup_watermark() {
        let (_, _, mailbox, engine, user) = setup(FakeMailbox::default()).await;
        engine.sync_new_messages(&user).await.unwrap();

        let queries = mailbox.queries.lock().unwrap();
        assert_eq!(
            queries[0].query.as_deref(),
            Some(format!("after:{}", user.created_at.timestamp()).as_str())
        );
        assert_eq!(queries[0].page_size, 50);
    }

    #[tokio::test]
    async fn unreadable_messages_are_skipped_not_fatal() {
        let mut mailbox = FakeMailbox {
            listed: vec!["ok".into(), "nopayload".into(), "badb64".into(), "gone".into()],
            ..Default::default()
        };
        mailbox.messages.insert(
            "ok".into(),
            remote("ok", Some(MimePart::html(b64("<p>Hi</p>"))), "garbage date"),
        );
        mailbox
            .messages
            .insert("nopayload".into(), remote("nopayload", None, ""));
        mailbox.messages.insert(
            "badb64".into(),
            remote("badb64", Some(MimePart::plain("!!!not base64!!!")), ""),
        );
        let (db, cipher, _, engine, user) = setup(mailbox).await;

        let result = engine.sync_new_messages(&user).await.unwrap();
        assert_eq!(result.fetched, 1);
        assert_eq!(result.skipped_invalid, 3);

        let stored = db.list_messages(user.id, &MessageFilter::default()).await.unwrap();
        assert_eq!(stored[0].provider_message_id, "ok");
        assert!(stored[0].received_at.is_none());
        assert_eq!(cipher.decrypt_str(&stored[0].body_encrypted).unwrap(), "Hi");
    }

    #[tokio::test]
    async fn expired_credentials_abort_before_listing() {
        let (db, _, mailbox, engine, user) = setup(FakeMailbox::default()).await;
        db.update_user_tokens(
            user.id,
            &crate::store::TokenUpdate {
                encrypted_access_token: user.encrypted_access_token.clone().unwrap(),
                encrypted_refresh_token: None,
                token_expires_at: Some(Utc::now() - Duration::hours(1)),
            },
        )
        .await
        .unwrap();
        let user = db.get_user(user.id).await.unwrap().unwrap();

        let err = engine.sync_new_messages(&user).await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(AuthError::Expired { .. })));
        assert!(mailbox.queries.lock().unwrap().is_empty());
    }
}
