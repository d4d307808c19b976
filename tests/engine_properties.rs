//! Property tests for the lifecycle flags, driven through the engines.
//!
//! Random interleavings of remote adds and removals, incremental syncs,
//! enrichment batches (with partial and failed classifier answers) and
//! deletion reconciliation never turn `is_processed` or `is_deleted` back
//! off, and never duplicate a `(user, provider id)` row.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use proptest::prelude::*;
use secrecy::SecretString;

use inbox_sync::auth::{AuthorizationGrant, Credential, CredentialManager, RefreshedToken, TokenEndpoint};
use inbox_sync::crypto::{Cipher, KEY_SIZE};
use inbox_sync::enrich::{Classification, Classifier, ClassifyInput, EnrichmentWorker};
use inbox_sync::error::{ClassificationError, LlmError, ProviderError, RefreshError};
use inbox_sync::locks::UserLocks;
use inbox_sync::provider::{ListQuery, MailProvider, MessagePage, MessageRef, RemoteMessage};
use inbox_sync::store::{Database, LibSqlBackend, MessageFilter, User};
use inbox_sync::sync::{MimePart, Reconciler, SyncEngine};

const SLOTS: u8 = 8;

fn provider_id(slot: u8) -> String {
    format!("msg-{slot}")
}

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Mailbox {
    messages: Mutex<BTreeMap<String, RemoteMessage>>,
}

impl Mailbox {
    fn add(&self, slot: u8) {
        let id = provider_id(slot);
        let message = RemoteMessage {
            id: id.clone(),
            thread_id: None,
            headers: vec![
                ("From".into(), "dana@example.com".into()),
                // The classifier fake keys its omissions on the subject.
                ("Subject".into(), id.clone()),
            ],
            payload: Some(MimePart::plain(URL_SAFE_NO_PAD.encode(format!("body of {id}")))),
        };
        self.messages.lock().unwrap().insert(id, message);
    }

    fn remove(&self, slot: u8) {
        self.messages.lock().unwrap().remove(&provider_id(slot));
    }
}

#[async_trait]
impl MailProvider for Mailbox {
    async fn list_messages(&self, _: &Credential, _: &ListQuery) -> Result<MessagePage, ProviderError> {
        let messages = self
            .messages
            .lock()
            .unwrap()
            .keys()
            .map(|id| MessageRef {
                id: id.clone(),
                thread_id: None,
            })
            .collect();
        Ok(MessagePage {
            messages,
            next_page_token: None,
        })
    }

    async fn get_message(&self, _: &Credential, id: &str) -> Result<RemoteMessage, ProviderError> {
        self.messages
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound {
                service: "fake".into(),
                id: id.into(),
            })
    }
}

struct StaticEndpoint;

#[async_trait]
impl TokenEndpoint for StaticEndpoint {
    fn token_uri(&self) -> &str {
        "https://oauth.test/token"
    }

    fn client_id(&self) -> &str {
        "client"
    }

    async fn refresh(&self, _: &SecretString) -> Result<RefreshedToken, RefreshError> {
        Ok(RefreshedToken {
            access_token: SecretString::from("fresh"),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            refresh_token: None,
        })
    }
}

/// What the classifier does on its next call.
#[derive(Debug, Clone)]
enum Verdict {
    /// Answer for every input except these slots.
    Omit(BTreeSet<u8>),
    /// Fail the whole call with a quota error.
    Throttle,
}

struct ScriptedClassifier {
    next: Mutex<Verdict>,
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        batch: &[ClassifyInput],
    ) -> Result<Vec<Classification>, ClassificationError> {
        let verdict = self.next.lock().unwrap().clone();
        let omit = match verdict {
            Verdict::Throttle => {
                return Err(ClassificationError::Llm(LlmError::RateLimited {
                    provider: "fake".into(),
                    retry_after: None,
                }));
            }
            Verdict::Omit(omit) => omit,
        };
        Ok(batch
            .iter()
            .filter(|input| {
                !omit
                    .iter()
                    .any(|slot| input.subject.as_deref() == Some(provider_id(*slot).as_str()))
            })
            .map(|input| Classification {
                id: input.id,
                category: "Work".into(),
                urgency: "2".into(),
                summary: "ok".into(),
            })
            .collect())
    }
}

// ── Model ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    AddRemote(u8),
    RemoveRemote(u8),
    Sync,
    Enrich(Verdict),
    Reconcile,
}

fn op() -> impl Strategy<Value = Op> {
    let slot = 0u8..SLOTS;
    prop_oneof![
        3 => slot.clone().prop_map(Op::AddRemote),
        2 => slot.clone().prop_map(Op::RemoveRemote),
        3 => Just(Op::Sync),
        2 => prop::collection::btree_set(slot, 0..4).prop_map(|s| Op::Enrich(Verdict::Omit(s))),
        1 => Just(Op::Enrich(Verdict::Throttle)),
        2 => Just(Op::Reconcile),
    ]
}

struct Pipeline {
    db: Arc<LibSqlBackend>,
    mailbox: Arc<Mailbox>,
    classifier: Arc<ScriptedClassifier>,
    credentials: Arc<CredentialManager>,
    sync: SyncEngine,
    enrichment: EnrichmentWorker,
    reconciler: Reconciler,
    user: User,
}

impl Pipeline {
    async fn new() -> Self {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let cipher = Arc::new(Cipher::new(&[5u8; KEY_SIZE]));
        let mailbox = Arc::new(Mailbox::default());
        let classifier = Arc::new(ScriptedClassifier {
            next: Mutex::new(Verdict::Omit(BTreeSet::new())),
        });
        let credentials = Arc::new(CredentialManager::new(
            db.clone(),
            cipher.clone(),
            Arc::new(StaticEndpoint),
            Arc::new(UserLocks::new()),
        ));
        let user = credentials
            .register_grant(&AuthorizationGrant {
                email: "dana@example.com".into(),
                full_name: None,
                provider_subject_id: SecretString::from("sub"),
                access_token: SecretString::from("access"),
                refresh_token: Some(SecretString::from("refresh")),
                expires_at: Some(Utc::now() + Duration::hours(1)),
            })
            .await
            .unwrap();

        let sync = SyncEngine::new(db.clone(), cipher.clone(), mailbox.clone(), credentials.clone(), 50);
        // Small batches so a backlog takes several enrichment ops to drain.
        let enrichment = EnrichmentWorker::new(db.clone(), cipher, classifier.clone(), 3, 2500, 3);
        let reconciler = Reconciler::new(db.clone(), mailbox.clone(), 4, 10);

        Self {
            db,
            mailbox,
            classifier,
            credentials,
            sync,
            enrichment,
            reconciler,
            user,
        }
    }

    async fn apply(&self, op: &Op) {
        match op {
            Op::AddRemote(slot) => self.mailbox.add(*slot),
            Op::RemoveRemote(slot) => self.mailbox.remove(*slot),
            Op::Sync => {
                self.sync.sync_new_messages(&self.user).await.unwrap();
            }
            Op::Enrich(verdict) => {
                *self.classifier.next.lock().unwrap() = verdict.clone();
                let outcome = self.enrichment.run_batch(self.user.id).await;
                match (verdict, outcome) {
                    // An empty backlog never reaches the classifier.
                    (Verdict::Throttle, Ok(outcome)) => assert_eq!(outcome.claimed, 0),
                    (Verdict::Throttle, Err(e)) => assert!(e.is_transient()),
                    (Verdict::Omit(_), outcome) => {
                        outcome.unwrap();
                    }
                }
            }
            Op::Reconcile => {
                let credential = self
                    .credentials
                    .obtain_usable_credential(&self.user)
                    .await
                    .unwrap();
                self.reconciler
                    .reconcile_deletions(&self.user, &credential)
                    .await
                    .unwrap();
            }
        }
    }

    /// `(is_processed, is_deleted)` per provider id.
    async fn snapshot(&self) -> HashMap<String, (bool, bool)> {
        let filter = MessageFilter {
            include_deleted: true,
            limit: 100,
            ..MessageFilter::default()
        };
        let rows = self.db.list_messages(self.user.id, &filter).await.unwrap();
        let count = rows.len();
        let flags: HashMap<_, _> = rows
            .into_iter()
            .inspect(|m| {
                if m.is_processed {
                    assert!(m.category.is_some(), "{} processed without a category", m.provider_message_id);
                }
            })
            .map(|m| (m.provider_message_id, (m.is_processed, m.is_deleted)))
            .collect();
        assert_eq!(flags.len(), count, "duplicate provider id");
        flags
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn engine_runs_never_revert_lifecycle_flags(ops in prop::collection::vec(op(), 1..48)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let pipeline = Pipeline::new().await;

            let mut before = pipeline.snapshot().await;
            for op in &ops {
                pipeline.apply(op).await;
                let after = pipeline.snapshot().await;

                for (id, (was_processed, was_deleted)) in &before {
                    let (processed, deleted) = after[id];
                    prop_assert!(!was_processed || processed, "{id} lost is_processed after {op:?}");
                    prop_assert!(!was_deleted || deleted, "{id} lost is_deleted after {op:?}");
                }
                before = after;
            }

            // A final sync and reconcile leave the store agreeing with the
            // mailbox on every message it has not already tombstoned.
            pipeline.apply(&Op::Sync).await;
            pipeline.apply(&Op::Reconcile).await;
            let remote: BTreeSet<String> =
                pipeline.mailbox.messages.lock().unwrap().keys().cloned().collect();
            let active = pipeline.db.active_provider_ids(pipeline.user.id).await.unwrap();
            for id in &active {
                prop_assert!(remote.contains(id), "{id} active but gone remotely");
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
