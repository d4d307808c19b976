//! Unified `Database` trait: one async interface for all persistence.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;

/// A user and their encrypted provider secrets.
///
/// The three secret columns only ever hold ciphertext from [`crate::crypto::Cipher`].
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub full_name: Option<String>,
    /// Signup watermark: remote mail older than this is never synced.
    pub created_at: DateTime<Utc>,
    pub encrypted_provider_subject_id: Option<Vec<u8>>,
    pub encrypted_access_token: Option<Vec<u8>>,
    pub encrypted_refresh_token: Option<Vec<u8>>,
    /// Access token expiry as reported by the provider, when known.
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Input for creating or refreshing a user after an OAuth grant.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub full_name: Option<String>,
    pub encrypted_provider_subject_id: Vec<u8>,
    pub encrypted_access_token: Vec<u8>,
    /// `None` keeps whatever refresh token is already stored.
    pub encrypted_refresh_token: Option<Vec<u8>>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Token columns written after a successful refresh.
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub encrypted_access_token: Vec<u8>,
    /// Only replaced when the provider issued a new one.
    pub encrypted_refresh_token: Option<Vec<u8>>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// A stored mail item.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub user_id: i64,
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub body_encrypted: Vec<u8>,
    pub category: Option<String>,
    pub urgency: Option<String>,
    pub summary: Option<String>,
    pub is_processed: bool,
    pub is_deleted: bool,
    pub classify_attempts: u32,
    pub classification_failed: bool,
    pub created_at: DateTime<Utc>,
}

/// A message as first seen by the sync engine.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: i64,
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub body_encrypted: Vec<u8>,
}

/// AI-derived metadata for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    pub message_id: i64,
    pub category: String,
    pub urgency: String,
    pub summary: String,
}

/// Row counts written by [`Database::apply_enrichment`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentWrite {
    pub processed: usize,
    pub dead_lettered: usize,
}

/// Filter for [`Database::list_messages`].
#[derive(Debug, Clone)]
pub struct MessageFilter {
    pub include_deleted: bool,
    pub only_processed: bool,
    pub limit: usize,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            include_deleted: false,
            only_processed: false,
            limit: 100,
        }
    }
}

/// Backend-agnostic database trait covering users and messages.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create tables and apply pending migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    /// Insert a user, or refresh the stored secrets of an existing one.
    ///
    /// The signup watermark of an existing user is never moved.
    async fn upsert_user(&self, user: &NewUser) -> Result<User, DatabaseError>;

    async fn get_user(&self, id: i64) -> Result<Option<User>, DatabaseError>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError>;

    /// All user ids, ascending.
    async fn list_user_ids(&self) -> Result<Vec<i64>, DatabaseError>;

    /// Replace the access token (and refresh token, if given) in one statement.
    async fn update_user_tokens(
        &self,
        user_id: i64,
        update: &TokenUpdate,
    ) -> Result<(), DatabaseError>;

    /// Delete a user and, through the cascade, all their messages.
    async fn delete_user(&self, id: i64) -> Result<bool, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn message_exists(
        &self,
        user_id: i64,
        provider_message_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// Insert a page of new messages in one transaction.
    ///
    /// Rows whose `(user_id, provider_message_id)` already exist are ignored.
    /// Returns the number of rows actually inserted.
    async fn insert_messages(&self, messages: &[NewMessage]) -> Result<usize, DatabaseError>;

    /// Provider ids of the user's messages that are not soft-deleted.
    async fn active_provider_ids(&self, user_id: i64) -> Result<HashSet<String>, DatabaseError>;

    /// Soft-delete the given provider ids in one bulk update.
    ///
    /// Returns the number of rows that flipped to deleted.
    async fn mark_deleted(
        &self,
        user_id: i64,
        provider_message_ids: &[String],
    ) -> Result<usize, DatabaseError>;

    /// Oldest unprocessed, non-dead-lettered messages for the user.
    async fn claim_unprocessed(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Persist one batch outcome in one transaction.
    ///
    /// `results` are marked processed. `omitted` ids get their attempt
    /// counter bumped; any reaching `max_attempts` are dead-lettered.
    async fn apply_enrichment(
        &self,
        results: &[Enrichment],
        omitted: &[i64],
        max_attempts: u32,
    ) -> Result<EnrichmentWrite, DatabaseError>;

    /// Messages still eligible for enrichment.
    async fn count_unprocessed(&self, user_id: i64) -> Result<u64, DatabaseError>;

    async fn get_message(&self, id: i64) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Most recent messages first.
    async fn list_messages(
        &self,
        user_id: i64,
        filter: &MessageFilter,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;
}
