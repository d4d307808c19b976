//! libSQL backend, the async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared by every component; writes go through `write_lock` so that one
//! caller's transaction never interleaves with another caller's statements.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Database, Enrichment, EnrichmentWrite, MessageFilter, NewMessage, NewUser, StoredMessage,
    TokenUpdate, User,
};

/// SQLite caps bound parameters per statement; bulk statements are chunked below it.
const MAX_BIND_PARAMS: usize = 500;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    /// Owns the database the connection was opened from; never read.
    _db: LibSqlDatabase,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: db,
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Serialize a write (or a read-then-write) against every other writer.
    pub(crate) async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!("unparsable timestamp '{s}'")))
}

pub(crate) fn parse_optional_datetime(
    s: &Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

/// Convert `Option<&str>` to libsql Value.
pub(crate) fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn opt_blob(b: Option<&[u8]>) -> Value {
    match b {
        Some(b) => Value::Blob(b.to_vec()),
        None => Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> Value {
    match dt {
        Some(dt) => Value::Text(dt.to_rfc3339()),
        None => Value::Null,
    }
}

/// `?start, ?start+1, …` for an `IN (…)` list.
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

const USER_COLUMNS: &str = "id, email, full_name, created_at, encrypted_provider_subject_id, \
     encrypted_access_token, encrypted_refresh_token, token_expires_at";

const MESSAGE_COLUMNS: &str = "id, user_id, provider_message_id, thread_id, sender, subject, \
     received_at, body_encrypted, category, urgency, summary, is_processed, is_deleted, \
     classify_attempts, classification_failed, created_at";

/// Map a libsql Row to a User. Column order matches USER_COLUMNS.
fn row_to_user(row: &libsql::Row) -> Result<User, DatabaseError> {
    let created_str: String = row.get(3).map_err(row_err)?;
    let expires_str: Option<String> = row.get(7).ok();

    Ok(User {
        id: row.get(0).map_err(row_err)?,
        email: row.get(1).map_err(row_err)?,
        full_name: row.get(2).ok(),
        created_at: parse_datetime(&created_str)?,
        encrypted_provider_subject_id: row.get(4).ok(),
        encrypted_access_token: row.get(5).ok(),
        encrypted_refresh_token: row.get(6).ok(),
        token_expires_at: parse_optional_datetime(&expires_str)?,
    })
}

/// Map a libsql Row to a StoredMessage. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let received_str: Option<String> = row.get(6).ok();
    let created_str: String = row.get(15).map_err(row_err)?;
    let attempts: i64 = row.get(13).map_err(row_err)?;

    Ok(StoredMessage {
        id: row.get(0).map_err(row_err)?,
        user_id: row.get(1).map_err(row_err)?,
        provider_message_id: row.get(2).map_err(row_err)?,
        thread_id: row.get(3).ok(),
        sender: row.get(4).ok(),
        subject: row.get(5).ok(),
        received_at: parse_optional_datetime(&received_str)?,
        body_encrypted: row.get(7).map_err(row_err)?,
        category: row.get(8).ok(),
        urgency: row.get(9).ok(),
        summary: row.get(10).ok(),
        is_processed: row.get::<i64>(11).map_err(row_err)? != 0,
        is_deleted: row.get::<i64>(12).map_err(row_err)? != 0,
        classify_attempts: u32::try_from(attempts).unwrap_or(0),
        classification_failed: row.get::<i64>(14).map_err(row_err)? != 0,
        created_at: parse_datetime(&created_str)?,
    })
}

async fn collect_messages(mut rows: libsql::Rows) -> Result<Vec<StoredMessage>, DatabaseError> {
    let mut messages = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("row iteration: {e}")))?
    {
        messages.push(row_to_message(&row)?);
    }
    Ok(messages)
}

pub(crate) async fn count(conn: &Connection, sql: &str, args: Vec<Value>) -> Result<u64, DatabaseError> {
    let mut rows = conn
        .query(sql, args)
        .await
        .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => {
            let n: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count parse: {e}")))?;
            Ok(n.max(0) as u64)
        }
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("count: {e}"))),
    }
}

// ── Transactional bodies ────────────────────────────────────────────

async fn insert_message_rows(
    conn: &Connection,
    messages: &[NewMessage],
) -> Result<usize, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    let mut inserted = 0usize;
    for msg in messages {
        let affected = conn
            .execute(
                "INSERT INTO messages (user_id, provider_message_id, thread_id, sender, subject,
                    received_at, body_encrypted, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (user_id, provider_message_id) DO NOTHING",
                params![
                    msg.user_id,
                    msg.provider_message_id.as_str(),
                    opt_text(msg.thread_id.as_deref()),
                    opt_text(msg.sender.as_deref()),
                    opt_text(msg.subject.as_deref()),
                    opt_datetime(msg.received_at),
                    Value::Blob(msg.body_encrypted.clone()),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_messages: {e}")))?;
        inserted += affected as usize;
    }
    Ok(inserted)
}

async fn mark_deleted_rows(
    conn: &Connection,
    user_id: i64,
    ids: &[String],
) -> Result<usize, DatabaseError> {
    let mut flipped = 0usize;
    for chunk in ids.chunks(MAX_BIND_PARAMS) {
        let sql = format!(
            "UPDATE messages SET is_deleted = 1
             WHERE user_id = ?1 AND is_deleted = 0 AND provider_message_id IN ({})",
            placeholders(2, chunk.len())
        );
        let mut args: Vec<Value> = Vec::with_capacity(chunk.len() + 1);
        args.push(Value::Integer(user_id));
        args.extend(chunk.iter().map(|id| Value::Text(id.clone())));

        let affected = conn
            .execute(&sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_deleted: {e}")))?;
        flipped += affected as usize;
    }
    Ok(flipped)
}

async fn apply_enrichment_rows(
    conn: &Connection,
    results: &[Enrichment],
    omitted: &[i64],
    max_attempts: u32,
) -> Result<EnrichmentWrite, DatabaseError> {
    let mut write = EnrichmentWrite::default();

    for r in results {
        let affected = conn
            .execute(
                "UPDATE messages SET category = ?1, urgency = ?2, summary = ?3, is_processed = 1
                 WHERE id = ?4 AND is_processed = 0",
                params![
                    r.category.as_str(),
                    r.urgency.as_str(),
                    r.summary.as_str(),
                    r.message_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_enrichment: {e}")))?;
        write.processed += affected as usize;
    }

    for id in omitted {
        conn.execute(
            "UPDATE messages SET classify_attempts = classify_attempts + 1
             WHERE id = ?1 AND is_processed = 0 AND classification_failed = 0",
            params![*id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("bump classify_attempts: {e}")))?;

        let dead = conn
            .execute(
                "UPDATE messages SET classification_failed = 1
                 WHERE id = ?1 AND is_processed = 0 AND classification_failed = 0
                   AND classify_attempts >= ?2",
                params![*id, i64::from(max_attempts)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dead-letter: {e}")))?;
        write.dead_lettered += dead as usize;
    }

    Ok(write)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_guard().await;
        migrations::init_schema(self.conn()).await
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn upsert_user(&self, user: &NewUser) -> Result<User, DatabaseError> {
        {
            let _guard = self.write_guard().await;
            self.conn()
                .execute(
                    "INSERT INTO users (email, full_name, created_at, encrypted_provider_subject_id,
                        encrypted_access_token, encrypted_refresh_token, token_expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (email) DO UPDATE SET
                        full_name = COALESCE(excluded.full_name, users.full_name),
                        encrypted_provider_subject_id = excluded.encrypted_provider_subject_id,
                        encrypted_access_token = excluded.encrypted_access_token,
                        encrypted_refresh_token = COALESCE(excluded.encrypted_refresh_token,
                                                           users.encrypted_refresh_token),
                        token_expires_at = excluded.token_expires_at",
                    params![
                        user.email.as_str(),
                        opt_text(user.full_name.as_deref()),
                        Utc::now().to_rfc3339(),
                        Value::Blob(user.encrypted_provider_subject_id.clone()),
                        Value::Blob(user.encrypted_access_token.clone()),
                        opt_blob(user.encrypted_refresh_token.as_deref()),
                        opt_datetime(user.token_expires_at),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert_user: {e}")))?;
        }

        self.get_user_by_email(&user.email)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "user".into(),
                id: user.email.clone(),
            })
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_user: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_user(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_user: {e}"))),
        }
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_user_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_user(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_user_by_email: {e}"))),
        }
    }

    async fn list_user_ids(&self) -> Result<Vec<i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT id FROM users ORDER BY id", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_user_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_user_ids: {e}")))?
        {
            ids.push(
                row.get::<i64>(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(ids)
    }

    async fn update_user_tokens(
        &self,
        user_id: i64,
        update: &TokenUpdate,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_guard().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE users SET
                    encrypted_access_token = ?1,
                    encrypted_refresh_token = COALESCE(?2, encrypted_refresh_token),
                    token_expires_at = ?3
                 WHERE id = ?4",
                params![
                    Value::Blob(update.encrypted_access_token.clone()),
                    opt_blob(update.encrypted_refresh_token.as_deref()),
                    opt_datetime(update.token_expires_at),
                    user_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_user_tokens: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "user".into(),
                id: user_id.to_string(),
            });
        }
        debug!(user_id, "Stored refreshed tokens");
        Ok(())
    }

    async fn delete_user(&self, id: i64) -> Result<bool, DatabaseError> {
        let _guard = self.write_guard().await;
        let affected = self
            .conn()
            .execute("DELETE FROM users WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_user: {e}")))?;
        Ok(affected > 0)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn message_exists(
        &self,
        user_id: i64,
        provider_message_id: &str,
    ) -> Result<bool, DatabaseError> {
        let n = count(
            self.conn(),
            "SELECT COUNT(*) FROM messages WHERE user_id = ?1 AND provider_message_id = ?2",
            vec![
                Value::Integer(user_id),
                Value::Text(provider_message_id.to_string()),
            ],
        )
        .await?;
        Ok(n > 0)
    }

    async fn insert_messages(&self, messages: &[NewMessage]) -> Result<usize, DatabaseError> {
        if messages.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_guard().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin insert_messages: {e}")))?;

        let result = insert_message_rows(&tx, messages).await;
        match result {
            Ok(inserted) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit insert_messages: {e}")))?;
                debug!(inserted, offered = messages.len(), "Message page committed");
                Ok(inserted)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn active_provider_ids(&self, user_id: i64) -> Result<HashSet<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT provider_message_id FROM messages WHERE user_id = ?1 AND is_deleted = 0",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("active_provider_ids: {e}")))?;

        let mut ids = HashSet::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("active_provider_ids: {e}")))?
        {
            ids.insert(
                row.get::<String>(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(ids)
    }

    async fn mark_deleted(
        &self,
        user_id: i64,
        provider_message_ids: &[String],
    ) -> Result<usize, DatabaseError> {
        if provider_message_ids.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_guard().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin mark_deleted: {e}")))?;

        let result = mark_deleted_rows(&tx, user_id, provider_message_ids).await;
        match result {
            Ok(flipped) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit mark_deleted: {e}")))?;
                Ok(flipped)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn claim_unprocessed(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE user_id = ?1 AND is_processed = 0 AND classification_failed = 0
                     ORDER BY id ASC LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_unprocessed: {e}")))?;
        collect_messages(rows).await
    }

    async fn apply_enrichment(
        &self,
        results: &[Enrichment],
        omitted: &[i64],
        max_attempts: u32,
    ) -> Result<EnrichmentWrite, DatabaseError> {
        if results.is_empty() && omitted.is_empty() {
            return Ok(EnrichmentWrite::default());
        }

        let _guard = self.write_guard().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin apply_enrichment: {e}")))?;

        let result = apply_enrichment_rows(&tx, results, omitted, max_attempts).await;
        match result {
            Ok(write) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit apply_enrichment: {e}")))?;
                Ok(write)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn count_unprocessed(&self, user_id: i64) -> Result<u64, DatabaseError> {
        count(
            self.conn(),
            "SELECT COUNT(*) FROM messages
             WHERE user_id = ?1 AND is_processed = 0 AND classification_failed = 0",
            vec![Value::Integer(user_id)],
        )
        .await
    }

    async fn get_message(&self, id: i64) -> Result<Option<StoredMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;
        Ok(collect_messages(rows).await?.into_iter().next())
    }

    async fn list_messages(
        &self,
        user_id: i64,
        filter: &MessageFilter,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ?1");
        if !filter.include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }
        if filter.only_processed {
            sql.push_str(" AND is_processed = 1");
        }
        sql.push_str(" ORDER BY COALESCE(received_at, created_at) DESC, id DESC LIMIT ?2");

        let rows = self
            .conn()
            .query(&sql, params![user_id, filter.limit as i64])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;
        collect_messages(rows).await
    }
}
