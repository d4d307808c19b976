//! Deletion reconciliation.
//!
//! Walks the full remote listing, so cost grows with mailbox size rather
//! than with the local delta. Meant for infrequent scheduled runs.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::auth::Credential;
use crate::error::SyncError;
use crate::provider::{ListQuery, MailProvider};
use crate::store::{Database, User};
use crate::sync::mailbox_error;

pub struct Reconciler {
    db: Arc<dyn Database>,
    provider: Arc<dyn MailProvider>,
    page_size: u32,
    max_pages: usize,
}

impl Reconciler {
    pub fn new(
        db: Arc<dyn Database>,
        provider: Arc<dyn MailProvider>,
        page_size: u32,
        max_pages: usize,
    ) -> Self {
        Self {
            db,
            provider,
            page_size,
            max_pages,
        }
    }

    /// Soft-delete stored messages that no longer exist remotely.
    ///
    /// Returns how many rows flipped to deleted. Deletion is one-way: a
    /// message that reappears remotely stays deleted.
    pub async fn reconcile_deletions(
        &self,
        user: &User,
        credential: &Credential,
    ) -> Result<usize, SyncError> {
        let stored = self.db.active_provider_ids(user.id).await?;
        if stored.is_empty() {
            debug!(user_id = user.id, "Nothing stored, skipping reconciliation");
            return Ok(0);
        }

        let remote = self.list_all_remote_ids(user.id, credential).await?;

        let mut gone: Vec<String> = stored.difference(&remote).cloned().collect();
        if gone.is_empty() {
            debug!(user_id = user.id, stored = stored.len(), "Stored messages all present remotely");
            return Ok(0);
        }
        gone.sort();

        let deleted = self.db.mark_deleted(user.id, &gone).await?;
        info!(
            user_id = user.id,
            stored = stored.len(),
            remote = remote.len(),
            deleted,
            "Reconciliation soft-deleted messages"
        );
        Ok(deleted)
    }

    async fn list_all_remote_ids(
        &self,
        user_id: i64,
        credential: &Credential,
    ) -> Result<HashSet<String>, SyncError> {
        let mut ids = HashSet::new();
        let mut query = ListQuery {
            query: None,
            page_size: self.page_size,
            page_token: None,
        };

        for _ in 0..self.max_pages {
            let page = self
                .provider
                .list_messages(credential, &query)
                .await
                .map_err(|e| mailbox_error(user_id, e))?;
            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(token) => query.page_token = Some(token),
                None => return Ok(ids),
            }
        }

        // Acting on a truncated view would delete everything past the cap.
        Err(SyncError::IncompleteListing {
            pages: self.max_pages,
        })
    }
}
