//! One enrichment batch: claim, classify, persist.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::crypto::Cipher;
use crate::enrich::classifier::{Classifier, ClassifyInput};
use crate::error::EnrichError;
use crate::store::{Database, Enrichment, StoredMessage};

const NO_CONTENT: &str = "No content.";
const CONTENT_ERROR: &str = "[Content Error]";

/// Counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub claimed: usize,
    pub classified: usize,
    /// Claimed messages the classifier did not return.
    pub omitted: usize,
    /// Omitted messages that just hit the attempt cap.
    pub dead_lettered: usize,
    /// Messages still eligible for enrichment after this batch.
    pub remaining: u64,
}

impl BatchOutcome {
    pub fn has_backlog(&self) -> bool {
        self.remaining > 0
    }
}

pub struct EnrichmentWorker {
    db: Arc<dyn Database>,
    cipher: Arc<Cipher>,
    classifier: Arc<dyn Classifier>,
    batch_size: usize,
    excerpt_chars: usize,
    max_attempts: u32,
}

impl EnrichmentWorker {
    pub fn new(
        db: Arc<dyn Database>,
        cipher: Arc<Cipher>,
        classifier: Arc<dyn Classifier>,
        batch_size: usize,
        excerpt_chars: usize,
        max_attempts: u32,
    ) -> Self {
        Self {
            db,
            cipher,
            classifier,
            batch_size,
            excerpt_chars,
            max_attempts,
        }
    }

    /// Classify the user's oldest unprocessed messages.
    ///
    /// Only ids present in the classifier's answer are marked processed.
    /// A classifier failure writes nothing, so the same messages are claimed
    /// again on the next run.
    pub async fn run_batch(&self, user_id: i64) -> Result<BatchOutcome, EnrichError> {
        let claimed = self.db.claim_unprocessed(user_id, self.batch_size).await?;
        if claimed.is_empty() {
            debug!(user_id, "Nothing to enrich");
            return Ok(BatchOutcome::default());
        }

        let inputs: Vec<ClassifyInput> = claimed.iter().map(|m| self.describe(m)).collect();
        let verdicts = self.classifier.classify(&inputs).await?;

        let mut by_id: HashMap<i64, _> = HashMap::with_capacity(verdicts.len());
        for verdict in verdicts {
            by_id.entry(verdict.id).or_insert(verdict);
        }

        let mut results = Vec::with_capacity(claimed.len());
        let mut omitted = Vec::new();
        for message in &claimed {
            match by_id.remove(&message.id) {
                Some(v) => results.push(Enrichment {
                    message_id: message.id,
                    category: v.category,
                    urgency: v.urgency,
                    summary: v.summary,
                }),
                None => omitted.push(message.id),
            }
        }
        if !by_id.is_empty() {
            debug!(user_id, stray = by_id.len(), "Classifier returned ids outside the batch");
        }
        if !omitted.is_empty() {
            warn!(user_id, omitted = ?omitted, "Classifier omitted messages from its answer");
        }

        let written = self
            .db
            .apply_enrichment(&results, &omitted, self.max_attempts)
            .await?;
        if written.dead_lettered > 0 {
            warn!(
                user_id,
                dead_lettered = written.dead_lettered,
                max_attempts = self.max_attempts,
                "Messages dead-lettered after repeated omission"
            );
        }

        let outcome = BatchOutcome {
            claimed: claimed.len(),
            classified: written.processed,
            omitted: omitted.len(),
            dead_lettered: written.dead_lettered,
            remaining: self.db.count_unprocessed(user_id).await?,
        };
        info!(
            user_id,
            claimed = outcome.claimed,
            classified = outcome.classified,
            omitted = outcome.omitted,
            remaining = outcome.remaining,
            "Enrichment batch complete"
        );
        Ok(outcome)
    }

    fn describe(&self, message: &StoredMessage) -> ClassifyInput {
        ClassifyInput {
            id: message.id,
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            excerpt: self.excerpt(message),
        }
    }

    fn excerpt(&self, message: &StoredMessage) -> String {
        if message.body_encrypted.is_empty() {
            return NO_CONTENT.to_string();
        }
        match self.cipher.decrypt_str(&message.body_encrypted) {
            Ok(body) => {
                let text: String = body.chars().take(self.excerpt_chars).collect();
                text.trim().to_string()
            }
            Err(e) => {
                warn!(message_id = message.id, error = %e, "Message body could not be decrypted");
                CONTENT_ERROR.to_string()
            }
        }
    }
}
