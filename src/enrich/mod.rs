//! AI enrichment of stored messages: category, urgency and summary.

pub mod classifier;
pub mod worker;

pub use classifier::{Classification, Classifier, ClassifyInput, LlmClassifier};
pub use worker::{BatchOutcome, EnrichmentWorker};
