//! Inbox sync: mailbox mirroring, deletion reconciliation and AI enrichment.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod enrich;
pub mod error;
pub mod llm;
pub mod locks;
pub mod provider;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod tasks;
