//! Persistence layer: users, messages and the durable task queue on libSQL.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Database, Enrichment, EnrichmentWrite, MessageFilter, NewMessage, NewUser, StoredMessage,
    TokenUpdate, User,
};
