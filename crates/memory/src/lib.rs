//! Persona-local memory: conversation log, threads, chronicle, memopedia.
//!
//! Each persona owns one embedded SQLite file. All access goes through
//! [`MemoryStore`], whose connection lock doubles as the per-persona write
//! mutex: recent-window reads take the same lock as writes, so a reader
//! never observes a half-applied wait consolidation or thread switch.

mod chronicle;
mod memopedia;
mod store;
mod types;

pub use chronicle::ChronicleEntry;
pub use memopedia::{MemopediaPage, PageCategory, PageUpsert, Vividness};
pub use store::{DEFAULT_THREAD_ID, MemoryStore, RecentLimit, ThreadKind, ThreadRecord};
pub use types::{MemoryMessage, MessageMetadata, NewMessage};

/// Failure inside the memory layer.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
