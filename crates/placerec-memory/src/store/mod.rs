//! Persistent store contract.
//!
//! [`PersistentStore`] is the durable backing tier for signatures and
//! words. The tiering engine holds it as a trait object chosen at
//! construction, so the SQLite backend and the in-memory test double are
//! interchangeable.
//!
//! Every method takes `&self`; implementations serialize access to their
//! connection internally so concurrent callers queue.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use placerec_perception::VisualWord;
use placerec_types::{PlaceError, SignatureId, WordId};
use thiserror::Error;

use crate::signature::Signature;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use sqlite::{SqliteOptions, SqliteStore};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from persistent store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store is not connected")]
    NotConnected,
    #[error("signature {0} not found")]
    NotFound(u64),
    #[error("corrupt row in `{table}`: {details}")]
    Corrupt { table: &'static str, details: String },
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for PlaceError {
    fn from(err: StoreError) -> Self {
        PlaceError::Storage(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Contract
// ─────────────────────────────────────────────────────────────────────────────

/// `(loop-closure ids, child ids)` of one signature.
pub type LinkSets = (BTreeSet<SignatureId>, BTreeSet<SignatureId>);

/// Durable backing tier for signatures and visual words.
pub trait PersistentStore: Send + Sync {
    /// Open `location`, creating the schema if needed. Replaces any
    /// existing connection.
    fn connect(&self, location: &str) -> Result<(), StoreError>;

    fn disconnect(&self) -> Result<(), StoreError>;

    fn is_connected(&self) -> bool;

    /// Upsert `signatures` and `words` in a single transaction. A signature
    /// already present is fully replaced, including its child rows.
    fn save(&self, signatures: &[Signature], words: &[VisualWord]) -> Result<(), StoreError>;

    /// Load a full signature, or `None` if the id was never saved.
    fn load(&self, id: SignatureId) -> Result<Option<Signature>, StoreError>;

    /// Load the words among `ids` that exist, with their reference sets.
    fn load_words(&self, ids: &[WordId]) -> Result<Vec<VisualWord>, StoreError>;

    fn neighbor_ids(&self, id: SignatureId) -> Result<BTreeSet<SignatureId>, StoreError>;

    fn weight(&self, id: SignatureId) -> Result<Option<u32>, StoreError>;

    /// Loop-closure links and child links of `id`, in that order.
    fn loop_and_child_ids(&self, id: SignatureId) -> Result<LinkSets, StoreError>;

    /// Re-point every persisted citation of an old word to its new word.
    fn change_words_ref(&self, remap: &BTreeMap<WordId, WordId>) -> Result<(), StoreError>;

    fn delete_words(&self, ids: &[WordId]) -> Result<(), StoreError>;

    fn all_signature_ids(&self) -> Result<BTreeSet<SignatureId>, StoreError>;

    /// Largest signature id ever saved (0 if none).
    fn last_signature_id(&self) -> Result<SignatureId, StoreError>;

    /// Largest word id ever saved, including deleted ones (0 if none).
    fn last_word_id(&self) -> Result<WordId, StoreError>;

    /// Up to `count` `(id, weight)` pairs ordered by weight descending, then
    /// id descending.
    fn highest_weighted(&self, count: usize) -> Result<Vec<(SignatureId, u32)>, StoreError>;

    fn memory_footprint_bytes(&self) -> Result<u64, StoreError>;
}

impl<T: PersistentStore + ?Sized> PersistentStore for Arc<T> {
    fn connect(&self, location: &str) -> Result<(), StoreError> {
        (**self).connect(location)
    }
    fn disconnect(&self) -> Result<(), StoreError> {
        (**self).disconnect()
    }
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
    fn save(&self, signatures: &[Signature], words: &[VisualWord]) -> Result<(), StoreError> {
        (**self).save(signatures, words)
    }
    fn load(&self, id: SignatureId) -> Result<Option<Signature>, StoreError> {
        (**self).load(id)
    }
    fn load_words(&self, ids: &[WordId]) -> Result<Vec<VisualWord>, StoreError> {
        (**self).load_words(ids)
    }
    fn neighbor_ids(&self, id: SignatureId) -> Result<BTreeSet<SignatureId>, StoreError> {
        (**self).neighbor_ids(id)
    }
    fn weight(&self, id: SignatureId) -> Result<Option<u32>, StoreError> {
        (**self).weight(id)
    }
    fn loop_and_child_ids(&self, id: SignatureId) -> Result<LinkSets, StoreError> {
        (**self).loop_and_child_ids(id)
    }
    fn change_words_ref(&self, remap: &BTreeMap<WordId, WordId>) -> Result<(), StoreError> {
        (**self).change_words_ref(remap)
    }
    fn delete_words(&self, ids: &[WordId]) -> Result<(), StoreError> {
        (**self).delete_words(ids)
    }
    fn all_signature_ids(&self) -> Result<BTreeSet<SignatureId>, StoreError> {
        (**self).all_signature_ids()
    }
    fn last_signature_id(&self) -> Result<SignatureId, StoreError> {
        (**self).last_signature_id()
    }
    fn last_word_id(&self) -> Result<WordId, StoreError> {
        (**self).last_word_id()
    }
    fn highest_weighted(&self, count: usize) -> Result<Vec<(SignatureId, u32)>, StoreError> {
        (**self).highest_weighted(count)
    }
    fn memory_footprint_bytes(&self) -> Result<u64, StoreError> {
        (**self).memory_footprint_bytes()
    }
}
