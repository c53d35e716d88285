//! `placerec-memory` – The Place Memory.
//!
//! Holds every visited place and decides which ones stay in RAM. The
//! persistent tier is a local SQLite substrate behind a backend trait.
//!
//! # Modules
//!
//! - [`signature`] – [`Signature`][signature::Signature]: the record of one
//!   visited place (words, neighbor/loop links, weight, payload) and the
//!   [`fuse`][signature::Signature::fuse] operation that consolidates a
//!   revisit.
//! - [`store`] – [`PersistentStore`][store::PersistentStore]: the durable
//!   backing tier contract, with a [`SqliteStore`][store::SqliteStore]
//!   implementation and an [`InMemoryStore`][store::InMemoryStore] test
//!   double.
//! - [`tiering`] – [`MemoryTiers`][tiering::MemoryTiers]: the short-term
//!   buffer, the bounded working set, and eviction/reactivation against the
//!   store.

pub mod signature;
pub mod store;
pub mod tiering;

pub use placerec_perception::{VisualWord, WordDictionary};
pub use signature::{FuseOutcome, NeighborLink, PayloadPolicy, Signature, SignatureStub};
pub use store::{InMemoryStore, PersistentStore, SqliteOptions, SqliteStore, StoreError};
pub use tiering::{AdmitOutcome, LinkKind, MemoryTiers, TierStats, TieringConfig, Traversal};
