//! `placerec-perception` – Appearance vocabulary.
//!
//! Turns raw feature descriptors into the discrete visual words that places
//! are compared by.
//!
//! # Modules
//!
//! - [`dictionary`] – [`WordDictionary`][dictionary::WordDictionary]: an
//!   incremental vocabulary that quantizes descriptors to the nearest
//!   existing word or allocates a new one, and tracks which signatures cite
//!   each word.
//! - [`similarity`] – IDF-weighted cosine similarity over word histograms,
//!   the observation score used by the loop-closure filter.

pub mod dictionary;
pub mod similarity;

pub use dictionary::{DictionaryError, VisualWord, WordDictionary};
pub use similarity::{inverse_document_frequency, tfidf_cosine};
