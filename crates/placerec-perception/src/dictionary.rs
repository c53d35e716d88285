//! Incremental visual-word dictionary.
//!
//! Every descriptor extracted from a snapshot is quantized to a word id.
//! When an existing word lies within `match_distance` (L2) of the
//! descriptor, the nearest one is reused; otherwise the descriptor becomes
//! the representative of a brand-new word.
//!
//! Each word keeps the set of signatures citing it.  The dictionary never
//! decides on its own to drop a word: the tiering engine calls
//! [`WordDictionary::prune_unreferenced`] once a word's reference set is
//! empty.
//!
//! # Example
//!
//! ```rust
//! use placerec_perception::dictionary::WordDictionary;
//! use placerec_types::SignatureId;
//!
//! let mut dict = WordDictionary::new(0.5);
//! let a = dict.quantize(&[0.0, 1.0], SignatureId(1)).unwrap();
//! let b = dict.quantize(&[0.1, 1.0], SignatureId(2)).unwrap();
//! assert_eq!(a, b); // within threshold: same word
//!
//! let c = dict.quantize(&[5.0, 5.0], SignatureId(2)).unwrap();
//! assert_ne!(a, c);
//! assert_eq!(dict.document_frequency(a), 2);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use placerec_types::{PlaceError, SignatureId, WordId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from dictionary operations.
#[derive(Error, Debug, PartialEq)]
pub enum DictionaryError {
    #[error("Descriptor must be non-empty")]
    EmptyDescriptor,
    #[error("Descriptor has {got} dimensions, vocabulary uses {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Unknown word: {0}")]
    UnknownWord(WordId),
}

/// Descriptor shape errors map to `Configuration`, unknown words to `Storage`.
impl From<DictionaryError> for PlaceError {
    fn from(err: DictionaryError) -> Self {
        match err {
            DictionaryError::UnknownWord(_) => PlaceError::Storage(err.to_string()),
            other => PlaceError::config("descriptor", other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VisualWord
// ─────────────────────────────────────────────────────────────────────────────

/// A quantized cluster representing one recurring descriptor pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualWord {
    pub id: WordId,
    /// The descriptor that created this word.
    pub descriptor: Vec<f32>,
    /// Signatures (in any tier) that cite this word.
    pub references: BTreeSet<SignatureId>,
}

impl VisualWord {
    pub fn new(id: WordId, descriptor: Vec<f32>) -> Self {
        Self {
            id,
            descriptor,
            references: BTreeSet::new(),
        }
    }
}

/// Euclidean distance between two equal-length descriptors.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

// ─────────────────────────────────────────────────────────────────────────────
// WordDictionary
// ─────────────────────────────────────────────────────────────────────────────

/// The vocabulary shared by every signature of a run.
///
/// Word ids are allocated monotonically and are never reused, even after
/// [`clear`][Self::clear] or pruning.
#[derive(Debug)]
pub struct WordDictionary {
    match_distance: f32,
    words: BTreeMap<WordId, VisualWord>,
    next_id: u64,
    /// Fixed by the first descriptor ever quantized.
    dimension: Option<usize>,
    /// Words not yet written to the persistent store.
    unsaved: BTreeSet<WordId>,
}

impl WordDictionary {
    /// Create an empty dictionary; the first word gets id 1.
    pub fn new(match_distance: f32) -> Self {
        Self {
            match_distance,
            words: BTreeMap::new(),
            next_id: 1,
            dimension: None,
            unsaved: BTreeSet::new(),
        }
    }

    /// Rebuild a dictionary from persisted words.
    ///
    /// Allocation resumes after `last_word_id`, which may exceed the largest
    /// id in `words` when pruned words were the most recent ones.
    pub fn restore(
        match_distance: f32,
        words: Vec<VisualWord>,
        last_word_id: WordId,
    ) -> Result<Self, DictionaryError> {
        let mut dict = Self::new(match_distance);
        for word in words {
            dict.check_dimension(&word.descriptor)?;
            dict.next_id = dict.next_id.max(word.id.0 + 1);
            dict.words.insert(word.id, word);
        }
        dict.next_id = dict.next_id.max(last_word_id.0 + 1);
        Ok(dict)
    }

    fn check_dimension(&mut self, descriptor: &[f32]) -> Result<(), DictionaryError> {
        if descriptor.is_empty() {
            return Err(DictionaryError::EmptyDescriptor);
        }
        match self.dimension {
            Some(expected) if expected != descriptor.len() => {
                Err(DictionaryError::DimensionMismatch {
                    expected,
                    got: descriptor.len(),
                })
            }
            Some(_) => Ok(()),
            None => {
                self.dimension = Some(descriptor.len());
                Ok(())
            }
        }
    }

    /// Return the nearest word and its distance, if any word exists.
    pub fn nearest(&self, descriptor: &[f32]) -> Option<(WordId, f32)> {
        self.words
            .values()
            .map(|w| (w.id, l2_distance(&w.descriptor, descriptor)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Quantize `descriptor` to a word and record `citing` as a reference.
    ///
    /// Reuses the nearest word when it is strictly closer than the match
    /// distance, otherwise allocates a new word with `descriptor` as its
    /// representative.
    pub fn quantize(
        &mut self,
        descriptor: &[f32],
        citing: SignatureId,
    ) -> Result<WordId, DictionaryError> {
        self.check_dimension(descriptor)?;
        let id = match self.nearest(descriptor) {
            Some((id, distance)) if distance < self.match_distance => id,
            _ => {
                let id = WordId(self.next_id);
                self.next_id += 1;
                self.words
                    .insert(id, VisualWord::new(id, descriptor.to_vec()));
                self.unsaved.insert(id);
                debug!(word = %id, "allocated visual word");
                id
            }
        };
        if let Some(word) = self.words.get_mut(&id) {
            word.references.insert(citing);
        }
        Ok(id)
    }

    /// Every word that lists `signature` among its references.
    pub fn words_for(&self, signature: SignatureId) -> BTreeSet<WordId> {
        self.words
            .values()
            .filter(|w| w.references.contains(&signature))
            .map(|w| w.id)
            .collect()
    }

    /// Record that `signature` cites `word`.
    pub fn add_reference(
        &mut self,
        word: WordId,
        signature: SignatureId,
    ) -> Result<(), DictionaryError> {
        let entry = self
            .words
            .get_mut(&word)
            .ok_or(DictionaryError::UnknownWord(word))?;
        entry.references.insert(signature);
        Ok(())
    }

    /// Drop `signature` from `word`'s references. Returns `true` if it was
    /// present.
    pub fn remove_reference(&mut self, word: WordId, signature: SignatureId) -> bool {
        self.words
            .get_mut(&word)
            .is_some_and(|w| w.references.remove(&signature))
    }

    /// Move every reference of `retired` onto `survivor`.
    ///
    /// `retired` is left with an empty reference set so the next prune
    /// removes it. Returns the signatures whose citation moved.
    pub fn merge(
        &mut self,
        retired: WordId,
        survivor: WordId,
    ) -> Result<BTreeSet<SignatureId>, DictionaryError> {
        if !self.words.contains_key(&survivor) {
            return Err(DictionaryError::UnknownWord(survivor));
        }
        let moved = match self.words.get_mut(&retired) {
            Some(w) => std::mem::take(&mut w.references),
            None => return Err(DictionaryError::UnknownWord(retired)),
        };
        if let Some(w) = self.words.get_mut(&survivor) {
            w.references.extend(moved.iter().copied());
        }
        Ok(moved)
    }

    /// Remove every word with an empty reference set and return their ids.
    pub fn prune_unreferenced(&mut self) -> Vec<WordId> {
        let dead: Vec<WordId> = self
            .words
            .values()
            .filter(|w| w.references.is_empty())
            .map(|w| w.id)
            .collect();
        for id in &dead {
            self.words.remove(id);
            self.unsaved.remove(id);
        }
        dead
    }

    /// Pairs `(retired, survivor)` of words whose representatives lie
    /// closer than `merge_distance`; the older word always survives.
    pub fn merge_candidates(&self, merge_distance: f32) -> BTreeMap<WordId, WordId> {
        let mut plan = BTreeMap::new();
        let mut survivors = BTreeSet::new();
        let words: Vec<&VisualWord> = self.words.values().collect();
        for (i, newer) in words.iter().enumerate().rev() {
            // A survivor is never retired, so merges never chain.
            if survivors.contains(&newer.id) {
                continue;
            }
            let survivor = words[..i]
                .iter()
                .find(|older| l2_distance(&older.descriptor, &newer.descriptor) < merge_distance);
            if let Some(older) = survivor {
                plan.insert(newer.id, older.id);
                survivors.insert(older.id);
            }
        }
        plan
    }

    /// Number of signatures citing `word` (0 for unknown words).
    pub fn document_frequency(&self, word: WordId) -> usize {
        self.words.get(&word).map_or(0, |w| w.references.len())
    }

    pub fn get(&self, word: WordId) -> Option<&VisualWord> {
        self.words.get(&word)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VisualWord> {
        self.words.values()
    }

    /// Clones of the words among `ids` that have not been persisted yet.
    pub fn unsaved_among<'a>(&self, ids: impl IntoIterator<Item = &'a WordId>) -> Vec<VisualWord> {
        ids.into_iter()
            .filter(|id| self.unsaved.contains(id))
            .filter_map(|id| self.words.get(id).cloned())
            .collect()
    }

    /// Clones of every word that has not been persisted yet.
    pub fn all_unsaved(&self) -> Vec<VisualWord> {
        self.unsaved_among(self.unsaved.iter())
    }

    /// Mark words as written to the store.
    pub fn mark_saved<'a>(&mut self, ids: impl IntoIterator<Item = &'a WordId>) {
        for id in ids {
            self.unsaved.remove(id);
        }
    }

    /// The most recently allocated word id (0 when none was ever allocated).
    pub fn last_word_id(&self) -> WordId {
        WordId(self.next_id - 1)
    }

    /// Forget every word while keeping id allocation monotonic.
    pub fn clear(&mut self) {
        self.words.clear();
        self.unsaved.clear();
        self.dimension = None;
    }

    pub fn match_distance(&self) -> f32 {
        self.match_distance
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const S1: SignatureId = SignatureId(1);
    const S2: SignatureId = SignatureId(2);

    #[test]
    fn errors_map_onto_the_taxonomy() {
        let shape: PlaceError = DictionaryError::EmptyDescriptor.into();
        assert!(shape.is_fatal());
        let unknown: PlaceError = DictionaryError::UnknownWord(WordId(9)).into();
        assert!(matches!(unknown, PlaceError::Storage(_)));
    }

    // ── quantize ─────────────────────────────────────────────────────────────

    #[test]
    fn first_descriptor_allocates_word_one() {
        let mut dict = WordDictionary::new(0.5);
        let id = dict.quantize(&[1.0, 2.0], S1).unwrap();
        assert_eq!(id, WordId(1));
        assert_eq!(dict.len(), 1);
        assert!(dict.get(id).unwrap().references.contains(&S1));
    }

    #[test]
    fn near_descriptor_reuses_word() {
        let mut dict = WordDictionary::new(0.5);
        let a = dict.quantize(&[1.0, 2.0], S1).unwrap();
        let b = dict.quantize(&[1.2, 2.0], S2).unwrap();
        assert_eq!(a, b);
        assert_eq!(dict.document_frequency(a), 2);
    }

    #[test]
    fn threshold_is_strict() {
        let mut dict = WordDictionary::new(1.0);
        let a = dict.quantize(&[0.0], S1).unwrap();
        let b = dict.quantize(&[1.0], S1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn nearest_word_wins_over_first_match() {
        let mut dict = WordDictionary::new(1.0);
        let far = dict.quantize(&[0.0], S1).unwrap();
        let near = dict.quantize(&[1.5], S1).unwrap();
        let hit = dict.quantize(&[1.2], S2).unwrap();
        assert_ne!(far, near);
        assert_eq!(hit, near);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut dict = WordDictionary::new(0.5);
        dict.quantize(&[1.0, 2.0], S1).unwrap();
        let err = dict.quantize(&[1.0], S1).unwrap_err();
        assert_eq!(err, DictionaryError::DimensionMismatch { expected: 2, got: 1 });
    }

    #[test]
    fn empty_descriptor_is_rejected() {
        let mut dict = WordDictionary::new(0.5);
        assert_eq!(dict.quantize(&[], S1).unwrap_err(), DictionaryError::EmptyDescriptor);
    }

    // ── references ───────────────────────────────────────────────────────────

    #[test]
    fn words_for_lists_cited_words() {
        let mut dict = WordDictionary::new(0.5);
        let a = dict.quantize(&[0.0], S1).unwrap();
        let b = dict.quantize(&[5.0], S1).unwrap();
        dict.quantize(&[9.0], S2).unwrap();
        assert_eq!(dict.words_for(S1), BTreeSet::from([a, b]));
    }

    #[test]
    fn merge_moves_references_and_prune_drops_retired() {
        let mut dict = WordDictionary::new(0.5);
        let a = dict.quantize(&[0.0], S1).unwrap();
        let b = dict.quantize(&[3.0], S2).unwrap();
        let moved = dict.merge(b, a).unwrap();
        assert_eq!(moved, BTreeSet::from([S2]));
        assert_eq!(dict.document_frequency(a), 2);
        assert_eq!(dict.prune_unreferenced(), vec![b]);
        assert!(dict.get(b).is_none());
    }

    #[test]
    fn merge_unknown_word_is_error() {
        let mut dict = WordDictionary::new(0.5);
        let a = dict.quantize(&[0.0], S1).unwrap();
        assert!(matches!(dict.merge(WordId(99), a), Err(DictionaryError::UnknownWord(_))));
    }

    #[test]
    fn merge_candidates_keep_the_older_word() {
        let mut dict = WordDictionary::new(0.5);
        let a = dict.quantize(&[0.0], S1).unwrap();
        let b = dict.quantize(&[0.8], S1).unwrap();
        let c = dict.quantize(&[10.0], S1).unwrap();
        let plan = dict.merge_candidates(1.0);
        assert_eq!(plan.get(&b), Some(&a));
        assert!(!plan.contains_key(&c));
        assert!(!plan.contains_key(&a));
    }

    // ── persistence bookkeeping ──────────────────────────────────────────────

    #[test]
    fn new_words_are_unsaved_until_marked() {
        let mut dict = WordDictionary::new(0.5);
        let a = dict.quantize(&[0.0], S1).unwrap();
        assert_eq!(dict.all_unsaved().len(), 1);
        dict.mark_saved([&a]);
        assert!(dict.all_unsaved().is_empty());
    }

    #[test]
    fn restore_continues_after_last_word_id() {
        let word = VisualWord {
            id: WordId(4),
            descriptor: vec![1.0, 1.0],
            references: BTreeSet::from([S1]),
        };
        let mut dict = WordDictionary::restore(0.5, vec![word], WordId(9)).unwrap();
        assert!(dict.all_unsaved().is_empty());
        let id = dict.quantize(&[7.0, 7.0], S2).unwrap();
        assert_eq!(id, WordId(10));
    }

    #[test]
    fn clear_keeps_ids_monotonic() {
        let mut dict = WordDictionary::new(0.5);
        dict.quantize(&[0.0], S1).unwrap();
        dict.clear();
        assert!(dict.is_empty());
        assert_eq!(dict.quantize(&[0.0, 1.0], S2).unwrap(), WordId(2));
    }
}
