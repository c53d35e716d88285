//! In-memory [`PersistentStore`] used as a test double.
//!
//! Behaves like the SQLite backend (upserts, derived word references,
//! monotonic high-water marks) and can be told to fail saves or loads so
//! callers can exercise their `StorageError` paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use placerec_perception::VisualWord;
use placerec_types::{Residency, SignatureId, WordId};

use super::{LinkSets, PersistentStore, StoreError};
use crate::signature::Signature;

#[derive(Debug, Default)]
struct State {
    connected: bool,
    signatures: BTreeMap<SignatureId, Signature>,
    /// Word id -> representative descriptor.
    words: BTreeMap<WordId, Vec<f32>>,
    last_signature: u64,
    last_word: u64,
}

/// Map-backed store with switchable failure injection.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
}

impl InMemoryStore {
    /// A connected, empty store.
    pub fn new() -> Self {
        let store = Self::default();
        store.lock().connected = true;
        store
    }

    /// Make every subsequent `save` fail until switched off.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `load` fail until switched off.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Number of signatures currently held.
    pub fn len(&self) -> usize {
        self.lock().signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let state = self.lock();
        if state.connected {
            Ok(state)
        } else {
            Err(StoreError::NotConnected)
        }
    }
}

impl PersistentStore for InMemoryStore {
    fn connect(&self, _location: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        // Every connect opens a fresh location.
        *state = State {
            connected: true,
            ..State::default()
        };
        Ok(())
    }

    fn disconnect(&self) -> Result<(), StoreError> {
        self.lock().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn save(&self, signatures: &[Signature], words: &[VisualWord]) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected save failure".to_string()));
        }
        let mut state = self.connected()?;
        for sig in signatures {
            let mut copy = sig.clone();
            copy.residency = Residency::Persisted;
            state.last_signature = state.last_signature.max(sig.id.0);
            state.signatures.insert(sig.id, copy);
        }
        for word in words {
            state.last_word = state.last_word.max(word.id.0);
            state.words.insert(word.id, word.descriptor.clone());
        }
        Ok(())
    }

    fn load(&self, id: SignatureId) -> Result<Option<Signature>, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected load failure".to_string()));
        }
        Ok(self.connected()?.signatures.get(&id).cloned())
    }

    fn load_words(&self, ids: &[WordId]) -> Result<Vec<VisualWord>, StoreError> {
        let state = self.connected()?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                let descriptor = state.words.get(id)?;
                let mut word = VisualWord::new(*id, descriptor.clone());
                word.references = state
                    .signatures
                    .values()
                    .filter(|s| s.words.contains_key(id))
                    .map(|s| s.id)
                    .collect();
                Some(word)
            })
            .collect())
    }

    fn neighbor_ids(&self, id: SignatureId) -> Result<BTreeSet<SignatureId>, StoreError> {
        Ok(self
            .connected()?
            .signatures
            .get(&id)
            .map(|s| s.neighbors.keys().copied().collect())
            .unwrap_or_default())
    }

    fn weight(&self, id: SignatureId) -> Result<Option<u32>, StoreError> {
        Ok(self.connected()?.signatures.get(&id).map(|s| s.weight))
    }

    fn loop_and_child_ids(&self, id: SignatureId) -> Result<LinkSets, StoreError> {
        Ok(self
            .connected()?
            .signatures
            .get(&id)
            .map(|s| (s.loop_links.clone(), s.child_links.clone()))
            .unwrap_or_default())
    }

    fn change_words_ref(&self, remap: &BTreeMap<WordId, WordId>) -> Result<(), StoreError> {
        let mut state = self.connected()?;
        for sig in state.signatures.values_mut() {
            for (old, new) in remap {
                sig.replace_word(*old, *new);
            }
        }
        Ok(())
    }

    fn delete_words(&self, ids: &[WordId]) -> Result<(), StoreError> {
        let mut state = self.connected()?;
        for id in ids {
            state.last_word = state.last_word.max(id.0);
            state.words.remove(id);
        }
        Ok(())
    }

    fn all_signature_ids(&self) -> Result<BTreeSet<SignatureId>, StoreError> {
        Ok(self.connected()?.signatures.keys().copied().collect())
    }

    fn last_signature_id(&self) -> Result<SignatureId, StoreError> {
        Ok(SignatureId(self.connected()?.last_signature))
    }

    fn last_word_id(&self) -> Result<WordId, StoreError> {
        Ok(WordId(self.connected()?.last_word))
    }

    fn highest_weighted(&self, count: usize) -> Result<Vec<(SignatureId, u32)>, StoreError> {
        let state = self.connected()?;
        let mut ranked: Vec<(u32, SignatureId)> =
            state.signatures.values().map(|s| (s.weight, s.id)).collect();
        ranked.sort_by(|a, b| b.cmp(a));
        Ok(ranked.into_iter().take(count).map(|(w, id)| (id, w)).collect())
    }

    fn memory_footprint_bytes(&self) -> Result<u64, StoreError> {
        let state = self.connected()?;
        let words: usize = state.words.values().map(|d| d.len() * 4).sum();
        let sigs: usize = state
            .signatures
            .values()
            .map(|s| s.payload.image.len() + s.words.len() * 16 + s.neighbors.len() * 8)
            .sum();
        Ok((words + sigs) as u64)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
