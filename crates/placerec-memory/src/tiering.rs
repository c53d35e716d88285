//! Memory tiering engine.
//!
//! Every signature lives in exactly one tier:
//!
//! ```text
//!  admit ──► Buffered ──(buffer window)──► Resident ──(rebalance)──► Persisted
//!                                             ▲                          │
//!                                             └────── reactivate ────────┘
//! ```
//!
//! - **Buffered**: the newest `stm_size` signatures. Excluded from loop
//!   closure search so a place is never matched against itself a moment
//!   later.
//! - **Resident**: the working set, fully materialized and bounded by
//!   `working_set_capacity` at rest.
//! - **Persisted**: evicted to the [`PersistentStore`]. A connectivity stub
//!   (neighbor, loop and child ids) stays in RAM so the graph can still be
//!   walked without touching the store.
//!
//! Eviction picks the lowest weight first, ties broken by smallest id. A
//! failed save leaves the candidate resident and is retried on the next
//! rebalance.
//!
//! # Example
//!
//! ```rust
//! use placerec_memory::store::InMemoryStore;
//! use placerec_memory::tiering::{MemoryTiers, TieringConfig};
//! use placerec_types::{Feature, Keypoint, SensorPayload, Snapshot};
//!
//! let config = TieringConfig { working_set_capacity: 2, stm_size: 0, ..Default::default() };
//! let mut tiers = MemoryTiers::open(Box::new(InMemoryStore::new()), config).unwrap();
//!
//! for i in 0..4 {
//!     let feature = Feature { descriptor: vec![i as f32 * 10.0], keypoint: Keypoint::default() };
//!     tiers.admit(&Snapshot::new(vec![feature], SensorPayload::default())).unwrap();
//! }
//! assert_eq!(tiers.working_set_ids().len(), 2);
//! assert_eq!(tiers.persisted_ids().len(), 2);
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use placerec_perception::WordDictionary;
use placerec_types::{PlaceError, Residency, SignatureId, Snapshot, WordId};
use tracing::{debug, info, warn};

use crate::signature::{NeighborLink, PayloadPolicy, Signature, SignatureStub};
use crate::store::{PersistentStore, StoreError};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and results
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning knobs for [`MemoryTiers`].
#[derive(Debug, Clone, PartialEq)]
pub struct TieringConfig {
    /// Maximum working-set size at rest (>= 1).
    pub working_set_capacity: usize,
    /// Number of newest signatures held back in the short-term buffer.
    pub stm_size: usize,
    /// Graph depth followed when reactivating or traversing.
    pub reactivation_depth: usize,
    /// Quantization L2 threshold handed to the word dictionary.
    pub match_distance: f32,
    pub payload_policy: PayloadPolicy,
    /// Reactivate the highest-weighted persisted signatures on open.
    pub warm_start: bool,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            working_set_capacity: 50,
            stm_size: 3,
            reactivation_depth: 1,
            match_distance: 0.5,
            payload_policy: PayloadPolicy::Keep,
            warm_start: true,
        }
    }
}

/// Which links a traversal follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Neighbor,
    /// Loop and child links.
    Loop,
}

/// Ids reached by a traversal, and the subset that had to be reactivated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Traversal {
    pub reached: BTreeSet<SignatureId>,
    pub reactivated: Vec<SignatureId>,
}

/// What one [`MemoryTiers::admit`] call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdmitOutcome {
    pub id: SignatureId,
    /// Buffered ids aged into the working set.
    pub promoted: Vec<SignatureId>,
    pub evicted: Vec<SignatureId>,
    pub reactivated: Vec<SignatureId>,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub evictions: u64,
    pub reactivations: u64,
    pub storage_errors: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryTiers
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of every signature and of the word dictionary.
///
/// All mutation goes through `&mut self`, so id allocation has a single
/// authority.
pub struct MemoryTiers {
    config: TieringConfig,
    store: Box<dyn PersistentStore>,
    dictionary: WordDictionary,
    /// Buffered and resident signatures.
    signatures: BTreeMap<SignatureId, Signature>,
    buffer: VecDeque<SignatureId>,
    working_set: BTreeSet<SignatureId>,
    stubs: BTreeMap<SignatureId, SignatureStub>,
    persisted: BTreeSet<SignatureId>,
    next_signature_id: u64,
    last_admitted: Option<SignatureId>,
    eviction_deferred: bool,
    stats: TierStats,
}

impl MemoryTiers {
    /// Open the engine over a connected `store`.
    ///
    /// Id allocation resumes after the store's last signature and word ids,
    /// the dictionary is restored from the persisted words, and with
    /// `warm_start` the highest-weighted persisted signatures are reloaded
    /// into the working set.
    pub fn open(store: Box<dyn PersistentStore>, config: TieringConfig) -> Result<Self, PlaceError> {
        if config.working_set_capacity == 0 {
            return Err(PlaceError::config(
                "Mem/WorkingSetCapacity",
                "must be at least 1",
            ));
        }
        if !store.is_connected() {
            return Err(StoreError::NotConnected.into());
        }
        let mut tiers = Self {
            dictionary: WordDictionary::new(config.match_distance),
            config,
            store,
            signatures: BTreeMap::new(),
            buffer: VecDeque::new(),
            working_set: BTreeSet::new(),
            stubs: BTreeMap::new(),
            persisted: BTreeSet::new(),
            next_signature_id: 1,
            last_admitted: None,
            eviction_deferred: false,
            stats: TierStats::default(),
        };
        tiers.bootstrap()?;

        if tiers.config.warm_start {
            for (id, weight) in tiers.store.highest_weighted(tiers.config.working_set_capacity)? {
                debug!(signature = %id, weight, "warm start");
                if let Err(e) = tiers.reactivate_one(id) {
                    tiers.record_storage_error(&e, "warm start load failed");
                }
            }
        }
        info!(
            next_signature = tiers.next_signature_id,
            words = tiers.dictionary.len(),
            persisted = tiers.persisted.len(),
            resident = tiers.working_set.len(),
            "memory opened"
        );
        Ok(tiers)
    }

    /// Resume ids and vocabulary from whatever the store currently holds.
    /// Allocation never moves backwards.
    fn bootstrap(&mut self) -> Result<(), PlaceError> {
        let last_signature = self.store.last_signature_id()?;
        self.next_signature_id = self.next_signature_id.max(last_signature.0 + 1);

        let last_word = self.store.last_word_id()?;
        let ids: Vec<WordId> = (1..=last_word.0).map(WordId).collect();
        let words = self.store.load_words(&ids)?;
        let last_word = last_word.max(self.dictionary.last_word_id());
        self.dictionary = WordDictionary::restore(self.config.match_distance, words, last_word)
            .map_err(|e| PlaceError::Storage(format!("persisted vocabulary is unusable: {e}")))?;

        self.persisted = self.store.all_signature_ids()?;
        Ok(())
    }

    // ── admission ────────────────────────────────────────────────────────────

    /// Quantize `snapshot` into a new signature and admit it.
    ///
    /// The new signature is linked to the previously admitted one, pushed
    /// into the short-term buffer, and the oldest buffered signatures are
    /// aged into the working set before a rebalance.
    pub fn admit(&mut self, snapshot: &Snapshot) -> Result<AdmitOutcome, PlaceError> {
        let id = SignatureId(self.next_signature_id);
        self.next_signature_id += 1;

        let mut sig = Signature::new(id, snapshot.timestamp, snapshot.payload.clone());
        for feature in &snapshot.features {
            match self.dictionary.quantize(&feature.descriptor, id) {
                Ok(word) => sig.add_word(word, feature.keypoint),
                Err(e) => warn!(signature = %id, error = %e, "descriptor skipped"),
            }
        }

        let mut outcome = AdmitOutcome {
            id,
            ..AdmitOutcome::default()
        };

        if let Some(prev) = self.last_admitted {
            if !self.is_materialized(prev) {
                match self.reactivate_one(prev) {
                    Ok(true) => outcome.reactivated.push(prev),
                    Ok(false) => {}
                    Err(e) => self.record_storage_error(&e, "previous signature unavailable, link skipped"),
                }
            }
            if let Some(prev_sig) = self.signatures.get_mut(&prev) {
                let link = NeighborLink::new(snapshot.payload.actions.clone());
                prev_sig.link_neighbor(id, link.clone());
                sig.link_neighbor(prev, link);
            }
        }

        debug!(signature = %id, words = sig.words.len(), "admitted");
        self.signatures.insert(id, sig);
        self.buffer.push_back(id);
        self.last_admitted = Some(id);

        while self.buffer.len() > self.config.stm_size {
            let Some(oldest) = self.buffer.pop_front() else {
                break;
            };
            if let Some(s) = self.signatures.get_mut(&oldest) {
                s.residency = Residency::Resident;
            }
            self.working_set.insert(oldest);
            outcome.promoted.push(oldest);
        }

        let mut protect: BTreeSet<SignatureId> = outcome.reactivated.iter().copied().collect();
        protect.insert(id);
        outcome.evicted = self.rebalance(&protect);
        Ok(outcome)
    }

    // ── eviction ─────────────────────────────────────────────────────────────

    /// Evict until the working set is within capacity.
    ///
    /// Ids in `protect` are only chosen once nothing else is left. A store
    /// failure stops the loop and marks the eviction as deferred; the next
    /// call retries.
    pub fn rebalance(&mut self, protect: &BTreeSet<SignatureId>) -> Vec<SignatureId> {
        let mut evicted = Vec::new();
        while self.working_set.len() > self.config.working_set_capacity {
            let victim = self
                .working_set
                .iter()
                .filter_map(|id| {
                    self.signatures
                        .get(id)
                        .map(|s| (protect.contains(id), s.weight, *id))
                })
                .min();
            let Some((_, _, victim)) = victim else {
                break;
            };
            match self.evict(victim) {
                Ok(()) => evicted.push(victim),
                Err(e) => {
                    self.eviction_deferred = true;
                    self.record_storage_error(&e, "eviction deferred");
                    break;
                }
            }
        }
        if self.working_set.len() <= self.config.working_set_capacity {
            self.eviction_deferred = false;
        }
        metrics::gauge!("placerec_working_set_size").set(self.working_set.len() as f64);
        if !evicted.is_empty() {
            debug!(
                evicted = ?evicted,
                footprint_bytes = self.store.memory_footprint_bytes().ok(),
                "rebalanced"
            );
        }
        evicted
    }

    fn evict(&mut self, id: SignatureId) -> Result<(), StoreError> {
        let Some(sig) = self.signatures.get(&id) else {
            return Err(StoreError::NotFound(id.0));
        };
        let words = self.dictionary.unsaved_among(sig.words.keys());
        self.store.save(std::slice::from_ref(sig), &words)?;
        self.dictionary.mark_saved(words.iter().map(|w| &w.id));

        if let Some(sig) = self.signatures.remove(&id) {
            self.stubs.insert(id, sig.stub());
        }
        self.working_set.remove(&id);
        self.persisted.insert(id);
        self.stats.evictions += 1;
        metrics::counter!("placerec_evictions_total").increment(1);
        Ok(())
    }

    // ── reactivation ─────────────────────────────────────────────────────────

    /// Load `id` back into the working set, together with its neighbors up
    /// to the configured depth. Returns every id that was reloaded.
    ///
    /// A no-op for ids already in RAM. Neighbor load failures are logged and
    /// skipped; the working set is not rebalanced here.
    pub fn reactivate(&mut self, id: SignatureId) -> Result<Vec<SignatureId>, StoreError> {
        if self.is_materialized(id) {
            return Ok(Vec::new());
        }
        self.reactivate_one(id)?;
        let mut reloaded = vec![id];
        let traversal = self.traverse(id, LinkKind::Neighbor, self.config.reactivation_depth);
        reloaded.extend(traversal.reactivated);
        Ok(reloaded)
    }

    /// Reload a single signature. `Ok(false)` if it was already in RAM.
    fn reactivate_one(&mut self, id: SignatureId) -> Result<bool, StoreError> {
        if self.is_materialized(id) {
            return Ok(false);
        }
        let mut sig = self.store.load(id)?.ok_or(StoreError::NotFound(id.0))?;
        sig.residency = Residency::Resident;
        self.stubs.remove(&id);
        self.persisted.remove(&id);
        self.working_set.insert(id);
        self.signatures.insert(id, sig);
        self.stats.reactivations += 1;
        metrics::counter!("placerec_reactivations_total").increment(1);
        debug!(signature = %id, "reactivated");
        Ok(true)
    }

    // ── traversal ────────────────────────────────────────────────────────────

    /// Neighbors of `id` within the reactivation depth, reloading persisted
    /// ones on the way.
    pub fn neighbors_of(&mut self, id: SignatureId) -> Traversal {
        self.traverse(id, LinkKind::Neighbor, self.config.reactivation_depth)
    }

    /// Loop/child-linked signatures of `id` within the reactivation depth.
    pub fn loop_candidates_of(&mut self, id: SignatureId) -> Traversal {
        self.traverse(id, LinkKind::Loop, self.config.reactivation_depth)
    }

    /// Links of `id` without reactivating anything: from RAM, then the
    /// stub, then the store.
    pub fn links_of(
        &self,
        id: SignatureId,
        kind: LinkKind,
    ) -> Result<BTreeSet<SignatureId>, StoreError> {
        if let Some(sig) = self.signatures.get(&id) {
            return Ok(match kind {
                LinkKind::Neighbor => sig.neighbors.keys().copied().collect(),
                LinkKind::Loop => sig.loop_links.union(&sig.child_links).copied().collect(),
            });
        }
        if let Some(stub) = self.stubs.get(&id) {
            return Ok(match kind {
                LinkKind::Neighbor => stub.neighbors.clone(),
                LinkKind::Loop => stub.loop_links.union(&stub.child_links).copied().collect(),
            });
        }
        match kind {
            LinkKind::Neighbor => self.store.neighbor_ids(id),
            LinkKind::Loop => self
                .store
                .loop_and_child_ids(id)
                .map(|(loops, children)| loops.into_iter().chain(children).collect()),
        }
    }

    fn traverse(&mut self, start: SignatureId, kind: LinkKind, depth: usize) -> Traversal {
        let mut traversal = Traversal::default();
        let mut visited = BTreeSet::from([start]);
        let mut frontier = vec![start];

        for _ in 0..depth {
            let mut next = Vec::new();
            for id in frontier {
                let links = match self.links_of(id, kind) {
                    Ok(links) => links,
                    Err(e) => {
                        self.record_storage_error(&e, "link query failed");
                        continue;
                    }
                };
                for other in links {
                    if !visited.insert(other) {
                        continue;
                    }
                    match self.reactivate_one(other) {
                        Ok(reloaded) => {
                            if reloaded {
                                traversal.reactivated.push(other);
                            }
                            traversal.reached.insert(other);
                            next.push(other);
                        }
                        // Excluded for this cycle only.
                        Err(e) => self.record_storage_error(&e, "reactivation failed"),
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        traversal
    }

    // ── loop closure ─────────────────────────────────────────────────────────

    /// Fuse `current` into the accepted match `matched`.
    ///
    /// The match gains a loop link to `current`, `current` a child link to
    /// the match. Neighbor links the match inherits are mirrored on the
    /// other side; a neighbor that cannot be reloaded has its new link
    /// rolled back. Returns the ids reloaded to mirror links.
    pub fn accept(
        &mut self,
        matched: SignatureId,
        current: SignatureId,
    ) -> Result<Vec<SignatureId>, PlaceError> {
        if matched == current {
            return Err(PlaceError::integrity(
                "loop_closure",
                format!("signature {current} cannot close a loop on itself"),
            ));
        }
        let incoming = self.signatures.get(&current).cloned().ok_or_else(|| {
            PlaceError::integrity(
                "loop_closure",
                format!("current signature {current} is not in memory"),
            )
        })?;
        let policy = self.config.payload_policy;
        let target = self.signatures.get_mut(&matched).ok_or_else(|| {
            PlaceError::integrity(
                "loop_closure",
                format!("matched signature {matched} is not in memory"),
            )
        })?;
        let fused = target.fuse(&incoming, policy);
        target.loop_links.insert(current);
        let weight = target.weight;

        for word in &fused.new_words {
            self.dictionary
                .add_reference(*word, matched)
                .map_err(|e| PlaceError::integrity("reference_consistency", e.to_string()))?;
        }
        if let Some(cur) = self.signatures.get_mut(&current) {
            cur.child_links.insert(matched);
        }

        let mut reloaded = Vec::new();
        for (neighbor, link) in fused.new_neighbors {
            match self.reactivate_one(neighbor) {
                Ok(true) => reloaded.push(neighbor),
                Ok(false) => {}
                Err(e) => {
                    self.record_storage_error(&e, "fused neighbor unavailable, link rolled back");
                    if let Some(target) = self.signatures.get_mut(&matched) {
                        target.neighbors.remove(&neighbor);
                    }
                    continue;
                }
            }
            if let Some(other) = self.signatures.get_mut(&neighbor) {
                other.link_neighbor(matched, link);
            }
        }

        metrics::counter!("placerec_loop_closures_total").increment(1);
        info!(%matched, %current, weight, "loop closure accepted");
        Ok(reloaded)
    }

    // ── vocabulary maintenance ───────────────────────────────────────────────

    /// Merge words per `plan` (retired -> survivor), then prune.
    ///
    /// Persisted citations are rewritten in the store first; nothing in RAM
    /// changes if that fails. Returns the pruned word ids.
    pub fn merge_words(&mut self, plan: &BTreeMap<WordId, WordId>) -> Result<Vec<WordId>, PlaceError> {
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        for (retired, survivor) in plan {
            for word in [retired, survivor] {
                if self.dictionary.get(*word).is_none() {
                    return Err(PlaceError::integrity(
                        "word_merge",
                        format!("unknown word {word} in merge plan"),
                    ));
                }
            }
            if plan.contains_key(survivor) {
                return Err(PlaceError::integrity(
                    "word_merge",
                    format!("survivor {survivor} is itself retired"),
                ));
            }
        }

        // Survivors must exist in the store before citations point at them.
        let unsaved = self.dictionary.unsaved_among(plan.values());
        if !unsaved.is_empty() {
            self.store.save(&[], &unsaved)?;
            self.dictionary.mark_saved(unsaved.iter().map(|w| &w.id));
        }
        self.store.change_words_ref(plan)?;

        for (retired, survivor) in plan {
            let moved = self
                .dictionary
                .merge(*retired, *survivor)
                .map_err(|e| PlaceError::integrity("word_merge", e.to_string()))?;
            for sig_id in moved {
                if let Some(sig) = self.signatures.get_mut(&sig_id) {
                    sig.replace_word(*retired, *survivor);
                }
            }
        }
        info!(merged = plan.len(), "vocabulary consolidated");
        Ok(self.prune_words())
    }

    /// Merge every pair of words closer than `merge_distance`.
    pub fn consolidate(&mut self, merge_distance: f32) -> Result<Vec<WordId>, PlaceError> {
        let plan = self.dictionary.merge_candidates(merge_distance);
        self.merge_words(&plan)
    }

    /// Drop zero-reference words from the dictionary and the store.
    pub fn prune_words(&mut self) -> Vec<WordId> {
        let dead = self.dictionary.prune_unreferenced();
        if !dead.is_empty() {
            if let Err(e) = self.store.delete_words(&dead) {
                self.record_storage_error(&e, "word deletion failed");
            }
            debug!(pruned = dead.len(), "words pruned");
        }
        dead
    }

    // ── lifecycle ────────────────────────────────────────────────────────────

    /// Write every buffered and resident signature and every unsaved word in
    /// one transaction.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let sigs: Vec<Signature> = self.signatures.values().cloned().collect();
        let words = self.dictionary.all_unsaved();
        self.store.save(&sigs, &words)?;
        self.dictionary.mark_saved(words.iter().map(|w| &w.id));
        info!(
            signatures = sigs.len(),
            words = words.len(),
            footprint_bytes = self.store.memory_footprint_bytes().ok(),
            "memory flushed"
        );
        Ok(())
    }

    /// Forget every tier and reconnect the store to `location`. Ids keep
    /// counting from where they were.
    pub fn reset(&mut self, location: &str) -> Result<(), PlaceError> {
        self.store.disconnect()?;
        self.store.connect(location)?;
        self.signatures.clear();
        self.buffer.clear();
        self.working_set.clear();
        self.stubs.clear();
        self.persisted.clear();
        self.dictionary.clear();
        self.last_admitted = None;
        self.eviction_deferred = false;
        self.bootstrap()?;
        info!(location, next_signature = self.next_signature_id, "memory reset");
        Ok(())
    }

    fn record_storage_error(&mut self, err: &StoreError, context: &str) {
        self.stats.storage_errors += 1;
        metrics::counter!("placerec_storage_errors_total").increment(1);
        warn!(error = %err, "{context}");
    }

    // ── accessors ────────────────────────────────────────────────────────────

    pub fn config(&self) -> &TieringConfig {
        &self.config
    }

    /// A buffered or resident signature.
    pub fn signature(&self, id: SignatureId) -> Option<&Signature> {
        self.signatures.get(&id)
    }

    pub fn signatures(&self) -> impl Iterator<Item = &Signature> {
        self.signatures.values()
    }

    pub fn is_materialized(&self, id: SignatureId) -> bool {
        self.signatures.contains_key(&id)
    }

    pub fn working_set_ids(&self) -> &BTreeSet<SignatureId> {
        &self.working_set
    }

    /// Buffered ids, oldest first.
    pub fn buffered_ids(&self) -> impl Iterator<Item = SignatureId> + '_ {
        self.buffer.iter().copied()
    }

    pub fn persisted_ids(&self) -> &BTreeSet<SignatureId> {
        &self.persisted
    }

    pub fn stubs(&self) -> &BTreeMap<SignatureId, SignatureStub> {
        &self.stubs
    }

    pub fn residency(&self, id: SignatureId) -> Option<Residency> {
        match self.signatures.get(&id) {
            Some(sig) => Some(sig.residency),
            None if self.persisted.contains(&id) => Some(Residency::Persisted),
            None => None,
        }
    }

    pub fn dictionary(&self) -> &WordDictionary {
        &self.dictionary
    }

    pub fn store(&self) -> &dyn PersistentStore {
        self.store.as_ref()
    }

    pub fn last_admitted(&self) -> Option<SignatureId> {
        self.last_admitted
    }

    /// `true` while a failed eviction leaves the working set over capacity.
    pub fn eviction_deferred(&self) -> bool {
        self.eviction_deferred
    }

    pub fn stats(&self) -> TierStats {
        self.stats
    }

    /// Weight of every working-set signature.
    pub fn weights(&self) -> BTreeMap<SignatureId, u32> {
        self.working_set
            .iter()
            .filter_map(|id| self.signatures.get(id).map(|s| (*id, s.weight)))
            .collect()
    }

    /// Weight of any signature, asking the store for persisted ones.
    pub fn weight_of(&self, id: SignatureId) -> Result<Option<u32>, StoreError> {
        match self.signatures.get(&id) {
            Some(sig) => Ok(Some(sig.weight)),
            None => self.store.weight(id),
        }
    }

    /// Number of live signatures across all tiers.
    pub fn population(&self) -> usize {
        self.signatures.len() + self.persisted.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use placerec_types::{Feature, Keypoint, SensorPayload};
    use proptest::prelude::*;

    use super::*;
    use crate::store::{InMemoryStore, SqliteStore};

    fn feature(value: f32) -> Feature {
        Feature {
            descriptor: vec![value],
            keypoint: Keypoint::new(value, 0.0),
        }
    }

    /// One snapshot whose words are `values * 10` (well apart at the default
    /// match distance).
    fn snap(values: &[u32]) -> Snapshot {
        Snapshot::new(
            values.iter().map(|&v| feature(v as f32 * 10.0)).collect(),
            SensorPayload::default(),
        )
    }

    fn config(cap: usize, stm: usize) -> TieringConfig {
        TieringConfig {
            working_set_capacity: cap,
            stm_size: stm,
            ..TieringConfig::default()
        }
    }

    fn open_shared(cap: usize, stm: usize) -> (MemoryTiers, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let tiers = MemoryTiers::open(Box::new(store.clone()), config(cap, stm)).unwrap();
        (tiers, store)
    }

    /// Every word's references match the in-RAM signatures citing it.
    fn assert_references_consistent(tiers: &MemoryTiers) {
        for word in tiers.dictionary().iter() {
            for sig in tiers.signatures() {
                assert_eq!(
                    sig.words.contains_key(&word.id),
                    word.references.contains(&sig.id),
                    "word {} / signature {}",
                    word.id,
                    sig.id
                );
            }
        }
    }

    // ── open ─────────────────────────────────────────────────────────────────

    #[test]
    fn open_rejects_zero_capacity() {
        let err = MemoryTiers::open(Box::new(InMemoryStore::new()), config(0, 0))
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn open_rejects_disconnected_store() {
        let store = InMemoryStore::new();
        store.disconnect().unwrap();
        let err = MemoryTiers::open(Box::new(store), config(3, 0)).err().unwrap();
        assert!(matches!(err, PlaceError::Storage(_)));
    }

    // ── admission ────────────────────────────────────────────────────────────

    #[test]
    fn buffer_ages_into_working_set() {
        let (mut tiers, _) = open_shared(10, 2);
        for i in 0..4 {
            tiers.admit(&snap(&[i])).unwrap();
        }
        assert_eq!(
            tiers.buffered_ids().collect::<Vec<_>>(),
            vec![SignatureId(3), SignatureId(4)]
        );
        assert_eq!(
            tiers.working_set_ids(),
            &BTreeSet::from([SignatureId(1), SignatureId(2)])
        );
        assert_eq!(tiers.residency(SignatureId(1)), Some(Residency::Resident));
        assert_eq!(tiers.residency(SignatureId(4)), Some(Residency::Buffered));
    }

    #[test]
    fn consecutive_signatures_are_linked_symmetrically() {
        let (mut tiers, _) = open_shared(10, 1);
        for i in 0..3 {
            tiers.admit(&snap(&[i])).unwrap();
        }
        let two = tiers.signature(SignatureId(2)).unwrap();
        assert!(two.neighbors.contains_key(&SignatureId(1)));
        assert!(two.neighbors.contains_key(&SignatureId(3)));
        let one = tiers.signature(SignatureId(1)).unwrap();
        assert!(one.neighbors.contains_key(&SignatureId(2)));
    }

    #[test]
    fn bad_descriptor_is_skipped() {
        let (mut tiers, _) = open_shared(10, 0);
        let mut snapshot = snap(&[1]);
        snapshot.features.push(Feature {
            descriptor: vec![1.0, 2.0],
            keypoint: Keypoint::default(),
        });
        let outcome = tiers.admit(&snapshot).unwrap();
        assert_eq!(tiers.signature(outcome.id).unwrap().words.len(), 1);
    }

    proptest! {
        #[test]
        fn admitted_ids_strictly_increase(sizes in proptest::collection::vec(0usize..4, 1..30)) {
            let (mut tiers, _) = open_shared(4, 1);
            let mut last = 0u64;
            let mut last_word = tiers.dictionary().last_word_id();
            for (cycle, size) in sizes.iter().enumerate() {
                let values: Vec<u32> = (0..*size as u32).map(|k| cycle as u32 * 8 + k).collect();
                let outcome = tiers.admit(&snap(&values)).unwrap();
                prop_assert!(outcome.id.0 > last);
                last = outcome.id.0;
                prop_assert!(tiers.dictionary().last_word_id() >= last_word);
                last_word = tiers.dictionary().last_word_id();
            }
            prop_assert!(tiers.working_set_ids().len() <= 4);
        }
    }

    // ── eviction ─────────────────────────────────────────────────────────────

    #[test]
    fn working_set_stays_bounded_and_evicts_oldest() {
        let (mut tiers, store) = open_shared(3, 0);
        let mut evicted = Vec::new();
        for i in 0..10 {
            evicted.extend(tiers.admit(&snap(&[i])).unwrap().evicted);
            assert!(tiers.working_set_ids().len() <= 3);
        }
        assert_eq!(evicted, (1..=7).map(SignatureId).collect::<Vec<_>>());
        assert_eq!(
            store.all_signature_ids().unwrap(),
            (1..=7).map(SignatureId).collect::<BTreeSet<_>>()
        );
        assert_eq!(tiers.stats().evictions, 7);
        assert_eq!(tiers.residency(SignatureId(1)), Some(Residency::Persisted));
        assert!(tiers.stubs().contains_key(&SignatureId(1)));
        assert_references_consistent(&tiers);
    }

    #[test]
    fn heavier_signatures_are_evicted_last() {
        let (mut tiers, _) = open_shared(2, 0);
        tiers.admit(&snap(&[1])).unwrap();
        tiers.admit(&snap(&[2])).unwrap();
        tiers.accept(SignatureId(1), SignatureId(2)).unwrap();
        let outcome = tiers.admit(&snap(&[3])).unwrap();
        assert_eq!(outcome.evicted, vec![SignatureId(2)]);
    }

    #[test]
    fn storage_failure_defers_eviction_then_recovers() {
        let (mut tiers, store) = open_shared(2, 0);
        tiers.admit(&snap(&[1])).unwrap();
        tiers.admit(&snap(&[2])).unwrap();

        store.set_fail_saves(true);
        let outcome = tiers.admit(&snap(&[3])).unwrap();
        assert!(outcome.evicted.is_empty());
        assert!(tiers.eviction_deferred());
        assert_eq!(tiers.working_set_ids().len(), 3);
        assert_eq!(tiers.residency(SignatureId(1)), Some(Residency::Resident));
        assert_eq!(tiers.stats().storage_errors, 1);

        store.set_fail_saves(false);
        let evicted = tiers.rebalance(&BTreeSet::new());
        assert_eq!(evicted, vec![SignatureId(1)]);
        assert!(!tiers.eviction_deferred());
        assert_eq!(tiers.working_set_ids().len(), 2);
    }

    // ── reactivation ─────────────────────────────────────────────────────────

    #[test]
    fn eviction_reactivation_roundtrip() {
        let (mut tiers, _) = open_shared(3, 0);
        tiers.admit(&snap(&[1, 2])).unwrap();
        let before = tiers.signature(SignatureId(1)).cloned().unwrap();
        for i in 3..6 {
            tiers.admit(&snap(&[i])).unwrap();
        }
        assert!(!tiers.is_materialized(SignatureId(1)));

        let reloaded = tiers.reactivate(SignatureId(1)).unwrap();
        assert_eq!(reloaded[0], SignatureId(1));
        let after = tiers.signature(SignatureId(1)).unwrap();
        assert_eq!(after.words, before.words);
        assert_eq!(after.neighbors.keys().collect::<Vec<_>>(), vec![&SignatureId(2)]);
        assert_eq!(after.residency, Residency::Resident);
        assert!(!tiers.stubs().contains_key(&SignatureId(1)));
        assert!(!tiers.persisted_ids().contains(&SignatureId(1)));
    }

    #[test]
    fn reactivate_resident_is_noop() {
        let (mut tiers, _) = open_shared(3, 0);
        tiers.admit(&snap(&[1])).unwrap();
        assert!(tiers.reactivate(SignatureId(1)).unwrap().is_empty());
        assert_eq!(tiers.stats().reactivations, 0);
    }

    #[test]
    fn reactivation_follows_neighbors_to_depth() {
        let (mut tiers, _) = open_shared(2, 0);
        for i in 0..6 {
            tiers.admit(&snap(&[i])).unwrap();
        }
        // 1..=4 persisted, 5 and 6 resident.
        let reloaded = tiers.reactivate(SignatureId(2)).unwrap();
        assert_eq!(reloaded, vec![SignatureId(2), SignatureId(1), SignatureId(3)]);
    }

    #[test]
    fn failed_load_leaves_signature_persisted() {
        let (mut tiers, store) = open_shared(1, 0);
        tiers.admit(&snap(&[1])).unwrap();
        tiers.admit(&snap(&[2])).unwrap();
        store.set_fail_loads(true);
        assert!(tiers.reactivate(SignatureId(1)).is_err());
        assert_eq!(tiers.residency(SignatureId(1)), Some(Residency::Persisted));

        store.set_fail_loads(false);
        assert!(!tiers.reactivate(SignatureId(1)).unwrap().is_empty());
    }

    #[test]
    fn stubs_answer_link_queries() {
        let (mut tiers, _) = open_shared(1, 0);
        for i in 0..3 {
            tiers.admit(&snap(&[i])).unwrap();
        }
        assert_eq!(
            tiers.links_of(SignatureId(2), LinkKind::Neighbor).unwrap(),
            BTreeSet::from([SignatureId(1), SignatureId(3)])
        );
        let traversal = tiers.neighbors_of(SignatureId(3));
        assert_eq!(traversal.reached, BTreeSet::from([SignatureId(2)]));
        assert_eq!(traversal.reactivated, vec![SignatureId(2)]);
    }

    // ── loop closure ─────────────────────────────────────────────────────────

    #[test]
    fn accept_fuses_and_records_links() {
        let (mut tiers, _) = open_shared(10, 0);
        tiers.admit(&snap(&[1, 2])).unwrap();
        tiers.admit(&snap(&[5])).unwrap();
        tiers.admit(&snap(&[6])).unwrap();
        tiers.admit(&snap(&[1, 3])).unwrap();

        tiers.accept(SignatureId(1), SignatureId(4)).unwrap();

        let one = tiers.signature(SignatureId(1)).unwrap();
        assert_eq!(one.weight, 1);
        assert!(one.loop_links.contains(&SignatureId(4)));
        // Inherits 4's neighbor (3), which is mirrored.
        assert!(one.neighbors.contains_key(&SignatureId(3)));
        assert!(tiers.signature(SignatureId(3)).unwrap().neighbors.contains_key(&SignatureId(1)));
        assert!(tiers.signature(SignatureId(4)).unwrap().child_links.contains(&SignatureId(1)));
        assert_eq!(tiers.dictionary().document_frequency(WordId(5)), 2);
        assert_references_consistent(&tiers);
    }

    #[test]
    fn accept_unknown_match_is_integrity_violation() {
        let (mut tiers, _) = open_shared(10, 0);
        tiers.admit(&snap(&[1])).unwrap();
        let err = tiers.accept(SignatureId(42), SignatureId(1)).unwrap_err();
        assert!(matches!(err, PlaceError::IntegrityViolation { .. }));
    }

    // ── vocabulary ───────────────────────────────────────────────────────────

    #[test]
    fn merge_words_rewrites_persisted_citations() {
        let (mut tiers, store) = open_shared(1, 0);
        // Word ids: 1 for descriptor 0, 2 for descriptor 10.
        tiers.admit(&snap(&[0])).unwrap();
        tiers.admit(&snap(&[1])).unwrap();
        tiers.admit(&snap(&[2])).unwrap();
        assert!(!tiers.is_materialized(SignatureId(2)));

        let pruned = tiers
            .merge_words(&BTreeMap::from([(WordId(2), WordId(1))]))
            .unwrap();
        assert_eq!(pruned, vec![WordId(2)]);
        assert!(tiers.dictionary().get(WordId(2)).is_none());
        assert_eq!(
            tiers.dictionary().get(WordId(1)).unwrap().references,
            BTreeSet::from([SignatureId(1), SignatureId(2)])
        );

        let persisted = store.load(SignatureId(2)).unwrap().unwrap();
        assert_eq!(persisted.word_ids(), BTreeSet::from([WordId(1)]));
    }

    #[test]
    fn merge_words_rejects_unknown_words() {
        let (mut tiers, _) = open_shared(3, 0);
        tiers.admit(&snap(&[0])).unwrap();
        let err = tiers
            .merge_words(&BTreeMap::from([(WordId(9), WordId(1))]))
            .unwrap_err();
        assert!(matches!(err, PlaceError::IntegrityViolation { .. }));
    }

    #[test]
    fn consolidate_merges_close_words() {
        let (mut tiers, _) = open_shared(10, 0);
        tiers
            .admit(&Snapshot::new(vec![feature(0.0), feature(0.6)], SensorPayload::default()))
            .unwrap();
        assert_eq!(tiers.dictionary().len(), 2);
        let pruned = tiers.consolidate(1.0).unwrap();
        assert_eq!(pruned, vec![WordId(2)]);
        assert_eq!(tiers.dictionary().len(), 1);
        assert_references_consistent(&tiers);
    }

    // ── lifecycle ────────────────────────────────────────────────────────────

    #[test]
    fn restart_resumes_ids_and_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteStore::open(path).unwrap();
            let mut tiers = MemoryTiers::open(Box::new(store), config(2, 1)).unwrap();
            for i in 0..5 {
                tiers.admit(&snap(&[i])).unwrap();
            }
            tiers.flush().unwrap();
        }
        let store = SqliteStore::open(path).unwrap();
        let mut tiers = MemoryTiers::open(Box::new(store), config(2, 1)).unwrap();
        assert_eq!(tiers.dictionary().len(), 5);
        assert_eq!(tiers.working_set_ids().len(), 2);
        assert!(tiers.persisted_ids().len() + tiers.working_set_ids().len() == 5);

        let outcome = tiers.admit(&snap(&[9])).unwrap();
        assert_eq!(outcome.id, SignatureId(6));
        assert_eq!(tiers.dictionary().last_word_id(), WordId(6));
    }

    #[test]
    fn reset_clears_tiers_but_keeps_counting() {
        let (mut tiers, _) = open_shared(2, 0);
        for i in 0..4 {
            tiers.admit(&snap(&[i])).unwrap();
        }
        tiers.reset(":memory:").unwrap();
        assert_eq!(tiers.population(), 0);
        assert!(tiers.dictionary().is_empty());
        assert!(tiers.stubs().is_empty());

        let outcome = tiers.admit(&snap(&[0])).unwrap();
        assert_eq!(outcome.id, SignatureId(5));
        assert_eq!(tiers.dictionary().last_word_id(), WordId(5));
        assert!(tiers.signature(SignatureId(5)).unwrap().neighbors.is_empty());
    }

    #[test]
    fn weight_of_falls_back_to_store() {
        let (mut tiers, _) = open_shared(1, 0);
        tiers.admit(&snap(&[1])).unwrap();
        tiers.admit(&snap(&[2])).unwrap();
        tiers.admit(&snap(&[3])).unwrap();
        assert_eq!(tiers.weights().len(), 1);
        assert_eq!(tiers.weight_of(SignatureId(1)).unwrap(), Some(0));
        assert_eq!(tiers.weight_of(SignatureId(99)).unwrap(), None);
    }

    #[test]
    fn flush_persists_resident_signatures() {
        let (mut tiers, store) = open_shared(5, 2);
        for i in 0..3 {
            tiers.admit(&snap(&[i])).unwrap();
        }
        assert!(store.is_empty());
        tiers.flush().unwrap();
        assert_eq!(store.len(), 3);
        assert!(tiers.dictionary().all_unsaved().is_empty());
    }
}
