//! The record of one visited place.
//!
//! A [`Signature`] stores the words observed at a place (with the keypoint
//! each was seen at), its links to adjacent-in-time places, the loop/child
//! links recorded when a loop closure is confirmed, an evidence weight, and
//! an opaque sensor payload.
//!
//! All cross references are plain ids. Whether a referenced signature is in
//! RAM or only in the store is the tiering engine's concern.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use placerec_types::{Keypoint, Residency, SensorPayload, SignatureId, WordId};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Links
// ─────────────────────────────────────────────────────────────────────────────

/// Payload attached to a neighbor link: the actions issued between the two
/// places.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NeighborLink {
    pub actions: Vec<Vec<f32>>,
}

impl NeighborLink {
    pub fn new(actions: Vec<Vec<f32>>) -> Self {
        Self { actions }
    }
}

/// What is left of a signature in RAM after it is evicted: enough to keep
/// walking the graph without loading the payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignatureStub {
    pub id: SignatureId,
    pub neighbors: BTreeSet<SignatureId>,
    pub loop_links: BTreeSet<SignatureId>,
    pub child_links: BTreeSet<SignatureId>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Fusion policy
// ─────────────────────────────────────────────────────────────────────────────

/// What happens to the payload of a signature when a revisit is fused in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadPolicy {
    /// Keep the payload recorded on the first visit.
    #[default]
    Keep,
    /// Replace it with the most recent revisit's payload.
    Replace,
}

impl FromStr for PayloadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep" => Ok(PayloadPolicy::Keep),
            "replace" => Ok(PayloadPolicy::Replace),
            other => Err(format!("expected `keep` or `replace`, got `{other}`")),
        }
    }
}

/// What [`Signature::fuse`] added, so the caller can mirror it elsewhere
/// (word references, reverse neighbor links).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FuseOutcome {
    pub new_words: Vec<WordId>,
    pub new_neighbors: Vec<(SignatureId, NeighborLink)>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Signature
// ─────────────────────────────────────────────────────────────────────────────

/// One visited place.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub id: SignatureId,
    pub timestamp: DateTime<Utc>,
    /// Word id -> keypoints it was observed at (a multiset of words).
    pub words: BTreeMap<WordId, Vec<Keypoint>>,
    /// Evidence counter, incremented every time a revisit is fused in.
    pub weight: u32,
    pub neighbors: BTreeMap<SignatureId, NeighborLink>,
    /// Newer signatures that closed a loop on this one.
    pub loop_links: BTreeSet<SignatureId>,
    /// Older signatures this one closed a loop on.
    pub child_links: BTreeSet<SignatureId>,
    pub payload: SensorPayload,
    pub residency: Residency,
}

impl Signature {
    pub fn new(id: SignatureId, timestamp: DateTime<Utc>, payload: SensorPayload) -> Self {
        Self {
            id,
            timestamp,
            words: BTreeMap::new(),
            weight: 0,
            neighbors: BTreeMap::new(),
            loop_links: BTreeSet::new(),
            child_links: BTreeSet::new(),
            payload,
            residency: Residency::Buffered,
        }
    }

    /// Record one observation of `word` at `keypoint`.
    pub fn add_word(&mut self, word: WordId, keypoint: Keypoint) {
        self.words.entry(word).or_default().push(keypoint);
    }

    pub fn word_ids(&self) -> BTreeSet<WordId> {
        self.words.keys().copied().collect()
    }

    /// Word id -> number of keypoints citing it.
    pub fn histogram(&self) -> BTreeMap<WordId, usize> {
        self.words.iter().map(|(id, kps)| (*id, kps.len())).collect()
    }

    /// Add a neighbor link. Returns `false` if the link already existed or
    /// would point at this signature itself.
    pub fn link_neighbor(&mut self, neighbor: SignatureId, link: NeighborLink) -> bool {
        if neighbor == self.id || self.neighbors.contains_key(&neighbor) {
            return false;
        }
        self.neighbors.insert(neighbor, link);
        true
    }

    /// Re-point every keypoint of `retired` to `survivor`.
    pub fn replace_word(&mut self, retired: WordId, survivor: WordId) {
        if let Some(kps) = self.words.remove(&retired) {
            self.words.entry(survivor).or_default().extend(kps);
        }
    }

    /// Consolidate a revisit into this signature.
    ///
    /// The weight grows by the incoming weight (at least 1), words and
    /// neighbor links are unioned, and the payload follows `policy`. Words
    /// already known keep their original keypoints.
    pub fn fuse(&mut self, incoming: &Signature, policy: PayloadPolicy) -> FuseOutcome {
        let mut outcome = FuseOutcome::default();

        self.weight = self.weight.saturating_add(incoming.weight.max(1));

        for (word, kps) in &incoming.words {
            if !self.words.contains_key(word) {
                self.words.insert(*word, kps.clone());
                outcome.new_words.push(*word);
            }
        }

        for (neighbor, link) in &incoming.neighbors {
            if self.link_neighbor(*neighbor, link.clone()) {
                outcome.new_neighbors.push((*neighbor, link.clone()));
            }
        }

        if policy == PayloadPolicy::Replace {
            self.payload = incoming.payload.clone();
        }
        outcome
    }

    pub fn stub(&self) -> SignatureStub {
        SignatureStub {
            id: self.id,
            neighbors: self.neighbors.keys().copied().collect(),
            loop_links: self.loop_links.clone(),
            child_links: self.child_links.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(id: u64, words: &[u64]) -> Signature {
        let mut s = Signature::new(SignatureId(id), Utc::now(), SensorPayload::default());
        for &w in words {
            s.add_word(WordId(w), Keypoint::new(w as f32, 0.0));
        }
        s
    }

    // ── words ────────────────────────────────────────────────────────────────

    #[test]
    fn histogram_counts_repeated_words() {
        let s = sig(1, &[3, 3, 4]);
        let h = s.histogram();
        assert_eq!(h[&WordId(3)], 2);
        assert_eq!(h[&WordId(4)], 1);
        assert_eq!(s.word_ids().len(), 2);
    }

    #[test]
    fn replace_word_moves_keypoints() {
        let mut s = sig(1, &[3, 4]);
        s.replace_word(WordId(4), WordId(3));
        assert_eq!(s.words[&WordId(3)].len(), 2);
        assert!(!s.words.contains_key(&WordId(4)));
    }

    // ── links ────────────────────────────────────────────────────────────────

    #[test]
    fn link_neighbor_rejects_self_and_duplicates() {
        let mut s = sig(1, &[]);
        assert!(!s.link_neighbor(SignatureId(1), NeighborLink::default()));
        assert!(s.link_neighbor(SignatureId(2), NeighborLink::default()));
        assert!(!s.link_neighbor(SignatureId(2), NeighborLink::default()));
    }

    #[test]
    fn stub_keeps_only_links() {
        let mut s = sig(5, &[1, 2]);
        s.link_neighbor(SignatureId(4), NeighborLink::default());
        s.loop_links.insert(SignatureId(9));
        let stub = s.stub();
        assert_eq!(stub.id, SignatureId(5));
        assert_eq!(stub.neighbors, BTreeSet::from([SignatureId(4)]));
        assert_eq!(stub.loop_links, BTreeSet::from([SignatureId(9)]));
        assert!(stub.child_links.is_empty());
    }

    // ── fuse ─────────────────────────────────────────────────────────────────

    #[test]
    fn fuse_increments_weight_by_at_least_one() {
        let mut a = sig(1, &[1]);
        let b = sig(2, &[1]);
        a.fuse(&b, PayloadPolicy::Keep);
        assert_eq!(a.weight, 1);

        let mut c = sig(3, &[1]);
        c.weight = 4;
        a.fuse(&c, PayloadPolicy::Keep);
        assert_eq!(a.weight, 5);
    }

    #[test]
    fn fuse_unions_words_and_reports_new_ones() {
        let mut a = sig(1, &[1, 2]);
        let b = sig(2, &[2, 3]);
        let outcome = a.fuse(&b, PayloadPolicy::Keep);
        assert_eq!(outcome.new_words, vec![WordId(3)]);
        assert_eq!(a.word_ids(), BTreeSet::from([WordId(1), WordId(2), WordId(3)]));
        // Existing word keeps its own keypoints.
        assert_eq!(a.words[&WordId(2)].len(), 1);
    }

    #[test]
    fn fuse_unions_neighbors_without_self_link() {
        let mut a = sig(1, &[]);
        let mut b = sig(7, &[]);
        b.link_neighbor(SignatureId(6), NeighborLink::new(vec![vec![1.0]]));
        b.link_neighbor(SignatureId(1), NeighborLink::default());
        let outcome = a.fuse(&b, PayloadPolicy::Keep);
        assert_eq!(outcome.new_neighbors.len(), 1);
        assert_eq!(outcome.new_neighbors[0].0, SignatureId(6));
        assert!(!a.neighbors.contains_key(&SignatureId(1)));
    }

    #[test]
    fn fuse_payload_policy() {
        let mut a = sig(1, &[]);
        let mut b = sig(2, &[]);
        b.payload.image = vec![1, 2, 3];
        a.fuse(&b, PayloadPolicy::Keep);
        assert!(a.payload.image.is_empty());
        a.fuse(&b, PayloadPolicy::Replace);
        assert_eq!(a.payload.image, vec![1, 2, 3]);
    }

    #[test]
    fn payload_policy_parses_case_insensitively() {
        assert_eq!("Replace".parse::<PayloadPolicy>().unwrap(), PayloadPolicy::Replace);
        assert!("merge".parse::<PayloadPolicy>().is_err());
    }
}
