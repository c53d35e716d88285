//! [`IntegrityVerifier`] – memory invariant rule engine.
//!
//! Run at quiescent points (the end of a cycle) through
//! [`IntegrityVerifier::verify`]. Every registered [`InvariantRule`] is
//! evaluated in order; the first violation returns a
//! [`PlaceError::IntegrityViolation`] and the run is expected to stop.
//!
//! Built-in rules:
//! - [`WorkingSetBoundRule`] – the working set is within capacity, unless a
//!   storage failure deferred the last eviction.
//! - [`UniqueResidencyRule`] – every id is in exactly one tier and its
//!   residency tag agrees.
//! - [`NeighborSymmetryRule`] – every neighbor link has its reverse.
//! - [`ReferenceConsistencyRule`] – word reference sets match the
//!   signatures citing them.

use std::collections::BTreeSet;

use placerec_memory::store::PersistentStore;
use placerec_memory::tiering::{LinkKind, MemoryTiers};
use placerec_types::{PlaceError, Residency, SignatureId};
use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single invariant the memory tiers must satisfy at rest.
pub trait InvariantRule: Send + Sync {
    /// Name reported in the violation.
    fn name(&self) -> &str;

    fn check(&self, tiers: &MemoryTiers) -> Result<(), PlaceError>;
}

// ────────────────────────────────────────────────────────────────────────────
// IntegrityVerifier
// ────────────────────────────────────────────────────────────────────────────

/// Rule engine over [`MemoryTiers`].
///
/// # Example
///
/// ```
/// use placerec_kernel::integrity::IntegrityVerifier;
/// use placerec_memory::store::InMemoryStore;
/// use placerec_memory::tiering::{MemoryTiers, TieringConfig};
///
/// let tiers = MemoryTiers::open(Box::new(InMemoryStore::new()), TieringConfig::default()).unwrap();
/// let verifier = IntegrityVerifier::with_default_rules();
/// assert!(verifier.verify(&tiers).is_ok());
/// ```
#[derive(Default)]
pub struct IntegrityVerifier {
    rules: Vec<Box<dyn InvariantRule>>,
}

impl IntegrityVerifier {
    /// Create an empty verifier with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in rules. Persisted citations and persisted neighbor
    /// links are not checked; they cost a store query per id.
    pub fn with_default_rules() -> Self {
        let mut verifier = Self::new();
        verifier.add_rule(Box::new(WorkingSetBoundRule));
        verifier.add_rule(Box::new(UniqueResidencyRule));
        verifier.add_rule(Box::new(NeighborSymmetryRule { check_store: false }));
        verifier.add_rule(Box::new(ReferenceConsistencyRule {
            include_persisted: false,
        }));
        verifier
    }

    /// Register a new rule. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn InvariantRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Returns the first violation, or `Ok(())` when every rule passes.
    pub fn verify(&self, tiers: &MemoryTiers) -> Result<(), PlaceError> {
        for rule in &self.rules {
            rule.check(tiers)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// The working set never exceeds its capacity at rest.
pub struct WorkingSetBoundRule;

impl InvariantRule for WorkingSetBoundRule {
    fn name(&self) -> &str {
        "working_set_bound"
    }

    fn check(&self, tiers: &MemoryTiers) -> Result<(), PlaceError> {
        let size = tiers.working_set_ids().len();
        let cap = tiers.config().working_set_capacity;
        if size > cap && !tiers.eviction_deferred() {
            return Err(PlaceError::integrity(
                self.name(),
                format!("working set holds {size} signatures, capacity {cap}"),
            ));
        }
        Ok(())
    }
}

/// Buffered, resident and persisted ids are disjoint, every materialized
/// signature belongs to the buffer or the working set, and stubs exist only
/// for persisted ids.
pub struct UniqueResidencyRule;

impl InvariantRule for UniqueResidencyRule {
    fn name(&self) -> &str {
        "unique_residency"
    }

    fn check(&self, tiers: &MemoryTiers) -> Result<(), PlaceError> {
        let violation = |details: String| Err(PlaceError::integrity(self.name(), details));

        let buffered: BTreeSet<SignatureId> = tiers.buffered_ids().collect();
        let resident = tiers.working_set_ids();
        let persisted = tiers.persisted_ids();

        if let Some(id) = buffered.intersection(resident).next() {
            return violation(format!("signature {id} is both buffered and resident"));
        }
        if let Some(id) = buffered.union(resident).find(|id| persisted.contains(id)) {
            return violation(format!("signature {id} is both in memory and persisted"));
        }
        for sig in tiers.signatures() {
            let expected = if buffered.contains(&sig.id) {
                Residency::Buffered
            } else if resident.contains(&sig.id) {
                Residency::Resident
            } else {
                return violation(format!("signature {} is in memory but in no tier", sig.id));
            };
            if sig.residency != expected {
                return violation(format!(
                    "signature {} is tagged {} but held as {expected}",
                    sig.id, sig.residency
                ));
            }
        }
        if let Some(id) = tiers.stubs().keys().find(|id| !persisted.contains(id)) {
            return violation(format!("stub kept for non-persisted signature {id}"));
        }
        Ok(())
    }
}

/// Every neighbor link has its reverse.
///
/// Links from a signature in RAM are checked against the other side in
/// RAM, or its stub. With `check_store` set, links into persisted
/// signatures without a stub (e.g. after a restart) are checked against the
/// store; a store failure skips that link.
pub struct NeighborSymmetryRule {
    pub check_store: bool,
}

impl InvariantRule for NeighborSymmetryRule {
    fn name(&self) -> &str {
        "neighbor_symmetry"
    }

    fn check(&self, tiers: &MemoryTiers) -> Result<(), PlaceError> {
        for sig in tiers.signatures() {
            for &other in sig.neighbors.keys() {
                let reverse = if tiers.is_materialized(other) || tiers.stubs().contains_key(&other)
                {
                    tiers.links_of(other, LinkKind::Neighbor).ok()
                } else if self.check_store {
                    match tiers.store().neighbor_ids(other) {
                        Ok(ids) => Some(ids),
                        Err(e) => {
                            warn!(signature = %other, error = %e, "symmetry check skipped");
                            None
                        }
                    }
                } else {
                    None
                };
                let one_sided = reverse.is_some_and(|ids| !ids.contains(&sig.id));
                if one_sided {
                    return Err(PlaceError::integrity(
                        self.name(),
                        format!("{} -> {other} has no reverse link", sig.id),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Each word's reference set equals the set of live signatures citing it.
///
/// Signatures in RAM are always checked, and every referenced id must be
/// known to some tier. With `include_persisted` set, persisted signatures
/// are loaded from the store and checked as well.
pub struct ReferenceConsistencyRule {
    pub include_persisted: bool,
}

impl InvariantRule for ReferenceConsistencyRule {
    fn name(&self) -> &str {
        "reference_consistency"
    }

    fn check(&self, tiers: &MemoryTiers) -> Result<(), PlaceError> {
        let dictionary = tiers.dictionary();

        for sig in tiers.signatures() {
            for word in sig.words.keys() {
                let cited = dictionary
                    .get(*word)
                    .is_some_and(|w| w.references.contains(&sig.id));
                if !cited {
                    return Err(PlaceError::integrity(
                        self.name(),
                        format!("signature {} cites word {word} but is not referenced", sig.id),
                    ));
                }
            }
        }

        for word in dictionary.iter() {
            for &id in &word.references {
                let holds = match tiers.signature(id) {
                    Some(sig) => sig.words.contains_key(&word.id),
                    None if tiers.persisted_ids().contains(&id) => {
                        if !self.include_persisted {
                            continue;
                        }
                        match tiers.store().load(id) {
                            Ok(Some(sig)) => sig.words.contains_key(&word.id),
                            Ok(None) => false,
                            Err(e) => {
                                warn!(signature = %id, error = %e, "reference check skipped");
                                continue;
                            }
                        }
                    }
                    None => false,
                };
                if !holds {
                    return Err(PlaceError::integrity(
                        self.name(),
                        format!("word {} references {id}, which does not cite it", word.id),
                    ));
                }
            }
        }
        Ok(())
    }
}
