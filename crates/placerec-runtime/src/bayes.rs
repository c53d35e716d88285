//! Recursive Bayes filter over loop-closure hypotheses.
//!
//! The posterior covers the working set plus a "no match" state. Every
//! cycle runs prediction (decay towards graph neighbors, then mixing with
//! a uniform prior), observation (similarity of the current signature to
//! each candidate, scored through a [`SimilarityScorer`]) and
//! normalization. Candidates left with negligible mass are absorbed into
//! the no-match state.
//!
//! Observation polls the [`CycleBudget`]: once it expires, the remaining
//! candidates get the no-match likelihood, so they carry no evidence either
//! way and the posterior stays a proper distribution.

use std::collections::{BTreeMap, BTreeSet};

use placerec_kernel::CycleBudget;
use placerec_memory::{MemoryTiers, Signature, WordDictionary};
use placerec_perception::{inverse_document_frequency, tfidf_cosine};
use placerec_types::SignatureId;
use tracing::debug;

/// Filter tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BayesConfig {
    /// Share of an id's prior mass spread to its candidate neighbors.
    pub neighbor_spread: f64,
    /// Weight of the uniform prior mixed into the prediction.
    pub prediction_mix: f64,
    /// Likelihood sharpness `k` in `exp(k * s)`.
    pub sharpness: f64,
    /// Similarity the no-match state is scored with.
    pub no_match_similarity: f64,
    pub loop_threshold: f64,
    pub loop_margin: f64,
    /// Candidates below this mass are absorbed into no-match.
    pub prune_mass: f64,
}

impl Default for BayesConfig {
    fn default() -> Self {
        Self {
            neighbor_spread: 0.2,
            prediction_mix: 0.5,
            sharpness: 12.0,
            no_match_similarity: 0.35,
            loop_threshold: 0.5,
            loop_margin: 0.1,
            prune_mass: 1e-6,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scoring
// ─────────────────────────────────────────────────────────────────────────────

/// Similarity of the current signature to one candidate, in `[0, 1]`.
pub trait SimilarityScorer: Send + Sync {
    fn score(
        &self,
        current: &Signature,
        candidate: &Signature,
        dictionary: &WordDictionary,
        population: usize,
    ) -> f32;
}

/// IDF-weighted cosine of the two word histograms.
#[derive(Debug, Clone, Copy, Default)]
pub struct TfIdfScorer;

impl SimilarityScorer for TfIdfScorer {
    fn score(
        &self,
        current: &Signature,
        candidate: &Signature,
        dictionary: &WordDictionary,
        population: usize,
    ) -> f32 {
        tfidf_cosine(&current.histogram(), &candidate.histogram(), |word| {
            inverse_document_frequency(dictionary.document_frequency(word), population)
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Posterior
// ─────────────────────────────────────────────────────────────────────────────

/// Probability mass per candidate plus the no-match state.
#[derive(Debug, Clone, PartialEq)]
pub struct Posterior {
    no_match: f64,
    masses: BTreeMap<SignatureId, f64>,
}

impl Default for Posterior {
    fn default() -> Self {
        Self {
            no_match: 1.0,
            masses: BTreeMap::new(),
        }
    }
}

impl Posterior {
    pub fn no_match(&self) -> f64 {
        self.no_match
    }

    pub fn mass(&self, id: SignatureId) -> f64 {
        self.masses.get(&id).copied().unwrap_or(0.0)
    }

    pub fn masses(&self) -> &BTreeMap<SignatureId, f64> {
        &self.masses
    }

    /// Sum over every state, no-match included.
    pub fn total(&self) -> f64 {
        self.no_match + self.masses.values().sum::<f64>()
    }

    /// Candidate with the highest mass; ties go to the older id.
    pub fn best(&self) -> Option<(SignatureId, f64)> {
        self.masses
            .iter()
            .fold(None, |best: Option<(SignatureId, f64)>, (&id, &mass)| match best {
                Some((_, top)) if top >= mass => best,
                _ => Some((id, mass)),
            })
    }

    fn normalize(&mut self) {
        let total = self.total();
        if total.is_finite() && total > 0.0 {
            self.no_match /= total;
            for mass in self.masses.values_mut() {
                *mass /= total;
            }
        } else {
            let share = 1.0 / (self.masses.len() + 1) as f64;
            self.no_match = share;
            for mass in self.masses.values_mut() {
                *mass = share;
            }
        }
    }
}

/// Outcome of one filter update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hypothesis {
    /// Highest-mass candidate after the update.
    pub best: Option<(SignatureId, f64)>,
    /// `best`, if it passed the acceptance rule.
    pub accepted: Option<SignatureId>,
    pub no_match: f64,
    pub candidates: usize,
    pub scored: usize,
    /// Observation stopped early on the cycle budget.
    pub timed_out: bool,
    pub similarities: BTreeMap<SignatureId, f32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

pub struct HypothesisEngine {
    config: BayesConfig,
    scorer: Box<dyn SimilarityScorer>,
    posterior: Posterior,
}

impl HypothesisEngine {
    pub fn new(config: BayesConfig) -> Self {
        Self::with_scorer(config, Box::new(TfIdfScorer))
    }

    pub fn with_scorer(config: BayesConfig, scorer: Box<dyn SimilarityScorer>) -> Self {
        Self {
            config,
            scorer,
            posterior: Posterior::default(),
        }
    }

    pub fn config(&self) -> &BayesConfig {
        &self.config
    }

    pub fn posterior(&self) -> &Posterior {
        &self.posterior
    }

    /// Forget every hypothesis.
    pub fn reset(&mut self) {
        self.posterior = Posterior::default();
    }

    /// Run one predict/observe/normalize step for `current` against the
    /// working set.
    pub fn update(
        &mut self,
        tiers: &MemoryTiers,
        current: SignatureId,
        budget: &CycleBudget,
    ) -> Hypothesis {
        let candidates: BTreeSet<SignatureId> = tiers
            .working_set_ids()
            .iter()
            .copied()
            .filter(|id| *id != current)
            .collect();

        let mut hypothesis = Hypothesis {
            candidates: candidates.len(),
            ..Hypothesis::default()
        };
        if candidates.is_empty() {
            self.posterior = Posterior::default();
            hypothesis.no_match = 1.0;
            return hypothesis;
        }

        let mut posterior = self.predict(tiers, &candidates);

        // Observation
        let Some(current_sig) = tiers.signature(current) else {
            // Nothing to compare against; keep the prediction.
            posterior.normalize();
            return self.conclude(posterior, hypothesis);
        };
        let population = tiers.population();
        let k = self.config.sharpness;
        let tau = self.config.no_match_similarity;
        for id in &candidates {
            if budget.expired() {
                hypothesis.timed_out = true;
                break;
            }
            let Some(candidate) = tiers.signature(*id) else {
                continue;
            };
            let s = self
                .scorer
                .score(current_sig, candidate, tiers.dictionary(), population);
            hypothesis.similarities.insert(*id, s);
            hypothesis.scored += 1;
        }

        // Likelihoods are shifted by the highest similarity to stay in range.
        let top = hypothesis
            .similarities
            .values()
            .map(|s| f64::from(*s))
            .fold(tau, f64::max);
        let likelihood = |s: f64| (k * (s - top)).exp();
        let no_evidence = likelihood(tau);

        posterior.no_match *= no_evidence;
        for (id, mass) in posterior.masses.iter_mut() {
            *mass *= hypothesis
                .similarities
                .get(id)
                .map_or(no_evidence, |s| likelihood(f64::from(*s)));
        }
        posterior.normalize();

        // Absorption
        let floor = self.config.prune_mass;
        let absorbed: f64 = posterior.masses.values().filter(|m| **m < floor).sum();
        posterior.masses.retain(|_, mass| *mass >= floor);
        posterior.no_match += absorbed;
        posterior.normalize();

        self.conclude(posterior, hypothesis)
    }

    /// Decay the prior towards graph neighbors, then mix in a uniform prior.
    fn predict(&self, tiers: &MemoryTiers, candidates: &BTreeSet<SignatureId>) -> Posterior {
        let spread = self.config.neighbor_spread;
        let mut prior = Posterior {
            no_match: self.posterior.no_match,
            masses: candidates.iter().map(|id| (*id, 0.0)).collect(),
        };
        for (id, mass) in &self.posterior.masses {
            if !candidates.contains(id) {
                continue;
            }
            let neighbors: Vec<SignatureId> = tiers
                .signature(*id)
                .map(|sig| {
                    sig.neighbors
                        .keys()
                        .filter(|n| candidates.contains(n))
                        .copied()
                        .collect()
                })
                .unwrap_or_default();
            if neighbors.is_empty() {
                *prior.masses.entry(*id).or_insert(0.0) += mass;
                continue;
            }
            *prior.masses.entry(*id).or_insert(0.0) += mass * (1.0 - spread);
            let share = mass * spread / neighbors.len() as f64;
            for n in neighbors {
                *prior.masses.entry(n).or_insert(0.0) += share;
            }
        }
        prior.normalize();

        let mix = self.config.prediction_mix;
        let uniform = 1.0 / (candidates.len() + 1) as f64;
        prior.no_match = (1.0 - mix) * prior.no_match + mix * uniform;
        for mass in prior.masses.values_mut() {
            *mass = (1.0 - mix) * *mass + mix * uniform;
        }
        prior
    }

    fn conclude(&mut self, posterior: Posterior, mut hypothesis: Hypothesis) -> Hypothesis {
        hypothesis.best = posterior.best();
        hypothesis.no_match = posterior.no_match;
        hypothesis.accepted = hypothesis.best.and_then(|(id, mass)| {
            (mass > self.config.loop_threshold
                && mass - posterior.no_match >= self.config.loop_margin)
                .then_some(id)
        });
        debug!(
            candidates = hypothesis.candidates,
            scored = hypothesis.scored,
            best = ?hypothesis.best,
            no_match = hypothesis.no_match,
            "posterior updated"
        );
        self.posterior = posterior;
        hypothesis
    }
}
