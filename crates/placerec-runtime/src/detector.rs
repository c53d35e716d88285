//! [`LoopDetector`] – the per-snapshot cycle.
//!
//! Each call to [`LoopDetector::process`] runs one serialized cycle:
//!
//! 1. **Admit** – quantize the snapshot and admit it into [`MemoryTiers`].
//! 2. **Hypothesize** – update the Bayes posterior against the working set,
//!    bounded by the cycle budget.
//! 3. **Accept** – fuse the current signature into an accepted match.
//! 4. **Retrieve** – reactivate the neighborhood of the best hypothesis when
//!    its mass warrants it and time is left.
//! 5. **Consolidate** – periodically merge near-duplicate words.
//! 6. **Rebalance** – evict down to capacity, protecting what this cycle
//!    touched.
//! 7. **Verify** – check the memory invariants; a violation is fatal.
//!
//! A missed deadline is reported on the cycle but never aborts the run.
//!
//! # Example
//!
//! ```rust
//! use placerec_memory::InMemoryStore;
//! use placerec_runtime::detector::LoopDetector;
//! use placerec_runtime::params::Parameters;
//! use placerec_types::{Feature, Keypoint, SensorPayload, Snapshot};
//!
//! let params = Parameters::default();
//! let mut detector = LoopDetector::new(&params, Box::new(InMemoryStore::new())).unwrap();
//! let snapshot = Snapshot::new(
//!     vec![Feature { descriptor: vec![0.0, 1.0], keypoint: Keypoint::default() }],
//!     SensorPayload::default(),
//! );
//! let report = detector.process(&snapshot).unwrap();
//! assert_eq!(report.id.0, 1);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use placerec_kernel::{CycleBudget, IntegrityVerifier, StopFlag};
use placerec_memory::{MemoryTiers, PersistentStore, SqliteStore};
use placerec_types::{PlaceError, SignatureId, Snapshot};
use tracing::{debug, error, field, info, info_span, warn};

use crate::bayes::{Hypothesis, HypothesisEngine, Posterior, SimilarityScorer};
use crate::params::Parameters;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Cycle-level settings for [`LoopDetector`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Per-cycle budget in milliseconds; `0` means unlimited.
    pub time_threshold_ms: f64,
    /// Minimum posterior mass before the best hypothesis' neighborhood is
    /// reactivated.
    pub reactivation_threshold: f64,
    /// Cycles between vocabulary consolidations; `0` disables.
    pub consolidate_period: u64,
    /// Word merge distance; `0` disables consolidation.
    pub merge_distance: f32,
    pub verify_integrity: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            time_threshold_ms: 0.0,
            reactivation_threshold: 0.2,
            consolidate_period: 0,
            merge_distance: 0.0,
            verify_integrity: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// 1-based cycle counter since the detector was built.
    pub cycle: u64,
    /// Id of the signature admitted this cycle.
    pub id: SignatureId,
    pub hypothesis: Hypothesis,
    /// Match the current signature was fused into.
    pub loop_closure: Option<SignatureId>,
    pub evicted: Vec<SignatureId>,
    pub reactivated: Vec<SignatureId>,
    pub pruned_words: usize,
    pub timing_violation: Option<PlaceError>,
    pub elapsed: Duration,
    pub working_set: usize,
    /// Weight of every working-set signature at the end of the cycle.
    pub weights: BTreeMap<SignatureId, u32>,
}

/// Totals over a [`LoopDetector::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub loop_closures: u64,
    pub timing_violations: u64,
    /// The stop flag ended the run before the input did.
    pub stopped: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// LoopDetector
// ─────────────────────────────────────────────────────────────────────────────

pub struct LoopDetector {
    config: DetectorConfig,
    tiers: MemoryTiers,
    engine: HypothesisEngine,
    verifier: IntegrityVerifier,
    stop: StopFlag,
    cycles: u64,
    loop_closures: u64,
    timing_violations: u64,
}

impl LoopDetector {
    /// Build a detector over `store` with the default similarity scorer.
    ///
    /// # Errors
    ///
    /// [`PlaceError::Configuration`] for an unusable tiering setup and
    /// [`PlaceError::Storage`] when the store cannot be bootstrapped.
    pub fn new(params: &Parameters, store: Box<dyn PersistentStore>) -> Result<Self, PlaceError> {
        let engine = HypothesisEngine::new(params.bayes_config());
        Self::assemble(params, store, engine)
    }

    pub fn with_scorer(
        params: &Parameters,
        store: Box<dyn PersistentStore>,
        scorer: Box<dyn SimilarityScorer>,
    ) -> Result<Self, PlaceError> {
        let engine = HypothesisEngine::with_scorer(params.bayes_config(), scorer);
        Self::assemble(params, store, engine)
    }

    /// Open (or create) a SQLite database at `location`, tuned by the
    /// `DbSqlite3/*` parameters. `":memory:"` keeps everything in RAM.
    pub fn open(params: &Parameters, location: &str) -> Result<Self, PlaceError> {
        info!(location, "opening database");
        let store = SqliteStore::open_with(location, params.sqlite.clone())?;
        Self::new(params, Box::new(store))
    }

    fn assemble(
        params: &Parameters,
        store: Box<dyn PersistentStore>,
        engine: HypothesisEngine,
    ) -> Result<Self, PlaceError> {
        let tiers = MemoryTiers::open(store, params.tiering_config())?;
        info!(
            persisted = tiers.persisted_ids().len(),
            working_set = tiers.working_set_ids().len(),
            words = tiers.dictionary().len(),
            "loop detector ready"
        );
        Ok(Self {
            config: params.detector_config(),
            tiers,
            engine,
            verifier: IntegrityVerifier::with_default_rules(),
            stop: StopFlag::new(),
            cycles: 0,
            loop_closures: 0,
            timing_violations: 0,
        })
    }

    // ------------------------------------------------------------------ cycle

    /// Run one full cycle for `snapshot`.
    ///
    /// # Errors
    ///
    /// Only fatal errors are returned: an [`PlaceError::IntegrityViolation`]
    /// or an unrecoverable failure while admitting. Storage hiccups and
    /// timing violations are logged and reported on the [`CycleReport`].
    pub fn process(&mut self, snapshot: &Snapshot) -> Result<CycleReport, PlaceError> {
        let budget = CycleBudget::from_millis(self.config.time_threshold_ms);
        self.cycles += 1;
        let span = info_span!(
            "cycle",
            cycle = self.cycles,
            signature = field::Empty,
            loop_closure = field::Empty,
            reactivated = field::Empty,
        );
        let _entered = span.enter();

        let admitted = self.tiers.admit(snapshot)?;
        let current = admitted.id;
        span.record("signature", current.0);
        let mut evicted = admitted.evicted;
        let mut reactivated = admitted.reactivated;

        let hypothesis = self.engine.update(&self.tiers, current, &budget);

        let loop_closure = match hypothesis.accepted {
            Some(matched) => {
                reactivated.extend(self.tiers.accept(matched, current)?);
                self.loop_closures += 1;
                Some(matched)
            }
            None => None,
        };

        if let Some((best, mass)) = hypothesis.best {
            if mass >= self.config.reactivation_threshold && !budget.expired() {
                let near = self.tiers.neighbors_of(best);
                let linked = self.tiers.loop_candidates_of(best);
                reactivated.extend(near.reactivated);
                reactivated.extend(linked.reactivated);
            }
        }

        let pruned_words = self.maybe_consolidate()?;

        let mut protect: BTreeSet<SignatureId> = reactivated.iter().copied().collect();
        protect.insert(current);
        protect.extend(loop_closure);
        evicted.extend(self.tiers.rebalance(&protect));

        if self.config.verify_integrity {
            if let Err(e) = self.verifier.verify(&self.tiers) {
                error!(
                    error = %e,
                    cycle = self.cycles,
                    signature = %current,
                    working_set = ?self.tiers.working_set_ids(),
                    buffered = ?self.tiers.buffered_ids().collect::<Vec<_>>(),
                    persisted = self.tiers.persisted_ids().len(),
                    "memory integrity violated"
                );
                return Err(e);
            }
        }

        let timing_violation = budget.violation();
        if let Some(violation) = &timing_violation {
            self.timing_violations += 1;
            metrics::counter!("placerec_timing_violations_total").increment(1);
            warn!(
                cycle = self.cycles,
                scored = hypothesis.scored,
                candidates = hypothesis.candidates,
                "{violation}"
            );
        }

        if let Some(matched) = loop_closure {
            span.record("loop_closure", matched.0);
        }
        span.record("reactivated", reactivated.len() as u64);

        let report = CycleReport {
            cycle: self.cycles,
            id: current,
            loop_closure,
            evicted,
            reactivated,
            pruned_words,
            timing_violation,
            elapsed: budget.elapsed(),
            working_set: self.tiers.working_set_ids().len(),
            weights: self.tiers.weights(),
            hypothesis,
        };
        debug!(
            cycle = report.cycle,
            signature = %report.id,
            loop_closure = ?report.loop_closure,
            evicted = report.evicted.len(),
            reactivated = report.reactivated.len(),
            elapsed_ms = report.elapsed.as_secs_f64() * 1000.0,
            "cycle complete"
        );
        Ok(report)
    }

    /// Merge near-duplicate words every `consolidate_period` cycles.
    fn maybe_consolidate(&mut self) -> Result<usize, PlaceError> {
        let period = self.config.consolidate_period;
        if period == 0 || self.config.merge_distance <= 0.0 || self.cycles % period != 0 {
            return Ok(0);
        }
        match self.tiers.consolidate(self.config.merge_distance) {
            Ok(pruned) => Ok(pruned.len()),
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, "consolidation skipped");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------ run

    /// Feed `snapshots` through [`process`](Self::process) until the input
    /// ends, the stop flag is raised, or a fatal error occurs.
    ///
    /// `on_cycle` sees every report as it is produced.
    pub fn run<I, F>(&mut self, snapshots: I, mut on_cycle: F) -> Result<RunSummary, PlaceError>
    where
        I: IntoIterator<Item = Snapshot>,
        F: FnMut(&CycleReport),
    {
        let mut summary = RunSummary::default();
        for snapshot in snapshots {
            if self.stop.is_stopped() {
                summary.stopped = true;
                break;
            }
            let report = self.process(&snapshot)?;
            summary.cycles += 1;
            summary.loop_closures += u64::from(report.loop_closure.is_some());
            summary.timing_violations += u64::from(report.timing_violation.is_some());
            on_cycle(&report);
            if self.stop.is_stopped() {
                summary.stopped = true;
                break;
            }
        }
        if summary.stopped {
            info!(cycles = summary.cycles, "stop requested");
        }
        Ok(summary)
    }

    /// Persist every in-RAM signature and unsaved word.
    pub fn flush(&mut self) -> Result<(), PlaceError> {
        self.tiers.flush().map_err(PlaceError::from)
    }

    /// Flush, then disconnect the store. In `DbSqlite3/InMemory` mode this
    /// is when the database file is written.
    pub fn close(&mut self) -> Result<(), PlaceError> {
        self.flush()?;
        self.tiers.store().disconnect()?;
        info!(cycles = self.cycles, "loop detector closed");
        Ok(())
    }

    /// Forget all memory and hypotheses and reconnect to `location`.
    pub fn reset(&mut self, location: &str) -> Result<(), PlaceError> {
        self.tiers.reset(location)?;
        self.engine.reset();
        Ok(())
    }

    // ------------------------------------------------------------------ accessors

    /// Handle that stops [`run`](Self::run) between cycles.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn tiers(&self) -> &MemoryTiers {
        &self.tiers
    }

    pub fn posterior(&self) -> &Posterior {
        self.engine.posterior()
    }

    pub fn verifier_mut(&mut self) -> &mut IntegrityVerifier {
        &mut self.verifier
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn loop_closures(&self) -> u64 {
        self.loop_closures
    }

    pub fn timing_violations(&self) -> u64 {
        self.timing_violations
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
