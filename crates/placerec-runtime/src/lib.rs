//! `placerec-runtime` – the loop-closure detection cycle.
//!
//! # Modules
//!
//! - [`params`] – [`Parameters`][params::Parameters]: the named-parameter
//!   map resolved once at startup into typed component settings. Unknown
//!   names and malformed values are rejected before any snapshot is read.
//! - [`bayes`] – [`HypothesisEngine`][bayes::HypothesisEngine]: the
//!   recursive Bayes filter over working-set candidates plus a no-match
//!   state, with a pluggable [`SimilarityScorer`][bayes::SimilarityScorer].
//! - [`detector`] – [`LoopDetector`][detector::LoopDetector]: one
//!   serialized cycle per snapshot (admit, hypothesize, accept, retrieve,
//!   rebalance, verify) under a per-cycle time budget.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with an optional OTLP span exporter and an
//!   exit-level [`ExitTrigger`][telemetry::ExitTrigger].
//! - [`snapshots`] – JSON-lines snapshot reader for recorded datasets.

pub mod bayes;
pub mod detector;
pub mod params;
pub mod snapshots;
pub mod telemetry;

pub use bayes::{BayesConfig, Hypothesis, HypothesisEngine, Posterior, SimilarityScorer, TfIdfScorer};
pub use detector::{CycleReport, DetectorConfig, LoopDetector, RunSummary};
pub use params::{Parameters, ParametersMap};
pub use snapshots::{SnapshotError, read_snapshots};
pub use telemetry::{ExitTrigger, TelemetryGuard, init_tracing};

// The stop flag is part of the run-control surface.
pub use placerec_kernel::StopFlag;
