//! `placerec-kernel` – Invariants & Cycle Control
//!
//! Does not recognize places; it checks that memory stays consistent and
//! keeps every cycle inside its time budget.
//!
//! # Modules
//!
//! - [`integrity`] – [`IntegrityVerifier`][integrity::IntegrityVerifier]:
//!   a rule engine that checks the tiering invariants (working-set bound,
//!   unique residency, neighbor symmetry, word reference consistency) at
//!   quiescent points and raises
//!   [`IntegrityViolation`][placerec_types::PlaceError::IntegrityViolation].
//! - [`budget`] – [`CycleBudget`][budget::CycleBudget]: the per-cycle
//!   wall-clock deadline consulted by the hypothesis engine.
//! - [`stop`] – [`StopFlag`][stop::StopFlag]: cooperative cancellation
//!   token checked at cycle boundaries.

pub mod budget;
pub mod integrity;
pub mod stop;

pub use budget::CycleBudget;
pub use integrity::{
    IntegrityVerifier, InvariantRule, NeighborSymmetryRule, ReferenceConsistencyRule,
    UniqueResidencyRule, WorkingSetBoundRule,
};
pub use stop::StopFlag;
