use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one visited place. Allocated monotonically and never reused.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SignatureId(pub u64);

impl fmt::Display for SignatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one visual word in the vocabulary.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WordId(pub u64);

impl fmt::Display for WordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Image-plane position of the keypoint a word was observed at.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One extracted feature: the raw descriptor and where it was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub descriptor: Vec<f32>,
    #[serde(default)]
    pub keypoint: Keypoint,
}

/// Opaque sensor data carried along with a place.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorPayload {
    /// Encoded image bytes; never interpreted by the core.
    #[serde(default)]
    pub image: Vec<u8>,
    /// Actuator/action vectors issued while this snapshot was captured.
    #[serde(default)]
    pub actions: Vec<Vec<f32>>,
}

/// A location snapshot as delivered by the acquisition side, with
/// descriptors already extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub features: Vec<Feature>,
    #[serde(default)]
    pub payload: SensorPayload,
}

impl Snapshot {
    /// Build a snapshot stamped with the current UTC time.
    pub fn new(features: Vec<Feature>, payload: SensorPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            features,
            payload,
        }
    }
}

/// Which memory tier currently holds a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Residency {
    /// In the short-term buffer; not yet compared against.
    Buffered,
    /// Fully materialized in the working set.
    Resident,
    /// Evicted to the persistent store.
    Persisted,
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Residency::Buffered => write!(f, "buffered"),
            Residency::Resident => write!(f, "resident"),
            Residency::Persisted => write!(f, "persisted"),
        }
    }
}

/// Workspace-wide error taxonomy.
///
/// `Storage` and `TimingViolation` are recoverable and normally absorbed
/// where they occur; `Configuration` and `IntegrityViolation` terminate the
/// run.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlaceError {
    #[error("Configuration Error on {key}: {details}")]
    Configuration { key: String, details: String },

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Timing Violation: cycle took {elapsed_ms:.3} ms, budget {budget_ms:.3} ms")]
    TimingViolation { elapsed_ms: f64, budget_ms: f64 },

    #[error("Integrity Violation ({invariant}): {details}")]
    IntegrityViolation { invariant: String, details: String },
}

impl PlaceError {
    /// Shorthand for a [`PlaceError::Configuration`].
    pub fn config(key: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            details: details.into(),
        }
    }

    /// Shorthand for a [`PlaceError::IntegrityViolation`].
    pub fn integrity(invariant: impl Into<String>, details: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            invariant: invariant.into(),
            details: details.into(),
        }
    }

    /// `true` for errors that must terminate the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlaceError::Configuration { .. } | PlaceError::IntegrityViolation { .. }
        )
    }
}
