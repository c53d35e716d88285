//! Named-parameter resolution.
//!
//! Parameters arrive as a flat `name -> string` map (config file, command
//! line). [`Parameters::from_map`] overlays them on the defaults, rejects
//! unknown names and malformed values with
//! [`PlaceError::Configuration`], and produces the typed configuration of
//! every component.
//!
//! # Example
//!
//! ```
//! use placerec_runtime::params::{Parameters, ParametersMap};
//!
//! let mut map = ParametersMap::new();
//! map.insert("Mem/WorkingSetCapacity".into(), "10".into());
//! let params = Parameters::from_map(&map).unwrap();
//! assert_eq!(params.working_set_capacity, 10);
//!
//! map.insert("Mem/Unknown".into(), "1".into());
//! assert!(Parameters::from_map(&map).is_err());
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use placerec_memory::signature::PayloadPolicy;
use placerec_memory::store::SqliteOptions;
use placerec_memory::tiering::TieringConfig;
use placerec_types::PlaceError;

use crate::bayes::BayesConfig;
use crate::detector::DetectorConfig;

/// Raw `name -> value` map as supplied by the caller.
pub type ParametersMap = BTreeMap<String, String>;

/// Every recognized parameter: name, default, meaning.
pub const PARAMETERS: &[(&str, &str, &str)] = &[
    ("Kp/WordMatchDistance", "0.5", "quantization L2 threshold"),
    ("Kp/WordMergeDistance", "0", "consolidation distance (0 disables)"),
    ("Kp/ConsolidatePeriod", "0", "cycles between consolidations (0 disables)"),
    ("Mem/WorkingSetCapacity", "50", "working set cap (>= 1)"),
    ("Mem/StmSize", "3", "short-term buffer size"),
    ("Mem/ReactivationDepth", "1", "traversal/reactivation depth cap"),
    ("Mem/ReactivationThreshold", "0.2", "min posterior to reactivate neighbors"),
    ("Mem/FusePayload", "keep", "keep / replace"),
    ("Mem/WarmStart", "true", "reactivate top-weighted on open"),
    ("Rtabmap/TimeThreshold", "0", "per-cycle budget in ms (0 = unlimited)"),
    ("Rtabmap/VerifyIntegrity", "true", "run invariant checks each cycle"),
    ("Bayes/NeighborSpread", "0.2", "prediction decay to neighbors"),
    ("Bayes/PredictionMix", "0.5", "uniform mixing weight"),
    ("Bayes/Sharpness", "12", "likelihood sharpness"),
    ("Bayes/NoMatchSimilarity", "0.35", "no-match reference similarity"),
    ("Bayes/LoopThreshold", "0.5", "acceptance threshold"),
    ("Bayes/LoopMargin", "0.1", "margin over no-match"),
    ("Bayes/PruneMass", "1e-6", "absorption floor"),
    ("DbSqlite3/JournalMode", "WAL", "pragma journal_mode"),
    ("DbSqlite3/CacheSize", "10000", "pragma cache_size (pages)"),
    ("DbSqlite3/Synchronous", "NORMAL", "pragma synchronous"),
    ("DbSqlite3/TempStore", "MEMORY", "pragma temp_store"),
    ("DbSqlite3/InMemory", "false", "work on a RAM copy of the database file"),
];

/// The default value of every parameter.
pub fn default_parameters() -> ParametersMap {
    PARAMETERS
        .iter()
        .map(|(name, default, _)| (name.to_string(), default.to_string()))
        .collect()
}

/// Resolved, validated parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub word_match_distance: f32,
    pub word_merge_distance: f32,
    pub consolidate_period: u64,
    pub working_set_capacity: usize,
    pub stm_size: usize,
    pub reactivation_depth: usize,
    pub reactivation_threshold: f64,
    pub fuse_payload: PayloadPolicy,
    pub warm_start: bool,
    pub time_threshold_ms: f64,
    pub verify_integrity: bool,
    pub neighbor_spread: f64,
    pub prediction_mix: f64,
    pub sharpness: f64,
    pub no_match_similarity: f64,
    pub loop_threshold: f64,
    pub loop_margin: f64,
    pub prune_mass: f64,
    pub sqlite: SqliteOptions,
}

impl Default for Parameters {
    fn default() -> Self {
        // The defaults table is valid by construction.
        match Self::from_map(&ParametersMap::new()) {
            Ok(params) => params,
            Err(e) => unreachable!("default parameters rejected: {e}"),
        }
    }
}

impl Parameters {
    /// Overlay `overrides` on the defaults and validate the result.
    pub fn from_map(overrides: &ParametersMap) -> Result<Self, PlaceError> {
        if let Some(key) = overrides
            .keys()
            .find(|key| !PARAMETERS.iter().any(|(name, _, _)| name == key))
        {
            return Err(PlaceError::config(key.as_str(), "unknown parameter"));
        }
        let mut map = default_parameters();
        map.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        let r = Resolver { map: &map };

        Ok(Self {
            word_match_distance: r.positive("Kp/WordMatchDistance")?,
            word_merge_distance: r.non_negative("Kp/WordMergeDistance")?,
            consolidate_period: r.parse("Kp/ConsolidatePeriod")?,
            working_set_capacity: r.at_least_one("Mem/WorkingSetCapacity")?,
            stm_size: r.parse("Mem/StmSize")?,
            reactivation_depth: r.parse("Mem/ReactivationDepth")?,
            reactivation_threshold: r.unit("Mem/ReactivationThreshold")?,
            fuse_payload: r.parse("Mem/FusePayload")?,
            warm_start: r.flag("Mem/WarmStart")?,
            time_threshold_ms: r.non_negative("Rtabmap/TimeThreshold")?,
            verify_integrity: r.flag("Rtabmap/VerifyIntegrity")?,
            neighbor_spread: r.unit("Bayes/NeighborSpread")?,
            prediction_mix: r.unit("Bayes/PredictionMix")?,
            sharpness: r.non_negative("Bayes/Sharpness")?,
            no_match_similarity: r.unit("Bayes/NoMatchSimilarity")?,
            loop_threshold: r.unit("Bayes/LoopThreshold")?,
            loop_margin: r.unit("Bayes/LoopMargin")?,
            prune_mass: r.unit("Bayes/PruneMass")?,
            sqlite: SqliteOptions {
                journal_mode: r.one_of(
                    "DbSqlite3/JournalMode",
                    &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"],
                )?,
                cache_size: r.parse("DbSqlite3/CacheSize")?,
                synchronous: r.one_of("DbSqlite3/Synchronous", &["OFF", "NORMAL", "FULL", "EXTRA"])?,
                temp_store: r.one_of("DbSqlite3/TempStore", &["DEFAULT", "FILE", "MEMORY"])?,
                in_memory: r.flag("DbSqlite3/InMemory")?,
            },
        })
    }

    pub fn tiering_config(&self) -> TieringConfig {
        TieringConfig {
            working_set_capacity: self.working_set_capacity,
            stm_size: self.stm_size,
            reactivation_depth: self.reactivation_depth,
            match_distance: self.word_match_distance,
            payload_policy: self.fuse_payload,
            warm_start: self.warm_start,
        }
    }

    pub fn bayes_config(&self) -> BayesConfig {
        BayesConfig {
            neighbor_spread: self.neighbor_spread,
            prediction_mix: self.prediction_mix,
            sharpness: self.sharpness,
            no_match_similarity: self.no_match_similarity,
            loop_threshold: self.loop_threshold,
            loop_margin: self.loop_margin,
            prune_mass: self.prune_mass,
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            time_threshold_ms: self.time_threshold_ms,
            reactivation_threshold: self.reactivation_threshold,
            consolidate_period: self.consolidate_period,
            merge_distance: self.word_merge_distance,
            verify_integrity: self.verify_integrity,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value parsing
// ─────────────────────────────────────────────────────────────────────────────

struct Resolver<'a> {
    map: &'a ParametersMap,
}

impl Resolver<'_> {
    fn raw(&self, key: &str) -> Result<&str, PlaceError> {
        self.map
            .get(key)
            .map(|v| v.trim())
            .ok_or_else(|| PlaceError::config(key, "missing value"))
    }

    fn parse<T>(&self, key: &str) -> Result<T, PlaceError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.raw(key)?;
        raw.parse()
            .map_err(|e| PlaceError::config(key, format!("`{raw}`: {e}")))
    }

    fn number<T>(&self, key: &str, ok: impl Fn(f64) -> bool, expected: &str) -> Result<T, PlaceError>
    where
        T: FromStr + Into<f64> + Copy,
        T::Err: Display,
    {
        let value: T = self.parse(key)?;
        let wide: f64 = value.into();
        if wide.is_finite() && ok(wide) {
            Ok(value)
        } else {
            Err(PlaceError::config(key, format!("must be {expected}")))
        }
    }

    fn positive<T>(&self, key: &str) -> Result<T, PlaceError>
    where
        T: FromStr + Into<f64> + Copy,
        T::Err: Display,
    {
        self.number(key, |v| v > 0.0, "greater than 0")
    }

    fn non_negative<T>(&self, key: &str) -> Result<T, PlaceError>
    where
        T: FromStr + Into<f64> + Copy,
        T::Err: Display,
    {
        self.number(key, |v| v >= 0.0, "at least 0")
    }

    fn unit(&self, key: &str) -> Result<f64, PlaceError> {
        self.number(key, |v| (0.0..=1.0).contains(&v), "within [0, 1]")
    }

    fn at_least_one(&self, key: &str) -> Result<usize, PlaceError> {
        let value: usize = self.parse(key)?;
        if value == 0 {
            return Err(PlaceError::config(key, "must be at least 1"));
        }
        Ok(value)
    }

    fn flag(&self, key: &str) -> Result<bool, PlaceError> {
        match self.raw(key)?.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(PlaceError::config(key, format!("`{other}` is not a boolean"))),
        }
    }

    fn one_of(&self, key: &str, allowed: &[&str]) -> Result<String, PlaceError> {
        let value = self.raw(key)?.to_ascii_uppercase();
        if allowed.contains(&value.as_str()) {
            Ok(value)
        } else {
            Err(PlaceError::config(
                key,
                format!("`{value}` is not one of {}", allowed.join(", ")),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(key: &str, value: &str) -> ParametersMap {
        ParametersMap::from([(key.to_string(), value.to_string())])
    }

    fn rejected_key(map: &ParametersMap) -> String {
        match Parameters::from_map(map) {
            Err(PlaceError::Configuration { key, .. }) => key,
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    // ── defaults ─────────────────────────────────────────────────────────────

    #[test]
    fn defaults_resolve() {
        let params = Parameters::default();
        assert_eq!(params.working_set_capacity, 50);
        assert_eq!(params.stm_size, 3);
        assert_eq!(params.fuse_payload, PayloadPolicy::Keep);
        assert!(params.warm_start);
        assert_eq!(params.time_threshold_ms, 0.0);
        assert!((params.prune_mass - 1e-6).abs() < 1e-12);
        assert_eq!(params.sqlite, SqliteOptions::default());
    }

    #[test]
    fn default_map_lists_every_parameter() {
        let map = default_parameters();
        assert_eq!(map.len(), PARAMETERS.len());
        assert_eq!(map["Bayes/Sharpness"], "12");
    }

    // ── overrides ────────────────────────────────────────────────────────────

    #[test]
    fn overrides_are_applied() {
        let mut map = with("Mem/FusePayload", "replace");
        map.insert("Rtabmap/TimeThreshold".into(), "700".into());
        map.insert("DbSqlite3/JournalMode".into(), "delete".into());
        let params = Parameters::from_map(&map).unwrap();
        assert_eq!(params.fuse_payload, PayloadPolicy::Replace);
        assert_eq!(params.time_threshold_ms, 700.0);
        assert_eq!(params.sqlite.journal_mode, "DELETE");
    }

    #[test]
    fn component_configs_follow_parameters() {
        let mut map = with("Mem/WorkingSetCapacity", "7");
        map.insert("Bayes/LoopThreshold".into(), "0.8".into());
        map.insert("Kp/ConsolidatePeriod".into(), "5".into());
        let params = Parameters::from_map(&map).unwrap();
        assert_eq!(params.tiering_config().working_set_capacity, 7);
        assert_eq!(params.bayes_config().loop_threshold, 0.8);
        assert_eq!(params.detector_config().consolidate_period, 5);
    }

    // ── rejection ────────────────────────────────────────────────────────────

    #[test]
    fn unknown_parameter_is_rejected() {
        assert_eq!(rejected_key(&with("Mem/Nope", "1")), "Mem/Nope");
    }

    #[test]
    fn malformed_values_are_rejected() {
        for (key, value) in [
            ("Mem/StmSize", "three"),
            ("Mem/StmSize", "-1"),
            ("Mem/WorkingSetCapacity", "0"),
            ("Kp/WordMatchDistance", "0"),
            ("Kp/WordMatchDistance", "NaN"),
            ("Bayes/LoopThreshold", "1.5"),
            ("Mem/WarmStart", "maybe"),
            ("Mem/FusePayload", "merge"),
            ("DbSqlite3/Synchronous", "SOMETIMES"),
            ("Rtabmap/TimeThreshold", "-5"),
        ] {
            assert_eq!(rejected_key(&with(key, value)), key, "{key}={value}");
        }
    }

    #[test]
    fn flags_accept_numeric_forms() {
        let params = Parameters::from_map(&with("Rtabmap/VerifyIntegrity", "0")).unwrap();
        assert!(!params.verify_integrity);
        let params = Parameters::from_map(&with("DbSqlite3/InMemory", "1")).unwrap();
        assert!(params.sqlite.in_memory);
    }
}
