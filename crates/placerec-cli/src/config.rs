//! Configuration file – reads/writes `~/.placerec/config.toml`.
//!
//! ```toml
//! database = "/var/lib/placerec/places.db"
//! time_budget_ms = 700.0
//!
//! [parameters]
//! "Mem/WorkingSetCapacity" = 30
//! "Mem/FusePayload" = "replace"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use placerec_runtime::ParametersMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the config file or its environment overrides were rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config at {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("{var}=`{value}` is not a valid {expected}")]
    Env {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Persisted user configuration stored in `~/.placerec/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database path, or `:memory:`.
    #[serde(default = "default_database")]
    pub database: String,

    /// Per-cycle budget in milliseconds; overrides `Rtabmap/TimeThreshold`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_budget_ms: Option<f64>,

    /// Named parameters. Values may be TOML strings, numbers or booleans.
    #[serde(default)]
    pub parameters: BTreeMap<String, toml::Value>,
}

fn default_database() -> String {
    "placerec.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database(),
            time_budget_ms: None,
            parameters: BTreeMap::new(),
        }
    }
}

impl Config {
    /// The file's parameters as a flat string map, with the time budget
    /// folded in.
    pub fn parameter_map(&self) -> ParametersMap {
        let mut map: ParametersMap = self
            .parameters
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), value)
            })
            .collect();
        if let Some(ms) = self.time_budget_ms {
            map.insert("Rtabmap/TimeThreshold".to_string(), ms.to_string());
        }
        map
    }
}

/// Return the path to `~/.placerec/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".placerec").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg)?;
    Ok(Some(cfg))
}

/// Apply `PLACEREC_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PLACEREC_DATABASE` | `database` |
/// | `PLACEREC_TIME_BUDGET_MS` | `time_budget_ms` |
pub fn apply_env_overrides(cfg: &mut Config) -> Result<(), ConfigError> {
    apply_overrides(cfg, |var| std::env::var(var).ok())
}

fn apply_overrides(
    cfg: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(v) = lookup("PLACEREC_DATABASE") {
        cfg.database = v;
    }
    if let Some(v) = lookup("PLACEREC_TIME_BUDGET_MS") {
        let ms = v
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .ok_or(ConfigError::Env {
                var: "PLACEREC_TIME_BUDGET_MS",
                value: v.clone(),
                expected: "non-negative number of milliseconds",
            })?;
        cfg.time_budget_ms = Some(ms);
    }
    Ok(())
}

/// Save the config to disk, creating `~/.placerec/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(write_err)
}
