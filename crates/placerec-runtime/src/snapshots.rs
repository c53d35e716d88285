//! JSON-lines snapshot datasets.
//!
//! One [`Snapshot`] per line:
//!
//! ```text
//! {"features":[{"descriptor":[0.1,0.7],"keypoint":{"x":12.0,"y":40.5}}],"payload":{"actions":[[0.2]]}}
//! ```
//!
//! `timestamp` and `payload` may be omitted. Blank lines and lines starting
//! with `#` are skipped.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use placerec_types::Snapshot;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("cannot read {origin}: {source}")]
    Io {
        origin: String,
        #[source]
        source: io::Error,
    },

    #[error("{origin}:{line}: malformed snapshot: {source}")]
    Parse {
        origin: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Read every snapshot in the file at `path`.
pub fn read_snapshots(path: &Path) -> Result<Vec<Snapshot>, SnapshotError> {
    let origin = path.display().to_string();
    let file = File::open(path).map_err(|source| SnapshotError::Io {
        origin: origin.clone(),
        source,
    })?;
    parse_snapshots(BufReader::new(file), &origin)
}

/// Parse snapshots from any line reader; `origin` labels errors.
pub fn parse_snapshots(reader: impl BufRead, origin: &str) -> Result<Vec<Snapshot>, SnapshotError> {
    let mut snapshots = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| SnapshotError::Io {
            origin: origin.to_string(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let snapshot = serde_json::from_str(trimmed).map_err(|source| SnapshotError::Parse {
            origin: origin.to_string(),
            line: index + 1,
            source,
        })?;
        snapshots.push(snapshot);
    }
    Ok(snapshots)
}
