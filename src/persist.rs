//! Persistence boundary for the realtime state.
//!
//! The connection manager saves a [`Snapshot`] after each committed change and
//! restores it once at construction. Failures are logged by the caller and never
//! affect the live stream.

use crate::error::Result;
use crate::telemetry::{Reading, SeriesPoint};
use crate::trend::TrendCache;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub target_id: String,
    #[serde(default)]
    pub latest: Option<Reading>,
    #[serde(default)]
    pub series: Vec<SeriesPoint>,
    #[serde(default)]
    pub last_saved_date: Option<NaiveDate>,
    #[serde(default)]
    pub trends: TrendCache,
}

pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
    fn load(&self) -> Result<Option<Snapshot>>;
}

/// Stores nothing and loads nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl SnapshotStore for NoopStore {
    fn save(&self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(None)
    }
}

/// Snapshot kept as a pretty-printed JSON file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileStore {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Readers only ever see a complete file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), points = snapshot.series.len(), "snapshot saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_slice(&content)?))
    }
}
