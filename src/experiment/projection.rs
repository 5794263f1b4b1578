//! Captured projections and their raw file output.

use crate::error::AppResult;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One captured projection, emitted once per completed scan step.
#[derive(Debug, Clone)]
pub struct Projection {
    /// Run that produced this projection.
    pub run_id: Uuid,
    /// Step index, starting at 0.
    pub index: usize,
    /// Angle reached by the positioner for this step.
    pub angle: f64,
    /// Raw sensor data, if the device sent any.
    pub data: Option<Bytes>,
    /// Bytes between horizontally adjacent pixels.
    pub stride_pixel: u32,
    /// Bytes per image row.
    pub stride_row: u32,
    /// Sensor identifier reported by the device.
    pub sensor: u32,
    /// Time the capture completion was received.
    pub captured_at: DateTime<Utc>,
}

/// Receiver of projections. Runs on the link task, so it must not block for long.
pub type ProjectionSink = Arc<dyn Fn(Projection) + Send + Sync>;

/// Writes raw payloads to `<dir>/raw/proj_<index:04>.raw`.
#[derive(Debug, Clone)]
pub struct ProjectionWriter {
    dir: PathBuf,
}

impl ProjectionWriter {
    /// Creates a writer below `dir`. Directories are created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Scan output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File used for projection `index`.
    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join("raw").join(format!("proj_{index:04}.raw"))
    }

    /// Stores the payload of `projection`. Returns `None` when it carries no data.
    pub fn write(&self, projection: &Projection) -> AppResult<Option<PathBuf>> {
        let Some(data) = &projection.data else {
            return Ok(None);
        };
        let path = self.path_for(projection.index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        debug!(index = projection.index, path = %path.display(), bytes = data.len(), "Projection saved");
        Ok(Some(path))
    }

    /// Sink that writes every projection and logs failures.
    pub fn into_sink(self) -> ProjectionSink {
        Arc::new(move |projection: Projection| match self.write(&projection) {
            Ok(Some(_)) => {}
            Ok(None) => warn!(index = projection.index, "Projection without raw data, nothing saved"),
            Err(e) => error!(index = projection.index, error = %e, "Failed to save projection"),
        })
    }
}
