//! Scan description and its JSON file.
//!
//! A scan file is shared with the processing and reconstruction tools. Only
//! the keys this crate understands are typed; every other key is kept as-is
//! and written back unchanged on save.

use crate::error::{AppResult, ScanError};
use crate::hardware::capabilities::CaptureParams;
use crate::network::protocol::angle_to_wire;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

// A file without these keys describes no projections over half a turn.
fn default_projection_count() -> u32 {
    0
}

fn default_max_angle() -> f64 {
    180.0
}

/// One CT scan: how many projections over which angle, and what was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Number of projections to capture.
    #[serde(rename = "num_projections", default = "default_projection_count")]
    pub projection_count: u32,

    /// Total rotation in degrees.
    #[serde(default = "default_max_angle")]
    pub max_angle: f64,

    /// Angles reported by the positioner, one per completed step.
    #[serde(default)]
    pub reached_angles: Vec<f64>,

    /// Capture timings used for every projection.
    #[serde(rename = "scan_parameters", default)]
    pub params: CaptureParams,

    /// Keys owned by other tools.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,

    #[serde(skip)]
    target_angles: Vec<f64>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for ScanRecord {
    fn default() -> Self {
        Self::new(default_projection_count(), default_max_angle())
    }
}

impl ScanRecord {
    /// Creates an in-memory scan with default capture timings.
    pub fn new(projection_count: u32, max_angle: f64) -> Self {
        Self {
            projection_count,
            max_angle,
            reached_angles: Vec::new(),
            params: CaptureParams::default(),
            extra: serde_json::Map::new(),
            target_angles: Vec::new(),
            path: None,
        }
    }

    /// Sets the capture timings.
    pub fn with_params(mut self, params: CaptureParams) -> Self {
        self.params = params;
        self
    }

    /// Associates the scan with a file; reached angles are written there on completion.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// File this scan was loaded from or will be saved to.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Angular step in degrees.
    pub fn resolution(&self) -> AppResult<f64> {
        self.validate()?;
        Ok(self.max_angle / f64::from(self.projection_count))
    }

    /// Checks that the parameters produce a sequence of encodable angles.
    pub fn validate(&self) -> AppResult<()> {
        if self.projection_count == 0 {
            return Err(ScanError::InvalidScan(
                "num_projections must be at least 1".to_string(),
            ));
        }
        if !self.max_angle.is_finite() || self.max_angle < 0.0 {
            return Err(ScanError::InvalidScan(format!(
                "max_angle must be a non-negative number, got {}",
                self.max_angle
            )));
        }
        angle_to_wire(self.max_angle)
            .map_err(|_| ScanError::InvalidScan(format!("max_angle {} too large", self.max_angle)))?;
        Ok(())
    }

    /// Computes the target angles and clears reached angles.
    ///
    /// `target[i] = (max_angle / projection_count) * i` for `i` in `0..projection_count`.
    pub fn prepare(&mut self) -> AppResult<()> {
        let resolution = self.resolution()?;
        self.target_angles = (0..self.projection_count)
            .map(|i| resolution * f64::from(i))
            .collect();
        self.reached_angles.clear();
        debug!(
            projections = self.projection_count,
            resolution, "Scan prepared"
        );
        Ok(())
    }

    /// Target angles computed by [`ScanRecord::prepare`].
    pub fn target_angles(&self) -> &[f64] {
        &self.target_angles
    }

    /// Target angle of step `index`.
    pub fn target(&self, index: usize) -> Option<f64> {
        self.target_angles.get(index).copied()
    }

    /// True once every prepared target has a reached angle.
    pub fn is_complete(&self) -> bool {
        !self.target_angles.is_empty() && self.reached_angles.len() == self.target_angles.len()
    }

    /// Reached angles in radians, as reconstruction expects them.
    pub fn reached_angles_rad(&self) -> Vec<f64> {
        self.reached_angles.iter().map(|a| a.to_radians()).collect()
    }

    /// Loads a scan file and remembers its path.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let json = fs::read_to_string(&path)?;
        let mut scan: ScanRecord = serde_json::from_str(&json)?;
        scan.path = Some(path.as_ref().to_path_buf());
        Ok(scan)
    }

    /// Writes the scan as pretty JSON, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&path, json)?;
        Ok(())
    }

    /// Saves to the associated path. Returns false if the scan has none.
    pub fn persist(&self) -> AppResult<bool> {
        match &self.path {
            Some(path) => {
                self.save(path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prepare_targets() {
        let mut scan = ScanRecord::new(4, 360.0);
        scan.reached_angles.push(1.0);
        scan.prepare().unwrap();

        assert_eq!(scan.target_angles(), &[0.0, 90.0, 180.0, 270.0]);
        assert!(scan.reached_angles.is_empty());
        assert_eq!(scan.resolution().unwrap(), 90.0);
        assert!(!scan.is_complete());
    }

    #[test]
    fn test_invalid_scans() {
        assert!(matches!(
            ScanRecord::new(0, 360.0).prepare(),
            Err(ScanError::InvalidScan(_))
        ));
        assert!(ScanRecord::new(10, -5.0).validate().is_err());
        assert!(ScanRecord::new(10, f64::INFINITY).validate().is_err());
        assert!(ScanRecord::new(1, 0.0).validate().is_ok());
    }

    #[test]
    fn test_json_keys() {
        let json = r#"{
            "num_projections": 2,
            "max_angle": 180,
            "reached_angles": [0.0, 90.0],
            "scan_parameters": {"shutterlen": 100, "exposure": 2000, "focuslen": 300},
            "processing_parameters": {"downsample": 4}
        }"#;
        let scan: ScanRecord = serde_json::from_str(json).unwrap();

        assert_eq!(scan.projection_count, 2);
        assert_eq!(scan.max_angle, 180.0);
        assert_eq!(scan.params.exposure_ms, 2000);
        assert!(scan.extra.contains_key("processing_parameters"));

        let value = serde_json::to_value(&scan).unwrap();
        assert_eq!(value["num_projections"], 2);
        assert_eq!(value["scan_parameters"]["focuslen"], 300);
        assert_eq!(value["processing_parameters"]["downsample"], 4);
        assert!(value.get("target_angles").is_none());
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let scan: ScanRecord = serde_json::from_str("{}").unwrap();
        assert_eq!(scan.projection_count, 0);
        assert_eq!(scan.max_angle, 180.0);
        assert_eq!(scan.params, CaptureParams::default());
        assert!(matches!(scan.validate(), Err(ScanError::InvalidScan(_))));
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scans").join("scan.json");

        let mut scan = ScanRecord::new(3, 90.0).with_path(&path);
        scan.reached_angles = vec![0.0, 30.0, 60.0];
        assert!(scan.persist().unwrap());

        let loaded = ScanRecord::load(&path).unwrap();
        assert_eq!(loaded.reached_angles, vec![0.0, 30.0, 60.0]);
        assert_eq!(loaded.path(), Some(path.as_path()));
        assert!(!ScanRecord::new(1, 1.0).persist().unwrap());
    }
}
