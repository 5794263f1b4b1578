//! Shared handle binding a scan to its devices.

use crate::error::{AppResult, ScanError};
use crate::experiment::scan::ScanRecord;
use crate::hardware::capabilities::{CaptureDevice, CaptureParams, Positioner};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct ContextInner {
    scan: Option<ScanRecord>,
    positioner: Option<Arc<dyn Positioner>>,
    capture: Option<Arc<dyn CaptureDevice>>,
    locked: bool,
}

/// Scan, positioner and capture device used by one orchestrator.
///
/// Cloning yields another handle to the same context. While a scan runs the
/// context is locked: setters fail with [`ScanError::ContextLocked`] and only
/// the orchestrator writes to the scan.
#[derive(Clone, Default)]
pub struct ScanContext {
    inner: Arc<Mutex<ContextInner>>,
}

/// What the orchestrator needs to run a freshly prepared scan.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScanPlan {
    pub targets: Vec<f64>,
    pub params: CaptureParams,
    pub resolution: f64,
}

impl ScanContext {
    /// Creates an empty, unlocked context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context holding both devices.
    pub fn with_devices(positioner: Arc<dyn Positioner>, capture: Arc<dyn CaptureDevice>) -> Self {
        let context = Self::new();
        {
            let mut inner = context.lock();
            inner.positioner = Some(positioner);
            inner.capture = Some(capture);
        }
        context
    }

    fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unlocked(&self) -> AppResult<MutexGuard<'_, ContextInner>> {
        let inner = self.lock();
        if inner.locked {
            return Err(ScanError::ContextLocked);
        }
        Ok(inner)
    }

    /// True while a scan is running on this context.
    pub fn is_locked(&self) -> bool {
        self.lock().locked
    }

    /// Replaces the scan.
    pub fn set_scan(&self, scan: ScanRecord) -> AppResult<()> {
        self.unlocked()?.scan = Some(scan);
        Ok(())
    }

    /// Replaces the positioner.
    pub fn set_positioner(&self, positioner: Arc<dyn Positioner>) -> AppResult<()> {
        self.unlocked()?.positioner = Some(positioner);
        Ok(())
    }

    /// Replaces the capture device.
    pub fn set_capture(&self, capture: Arc<dyn CaptureDevice>) -> AppResult<()> {
        self.unlocked()?.capture = Some(capture);
        Ok(())
    }

    /// Edits the scan outside of a run.
    pub fn modify_scan<R>(&self, f: impl FnOnce(&mut ScanRecord) -> R) -> AppResult<R> {
        let mut inner = self.unlocked()?;
        let scan = inner
            .scan
            .as_mut()
            .ok_or(ScanError::MissingCollaborator("scan"))?;
        Ok(f(scan))
    }

    /// Copy of the current scan, including progress of a running one.
    pub fn scan(&self) -> Option<ScanRecord> {
        self.lock().scan.clone()
    }

    /// Reads the scan without copying it.
    pub fn with_scan<R>(&self, f: impl FnOnce(&ScanRecord) -> R) -> Option<R> {
        self.lock().scan.as_ref().map(f)
    }

    /// Current positioner, if any.
    pub fn positioner(&self) -> Option<Arc<dyn Positioner>> {
        self.lock().positioner.clone()
    }

    /// Current capture device, if any.
    pub fn capture(&self) -> Option<Arc<dyn CaptureDevice>> {
        self.lock().capture.clone()
    }

    /// Both devices, or the first missing one as an error.
    pub(crate) fn devices(&self) -> AppResult<(Arc<dyn Positioner>, Arc<dyn CaptureDevice>)> {
        let inner = self.lock();
        if inner.scan.is_none() {
            return Err(ScanError::MissingCollaborator("scan"));
        }
        let positioner = inner
            .positioner
            .clone()
            .ok_or(ScanError::MissingCollaborator("positioner"))?;
        let capture = inner
            .capture
            .clone()
            .ok_or(ScanError::MissingCollaborator("capture device"))?;
        Ok((positioner, capture))
    }

    /// Prepares the scan and locks the context for the run.
    pub(crate) fn begin(&self) -> AppResult<ScanPlan> {
        let mut inner = self.lock();
        if inner.locked {
            return Err(ScanError::ContextLocked);
        }
        let scan = inner
            .scan
            .as_mut()
            .ok_or(ScanError::MissingCollaborator("scan"))?;
        scan.prepare()?;
        let plan = ScanPlan {
            targets: scan.target_angles().to_vec(),
            params: scan.params,
            resolution: scan.resolution()?,
        };
        inner.locked = true;
        Ok(plan)
    }

    /// Appends a reached angle to the running scan.
    pub(crate) fn record_reached(&self, angle: f64) {
        if let Some(scan) = self.lock().scan.as_mut() {
            scan.reached_angles.push(angle);
        }
    }

    /// Reached angle of step `index`.
    pub(crate) fn reached(&self, index: usize) -> Option<f64> {
        self.lock()
            .scan
            .as_ref()
            .and_then(|s| s.reached_angles.get(index).copied())
    }

    /// Releases the run lock.
    pub(crate) fn unlock(&self) {
        self.lock().locked = false;
    }
}

impl std::fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ScanContext")
            .field("scan", &inner.scan)
            .field("has_positioner", &inner.positioner.is_some())
            .field("has_capture", &inner.capture.is_some())
            .field("locked", &inner.locked)
            .finish()
    }
}
