//! Mock Hardware Implementations
//!
//! In-memory devices for driving the scan orchestrator from tests without
//! sockets. Requests are recorded; responses are injected explicitly by the
//! test, which keeps every interleaving deterministic.
//!
//! # Available Mocks
//!
//! - `MockPositioner` - records `move_to` calls, injects move done / status
//! - `MockCapture` - records `capture` calls, injects capture done
//!
//! Both start out ready. `disconnect()` flips readiness off and notifies
//! listeners exactly like a dropped TCP connection.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::AppResult;
use crate::hardware::capabilities::{
    CaptureDevice, CaptureListener, CaptureParams, Positioner, PositionerListener,
};
use crate::hardware::DeviceRole;
use crate::network::listeners::ListenerRegistry;
use crate::network::protocol::{angle_to_wire, Token};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// MockPositioner - Simulated Turntable
// =============================================================================

/// Mock positioner recording every move request.
///
/// # Example
///
/// ```rust,ignore
/// let positioner = MockPositioner::new();
/// positioner.move_to(90.0, Token(1))?;
/// positioner.complete_last_move(); // listeners see on_position_done(90.0, Token(1))
/// ```
pub struct MockPositioner {
    ready: AtomicBool,
    listeners: ListenerRegistry<dyn PositionerListener>,
    moves: Mutex<Vec<(f64, Token)>>,
}

impl MockPositioner {
    /// Creates a ready positioner with no listeners.
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            listeners: ListenerRegistry::new("mock_positioner"),
            moves: Mutex::new(Vec::new()),
        }
    }

    /// Sets the readiness reported by `is_ready`.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// All move requests so far, oldest first.
    pub fn moves(&self) -> Vec<(f64, Token)> {
        lock(&self.moves).clone()
    }

    /// The most recent move request.
    pub fn last_move(&self) -> Option<(f64, Token)> {
        lock(&self.moves).last().copied()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Reports the most recent move as done, echoing its angle and token.
    ///
    /// Returns false if no move was requested yet.
    pub fn complete_last_move(&self) -> bool {
        match self.last_move() {
            Some((angle, token)) => {
                self.complete_move(angle, token);
                true
            }
            None => false,
        }
    }

    /// Injects a move done notification.
    pub fn complete_move(&self, angle: f64, token: Token) {
        self.listeners.for_each(|l| l.on_position_done(angle, token));
    }

    /// Injects a status report.
    pub fn report_status(&self, angle: f64) {
        self.listeners.for_each(|l| l.on_status(angle));
    }

    /// Marks the device as gone and notifies listeners.
    pub fn disconnect(&self) {
        self.set_ready(false);
        self.listeners.for_each(|l| l.on_link_lost(DeviceRole::Positioner));
    }
}

impl Default for MockPositioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Positioner for MockPositioner {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn move_to(&self, angle: f64, token: Token) -> AppResult<()> {
        angle_to_wire(angle)?;
        lock(&self.moves).push((angle, token));
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn PositionerListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn PositionerListener>) -> bool {
        self.listeners.remove(listener)
    }
}

// =============================================================================
// MockCapture - Simulated Camera
// =============================================================================

/// Mock capture device recording every capture request.
pub struct MockCapture {
    ready: AtomicBool,
    listeners: ListenerRegistry<dyn CaptureListener>,
    captures: Mutex<Vec<(CaptureParams, Token)>>,
}

impl MockCapture {
    /// Creates a ready capture device with no listeners.
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            listeners: ListenerRegistry::new("mock_capture"),
            captures: Mutex::new(Vec::new()),
        }
    }

    /// Sets the readiness reported by `is_ready`.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// All capture requests so far, oldest first.
    pub fn captures(&self) -> Vec<(CaptureParams, Token)> {
        lock(&self.captures).clone()
    }

    /// The most recent capture request.
    pub fn last_capture(&self) -> Option<(CaptureParams, Token)> {
        lock(&self.captures).last().copied()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Reports the most recent capture as done with `data`.
    ///
    /// Returns false if no capture was requested yet.
    pub fn complete_last_capture(&self, data: Option<Bytes>) -> bool {
        match self.last_capture() {
            Some((_, token)) => {
                self.complete_capture(token, data);
                true
            }
            None => false,
        }
    }

    /// Injects a capture done notification for 16-bit pixels, one row per payload.
    pub fn complete_capture(&self, token: Token, data: Option<Bytes>) {
        let row = data.as_ref().map_or(0, |d| d.len() as u32);
        self.listeners
            .for_each(|l| l.on_capture_done(data.clone(), 2, row, 0, token));
    }

    /// Marks the device as gone and notifies listeners.
    pub fn disconnect(&self) {
        self.set_ready(false);
        self.listeners.for_each(|l| l.on_link_lost(DeviceRole::Capture));
    }
}

impl Default for MockCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for MockCapture {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn capture(&self, params: &CaptureParams, token: Token) -> AppResult<()> {
        lock(&self.captures).push((*params, token));
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn CaptureListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn CaptureListener>) -> bool {
        self.listeners.remove(listener)
    }
}
