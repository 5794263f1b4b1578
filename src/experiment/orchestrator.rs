//! Scan orchestrator: the state machine that walks a scan through its angles.
//!
//! For every target angle the orchestrator asks the positioner to move, waits
//! for the move to complete, asks the capture device for a projection and
//! waits for the image. Requests return immediately; progress is driven by the
//! completion callbacks the device links deliver on their own tasks.
//!
//! ```text
//! start ─> move(θ0) ··· done ─> capture ··· done ─> move(θ1) ··· ─> capture ··· done ─> Done
//! ```
//!
//! Every request carries a fresh [`Token`]. A completion is accepted only if
//! the orchestrator is waiting for that kind of completion and the token
//! matches; anything else is logged and dropped.
//!
//! # Pause
//!
//! `pause()` never interrupts the in-flight request. The scan enters
//! `WaitPause`, the outstanding completion is still booked (reached angle or
//! projection) and then the scan parks in `Paused` without issuing the next
//! request. `resume()` issues exactly that request.
//!
//! When a device link drops while its completion is awaited, that completion
//! can never arrive: the scan parks in `Paused` immediately and `resume()`
//! re-issues the lost request with a new token. When the other device drops,
//! the scan pauses at the next step boundary.
//!
//! # Locking
//!
//! All mutable state sits behind one mutex. Listener (un)registration happens
//! under it. State callbacks, projection delivery and file writes happen after
//! it is released, so callbacks may call back into the orchestrator. State
//! changes are queued under the lock and delivered strictly in that order.
//!
//! A request is chosen under the lock but sent last, after re-checking under
//! the lock that the scan still waits for it. A `stop()` issued in between,
//! from a callback or another thread, drops the request.

use crate::error::{AppResult, ScanError};
use crate::experiment::context::ScanContext;
use crate::experiment::projection::{Projection, ProjectionSink};
use crate::experiment::scan::ScanRecord;
use crate::experiment::state::ScanState;
use crate::hardware::capabilities::{
    CaptureDevice, CaptureListener, CaptureParams, Positioner, PositionerListener,
};
use crate::hardware::DeviceRole;
use crate::network::protocol::Token;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Callback notified of every state change.
pub type StateCallback = Arc<dyn Fn(ScanState) + Send + Sync>;

/// Completion the scan is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Move,
    Capture,
}

impl Awaiting {
    fn role(self) -> DeviceRole {
        match self {
            Awaiting::Move => DeviceRole::Positioner,
            Awaiting::Capture => DeviceRole::Capture,
        }
    }
}

/// Request to issue when a paused scan resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// The move of the current step completed.
    Capture,
    /// The capture of the current step completed.
    Advance,
    /// The request was lost with its device link.
    Retry(Awaiting),
}

type Devices = (Arc<dyn Positioner>, Arc<dyn CaptureDevice>);

struct Inner {
    state: ScanState,
    context: Option<ScanContext>,
    devices: Option<Devices>,
    holds_context: bool,
    run_id: Option<Uuid>,
    targets: Vec<f64>,
    params: CaptureParams,
    index: usize,
    captured: usize,
    awaiting: Option<Awaiting>,
    pending: Option<Pending>,
    move_token: Option<Token>,
    capture_token: Option<Token>,
}

enum Request {
    Move(Arc<dyn Positioner>, f64, Token),
    Capture(Arc<dyn CaptureDevice>, CaptureParams, Token),
}

/// Side effects collected under the lock and applied after releasing it.
#[derive(Default)]
struct Effects {
    projection: Option<Projection>,
    persist: Option<ScanRecord>,
    request: Option<Request>,
}

/// Snapshot of scan progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanStatus {
    /// Current state.
    pub state: ScanState,
    /// Identifier of the current or last run.
    pub run_id: Option<Uuid>,
    /// Projections captured in this run.
    pub captured: usize,
    /// Projections planned for this run.
    pub total: usize,
    /// Target angle of the current step.
    pub target_angle: Option<f64>,
}

/// Adapter registered on the devices. Holds the core weakly so a forgotten
/// registration never keeps the orchestrator alive.
struct ScanListener {
    core: Weak<OrchestratorCore>,
}

impl PositionerListener for ScanListener {
    fn on_position_done(&self, angle: f64, token: Token) {
        if let Some(core) = self.core.upgrade() {
            core.on_position_done(angle, token);
        }
    }

    fn on_link_lost(&self, role: DeviceRole) {
        if let Some(core) = self.core.upgrade() {
            core.on_link_lost(role);
        }
    }
}

impl CaptureListener for ScanListener {
    fn on_capture_done(
        &self,
        data: Option<Bytes>,
        stride_pixel: u32,
        stride_row: u32,
        sensor: u32,
        token: Token,
    ) {
        if let Some(core) = self.core.upgrade() {
            core.on_capture_done(data, stride_pixel, stride_row, sensor, token);
        }
    }

    fn on_link_lost(&self, role: DeviceRole) {
        if let Some(core) = self.core.upgrade() {
            core.on_link_lost(role);
        }
    }
}

/// State changes waiting for the callback.
#[derive(Default)]
struct Notifications {
    queue: VecDeque<ScanState>,
    delivering: bool,
}

struct OrchestratorCore {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ScanState>,
    notifications: Mutex<Notifications>,
    on_state: Mutex<Option<StateCallback>>,
    on_projection: Mutex<Option<ProjectionSink>>,
    positioner_listener: Arc<dyn PositionerListener>,
    capture_listener: Arc<dyn CaptureListener>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl OrchestratorCore {
    fn new(me: &Weak<OrchestratorCore>) -> Self {
        let listener = Arc::new(ScanListener { core: me.clone() });
        let (state_tx, _) = watch::channel(ScanState::Standby);
        Self {
            inner: Mutex::new(Inner {
                state: ScanState::Standby,
                context: None,
                devices: None,
                holds_context: false,
                run_id: None,
                targets: Vec::new(),
                params: CaptureParams::default(),
                index: 0,
                captured: 0,
                awaiting: None,
                pending: None,
                move_token: None,
                capture_token: None,
            }),
            state_tx,
            notifications: Mutex::new(Notifications::default()),
            on_state: Mutex::new(None),
            on_projection: Mutex::new(None),
            positioner_listener: listener.clone(),
            capture_listener: listener,
        }
    }

    /// Must be called with `inner` locked so notifications queue in transition order.
    fn transition(&self, inner: &mut Inner, next: ScanState) {
        if inner.state == next {
            return;
        }
        debug!(from = %inner.state, to = %next, "State change");
        inner.state = next;
        self.state_tx.send_replace(next);
        lock(&self.notifications).queue.push_back(next);
    }

    /// Delivers queued notifications in order. Only one thread delivers at a
    /// time; states queued meanwhile, including by a callback that calls back
    /// in, are delivered by that thread before it returns.
    fn deliver_notifications(&self) {
        {
            let mut notifications = lock(&self.notifications);
            if notifications.delivering {
                return;
            }
            notifications.delivering = true;
        }
        loop {
            let next = {
                let mut notifications = lock(&self.notifications);
                match notifications.queue.pop_front() {
                    Some(state) => state,
                    None => {
                        notifications.delivering = false;
                        return;
                    }
                }
            };
            let callback = lock(&self.on_state).clone();
            if let Some(callback) = callback {
                callback(next);
            }
        }
    }

    /// Sends `request` if the scan still waits for it. A stop, link loss or
    /// restart since the request was chosen drops it.
    fn send(&self, request: Request) {
        let inner = lock(&self.inner);
        // Requests only queue on the device, so they are sent under the lock.
        match request {
            Request::Move(positioner, angle, token) => {
                if inner.awaiting != Some(Awaiting::Move) || inner.move_token != Some(token) {
                    debug!(angle, %token, "Move no longer wanted, not sent");
                    return;
                }
                if let Err(e) = positioner.move_to(angle, token) {
                    error!(angle, %token, error = %e, "Move request failed");
                }
            }
            Request::Capture(capture, params, token) => {
                if inner.awaiting != Some(Awaiting::Capture) || inner.capture_token != Some(token) {
                    debug!(%token, "Capture no longer wanted, not sent");
                    return;
                }
                if let Err(e) = capture.capture(&params, token) {
                    error!(%token, error = %e, "Capture request failed");
                }
            }
        }
    }

    fn apply(&self, fx: Effects) {
        if let Some(projection) = fx.projection {
            let sink = lock(&self.on_projection).clone();
            if let Some(sink) = sink {
                sink(projection);
            }
        }

        self.deliver_notifications();

        if let Some(scan) = fx.persist {
            match scan.persist() {
                Ok(_) => info!(path = ?scan.path(), "Reached angles saved"),
                Err(e) => error!(path = ?scan.path(), error = %e, "Failed to save scan"),
            }
        }

        if let Some(request) = fx.request {
            self.send(request);
        }
    }

    /// Unregisters from the devices of the run. Called under the lock so a
    /// run started right after never loses its registration.
    fn detach(&self, devices: Option<Devices>) {
        if let Some((positioner, capture)) = devices {
            positioner.remove_listener(&self.positioner_listener);
            capture.remove_listener(&self.capture_listener);
        }
    }

    fn issue_move(&self, inner: &mut Inner, fx: &mut Effects) {
        let Some((positioner, _)) = inner.devices.clone() else {
            error!("Scan has no devices");
            return;
        };
        let angle = inner.targets[inner.index];
        let token = Token::fresh(inner.move_token);
        inner.move_token = Some(token);
        inner.awaiting = Some(Awaiting::Move);
        self.transition(inner, ScanState::WaitMove);
        debug!(index = inner.index, angle, %token, "Moving");
        fx.request = Some(Request::Move(positioner, angle, token));
    }

    fn issue_capture(&self, inner: &mut Inner, fx: &mut Effects) {
        let Some((_, capture)) = inner.devices.clone() else {
            error!("Scan has no devices");
            return;
        };
        let token = Token::fresh(inner.capture_token);
        inner.capture_token = Some(token);
        inner.awaiting = Some(Awaiting::Capture);
        self.transition(inner, ScanState::WaitCapture);
        debug!(index = inner.index, %token, "Capturing");
        fx.request = Some(Request::Capture(capture, inner.params, token));
    }

    fn advance(&self, inner: &mut Inner, fx: &mut Effects) {
        if inner.index + 1 < inner.targets.len() {
            inner.index += 1;
            self.issue_move(inner, fx);
        } else {
            self.finish(inner, fx);
        }
    }

    fn finish(&self, inner: &mut Inner, fx: &mut Effects) {
        inner.awaiting = None;
        inner.pending = None;
        if let Some(context) = inner.context.clone() {
            if inner.holds_context {
                context.unlock();
                inner.holds_context = false;
            }
            fx.persist = context.scan().filter(|scan| scan.path().is_some());
        }
        self.detach(inner.devices.take());
        info!(run_id = ?inner.run_id, projections = inner.captured, "Scan complete");
        self.transition(inner, ScanState::Done);
    }

    fn start(&self) -> AppResult<()> {
        let mut fx = Effects::default();
        {
            let mut inner = lock(&self.inner);
            if !inner.state.can_start() {
                warn!(state = %inner.state, "Scan already running");
                return Err(ScanError::ScanRunning(inner.state));
            }
            let context = inner.context.clone().ok_or_else(|| {
                error!("Scan context is not set");
                ScanError::NoScanContext
            })?;
            let (positioner, capture) = context.devices().map_err(|e| {
                error!(error = %e, "Scan context incomplete");
                e
            })?;
            if !positioner.is_ready() {
                warn!("Positioner is not ready");
                return Err(ScanError::DeviceNotReady(DeviceRole::Positioner));
            }
            if !capture.is_ready() {
                warn!("Capture device is not ready");
                return Err(ScanError::DeviceNotReady(DeviceRole::Capture));
            }
            let plan = context.begin().map_err(|e| {
                error!(error = %e, "Cannot start scan");
                e
            })?;

            positioner.add_listener(self.positioner_listener.clone());
            capture.add_listener(self.capture_listener.clone());

            let run_id = Uuid::new_v4();
            info!(
                %run_id,
                projections = plan.targets.len(),
                resolution = plan.resolution,
                "Starting scan"
            );

            inner.devices = Some((positioner, capture));
            inner.holds_context = true;
            inner.run_id = Some(run_id);
            inner.targets = plan.targets;
            inner.params = plan.params;
            inner.index = 0;
            inner.captured = 0;
            inner.pending = None;
            self.issue_move(&mut inner, &mut fx);
        }
        self.apply(fx);
        Ok(())
    }

    fn pause(&self) -> AppResult<()> {
        {
            let mut inner = lock(&self.inner);
            let state = inner.state;
            if state.can_pause() {
                info!(index = inner.index, "Pause requested");
                self.transition(&mut inner, ScanState::WaitPause);
            } else if matches!(state, ScanState::WaitPause | ScanState::Paused) {
                debug!(%state, "Already pausing");
            } else {
                return Err(ScanError::NotRunning(state));
            }
        }
        self.deliver_notifications();
        Ok(())
    }

    fn resume(&self) -> AppResult<()> {
        let mut fx = Effects::default();
        {
            let mut inner = lock(&self.inner);
            if !inner.state.can_resume() {
                return Err(ScanError::NotPaused(inner.state));
            }
            let Some((positioner, capture)) = inner.devices.clone() else {
                return Err(ScanError::NoScanContext);
            };
            if !positioner.is_ready() {
                warn!("Cannot resume, positioner is not ready");
                return Err(ScanError::DeviceNotReady(DeviceRole::Positioner));
            }
            if !capture.is_ready() {
                warn!("Cannot resume, capture device is not ready");
                return Err(ScanError::DeviceNotReady(DeviceRole::Capture));
            }

            let pending = inner.pending.take().unwrap_or(Pending::Retry(Awaiting::Move));
            info!(index = inner.index, ?pending, "Resuming scan");
            self.transition(&mut inner, ScanState::Resuming);
            match pending {
                Pending::Capture | Pending::Retry(Awaiting::Capture) => {
                    self.issue_capture(&mut inner, &mut fx)
                }
                Pending::Retry(Awaiting::Move) => self.issue_move(&mut inner, &mut fx),
                Pending::Advance => self.advance(&mut inner, &mut fx),
            }
        }
        self.apply(fx);
        Ok(())
    }

    fn stop(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.state.is_active() {
                info!(run_id = ?inner.run_id, index = inner.index, "Scan aborted");
            }
            if inner.holds_context {
                if let Some(context) = &inner.context {
                    context.unlock();
                }
                inner.holds_context = false;
            }
            self.detach(inner.devices.take());
            // Tokens are kept so the next run draws different ones; with nothing
            // awaited every late completion is rejected.
            inner.awaiting = None;
            inner.pending = None;
            self.transition(&mut inner, ScanState::Standby);
        }
        self.deliver_notifications();
    }

    fn reset(&self) -> AppResult<()> {
        {
            let mut inner = lock(&self.inner);
            let state = inner.state;
            match state {
                ScanState::Done => self.transition(&mut inner, ScanState::Standby),
                ScanState::Standby => {}
                _ => return Err(ScanError::ScanRunning(state)),
            }
        }
        self.deliver_notifications();
        Ok(())
    }

    fn on_position_done(&self, angle: f64, token: Token) {
        let mut fx = Effects::default();
        {
            let mut inner = lock(&self.inner);
            if inner.awaiting != Some(Awaiting::Move) {
                debug!(state = %inner.state, %token, "Move completion not expected, ignored");
                return;
            }
            if inner.move_token != Some(token) {
                error!(%token, expected = ?inner.move_token, "Move: wrong token");
                return;
            }
            inner.awaiting = None;
            if let Some(context) = &inner.context {
                context.record_reached(angle);
            }
            debug!(index = inner.index, angle, "Position reached");

            if inner.state == ScanState::WaitPause {
                inner.pending = Some(Pending::Capture);
                info!(index = inner.index, "Scan paused after move");
                self.transition(&mut inner, ScanState::Paused);
            } else {
                self.issue_capture(&mut inner, &mut fx);
            }
        }
        self.apply(fx);
    }

    fn on_capture_done(
        &self,
        data: Option<Bytes>,
        stride_pixel: u32,
        stride_row: u32,
        sensor: u32,
        token: Token,
    ) {
        let mut fx = Effects::default();
        {
            let mut inner = lock(&self.inner);
            if inner.awaiting != Some(Awaiting::Capture) {
                debug!(state = %inner.state, %token, "Capture completion not expected, ignored");
                return;
            }
            if inner.capture_token != Some(token) {
                error!(%token, expected = ?inner.capture_token, "Capture: wrong token");
                return;
            }
            inner.awaiting = None;
            inner.captured += 1;

            let index = inner.index;
            let angle = inner
                .context
                .as_ref()
                .and_then(|c| c.reached(index))
                .unwrap_or(inner.targets[index]);
            info!(index, angle, "Captured projection");
            fx.projection = inner.run_id.map(|run_id| Projection {
                run_id,
                index,
                angle,
                data,
                stride_pixel,
                stride_row,
                sensor,
                captured_at: Utc::now(),
            });

            if inner.state == ScanState::WaitPause {
                inner.pending = Some(Pending::Advance);
                info!(index, "Scan paused after capture");
                self.transition(&mut inner, ScanState::Paused);
            } else {
                self.advance(&mut inner, &mut fx);
            }
        }
        self.apply(fx);
    }

    fn on_link_lost(&self, role: DeviceRole) {
        {
            let mut inner = lock(&self.inner);
            if !matches!(
                inner.state,
                ScanState::WaitMove | ScanState::WaitCapture | ScanState::WaitPause
            ) {
                return;
            }
            let state = inner.state;
            match inner.awaiting {
                Some(awaiting) if awaiting.role() == role => {
                    warn!(%role, index = inner.index, "Device lost while waiting for it, scan paused");
                    inner.awaiting = None;
                    inner.pending = Some(Pending::Retry(awaiting));
                    self.transition(&mut inner, ScanState::Paused);
                }
                _ if state != ScanState::WaitPause => {
                    warn!(%role, index = inner.index, "Device lost, scan pauses after the current step");
                    self.transition(&mut inner, ScanState::WaitPause);
                }
                _ => {}
            }
        }
        self.deliver_notifications();
    }
}

/// Drives a scan over a [`ScanContext`].
///
/// Cheap to clone; all clones control the same scan.
///
/// # Example
///
/// ```rust,ignore
/// let orchestrator = ScanOrchestrator::new();
/// orchestrator.set_context(context)?;
/// orchestrator.set_state_callback(Arc::new(|state| println!("{state}")));
/// orchestrator.start()?;
/// ```
#[derive(Clone)]
pub struct ScanOrchestrator {
    core: Arc<OrchestratorCore>,
}

impl Default for ScanOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanOrchestrator {
    /// Creates an orchestrator in `Standby` without a context.
    pub fn new() -> Self {
        Self {
            core: Arc::new_cyclic(OrchestratorCore::new),
        }
    }

    /// Supplies the scan context. Rejected while a scan is running.
    pub fn set_context(&self, context: ScanContext) -> AppResult<()> {
        let mut inner = lock(&self.core.inner);
        if inner.state.is_active() {
            error!(state = %inner.state, "Cannot replace the scan context while a scan is running");
            return Err(ScanError::ScanRunning(inner.state));
        }
        inner.context = Some(context);
        Ok(())
    }

    /// Current scan context.
    pub fn context(&self) -> Option<ScanContext> {
        lock(&self.core.inner).context.clone()
    }

    /// Installs the state change callback, replacing any previous one.
    pub fn set_state_callback(&self, callback: StateCallback) {
        *lock(&self.core.on_state) = Some(callback);
    }

    /// Installs the projection sink, replacing any previous one.
    pub fn set_projection_sink(&self, sink: ProjectionSink) {
        *lock(&self.core.on_projection) = Some(sink);
    }

    /// Receiver observing the current state.
    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.core.state_tx.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        lock(&self.core.inner).state
    }

    /// Progress snapshot.
    pub fn status(&self) -> ScanStatus {
        let inner = lock(&self.core.inner);
        ScanStatus {
            state: inner.state,
            run_id: inner.run_id,
            captured: inner.captured,
            total: inner.targets.len(),
            target_angle: inner.targets.get(inner.index).copied(),
        }
    }

    /// Starts a scan from `Standby` or `Done`.
    ///
    /// # Errors
    ///
    /// Precondition errors leave the orchestrator unchanged:
    /// - [`ScanError::ScanRunning`] if a scan is active
    /// - [`ScanError::NoScanContext`] / [`ScanError::MissingCollaborator`]
    /// - [`ScanError::DeviceNotReady`] if a device is not connected
    /// - [`ScanError::InvalidScan`] / [`ScanError::ContextLocked`]
    pub fn start(&self) -> AppResult<()> {
        self.core.start()
    }

    /// Requests a pause at the next step boundary.
    pub fn pause(&self) -> AppResult<()> {
        self.core.pause()
    }

    /// Continues a paused scan by issuing its next request.
    pub fn resume(&self) -> AppResult<()> {
        self.core.resume()
    }

    /// Aborts any scan and returns to `Standby`.
    pub fn stop(&self) {
        self.core.stop()
    }

    /// Acknowledges a finished scan, returning to `Standby`.
    pub fn reset(&self) -> AppResult<()> {
        self.core.reset()
    }

    /// Waits until `predicate` holds for the current state.
    pub async fn wait_for(&self, predicate: impl FnMut(&ScanState) -> bool) -> ScanState {
        let mut rx = self.subscribe();
        let reached = match rx.wait_for(predicate).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCapture, MockPositioner};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    struct Rig {
        positioner: Arc<MockPositioner>,
        capture: Arc<MockCapture>,
        context: ScanContext,
        orchestrator: ScanOrchestrator,
        states: Arc<Mutex<Vec<ScanState>>>,
        projections: Arc<Mutex<Vec<Projection>>>,
    }

    impl Rig {
        fn new(scan: ScanRecord) -> Self {
            let positioner = Arc::new(MockPositioner::new());
            let capture = Arc::new(MockCapture::new());
            let context = ScanContext::with_devices(positioner.clone(), capture.clone());
            context.set_scan(scan).unwrap();

            let orchestrator = ScanOrchestrator::new();
            orchestrator.set_context(context.clone()).unwrap();

            let states = Arc::new(Mutex::new(Vec::new()));
            let sink = states.clone();
            orchestrator.set_state_callback(Arc::new(move |s| sink.lock().unwrap().push(s)));

            let projections = Arc::new(Mutex::new(Vec::new()));
            let sink = projections.clone();
            orchestrator.set_projection_sink(Arc::new(move |p| sink.lock().unwrap().push(p)));

            Self {
                positioner,
                capture,
                context,
                orchestrator,
                states,
                projections,
            }
        }

        fn finish_move(&self) {
            assert!(self.positioner.complete_last_move());
        }

        fn finish_capture(&self) {
            assert!(self
                .capture
                .complete_last_capture(Some(Bytes::from_static(b"raw"))));
        }

        fn state(&self) -> ScanState {
            self.orchestrator.state()
        }

        fn states(&self) -> Vec<ScanState> {
            self.states.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_full_scan_visits_every_angle() {
        let rig = Rig::new(ScanRecord::new(4, 360.0));
        rig.orchestrator.start().unwrap();
        assert_eq!(rig.state(), ScanState::WaitMove);
        assert!(rig.context.is_locked());
        assert_eq!(rig.positioner.listener_count(), 1);

        for _ in 0..4 {
            rig.finish_move();
            assert_eq!(rig.state(), ScanState::WaitCapture);
            rig.finish_capture();
        }

        assert_eq!(rig.state(), ScanState::Done);
        let angles: Vec<f64> = rig.positioner.moves().iter().map(|(a, _)| *a).collect();
        assert_eq!(angles, vec![0.0, 90.0, 180.0, 270.0]);
        assert_eq!(rig.capture.captures().len(), 4);

        let scan = rig.context.scan().unwrap();
        assert_eq!(scan.reached_angles, vec![0.0, 90.0, 180.0, 270.0]);
        assert!(scan.is_complete());
        assert!(!rig.context.is_locked());
        assert_eq!(rig.positioner.listener_count(), 0);
        assert_eq!(rig.capture.listener_count(), 0);

        let indices: Vec<usize> = rig.projections.lock().unwrap().iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        use ScanState::*;
        assert_eq!(
            rig.states(),
            vec![
                WaitMove, WaitCapture, WaitMove, WaitCapture, WaitMove, WaitCapture, WaitMove,
                WaitCapture, Done
            ]
        );
        assert_eq!(rig.orchestrator.status().captured, 4);
    }

    #[test]
    fn test_start_preconditions() {
        let orchestrator = ScanOrchestrator::new();
        assert!(matches!(orchestrator.start(), Err(ScanError::NoScanContext)));

        let positioner = Arc::new(MockPositioner::new());
        let capture = Arc::new(MockCapture::new());
        let context = ScanContext::with_devices(positioner.clone(), capture.clone());
        orchestrator.set_context(context.clone()).unwrap();
        assert!(matches!(
            orchestrator.start(),
            Err(ScanError::MissingCollaborator("scan"))
        ));

        context.set_scan(ScanRecord::new(0, 360.0)).unwrap();
        assert!(matches!(orchestrator.start(), Err(ScanError::InvalidScan(_))));

        context.set_scan(ScanRecord::new(10, 360.0)).unwrap();
        positioner.set_ready(false);
        assert!(matches!(
            orchestrator.start(),
            Err(ScanError::DeviceNotReady(DeviceRole::Positioner))
        ));
        positioner.set_ready(true);
        capture.set_ready(false);
        assert!(matches!(
            orchestrator.start(),
            Err(ScanError::DeviceNotReady(DeviceRole::Capture))
        ));

        assert_eq!(orchestrator.state(), ScanState::Standby);
        assert!(positioner.moves().is_empty());
        assert!(!context.is_locked());
        assert_eq!(positioner.listener_count(), 0);

        capture.set_ready(true);
        orchestrator.start().unwrap();
        assert!(matches!(
            orchestrator.start(),
            Err(ScanError::ScanRunning(ScanState::WaitMove))
        ));
        assert_eq!(positioner.moves().len(), 1);
    }

    #[test]
    #[traced_test]
    fn test_wrong_token_is_ignored() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        rig.orchestrator.start().unwrap();

        let (angle, token) = rig.positioner.last_move().unwrap();
        rig.positioner.complete_move(angle, Token(token.value() % Token::MAX + 1));

        assert_eq!(rig.state(), ScanState::WaitMove);
        assert!(rig.capture.captures().is_empty());
        assert!(rig.context.scan().unwrap().reached_angles.is_empty());
        assert!(logs_contain("wrong token"));

        rig.finish_move();
        let (_, token) = rig.capture.last_capture().unwrap();
        rig.capture
            .complete_capture(Token(token.value() % Token::MAX + 1), None);
        assert_eq!(rig.state(), ScanState::WaitCapture);
        assert!(rig.projections.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_completion_is_ignored() {
        let rig = Rig::new(ScanRecord::new(3, 90.0));
        rig.orchestrator.start().unwrap();

        rig.finish_move();
        rig.finish_move();

        assert_eq!(rig.capture.captures().len(), 1);
        assert_eq!(rig.context.scan().unwrap().reached_angles.len(), 1);
        assert_eq!(rig.state(), ScanState::WaitCapture);
    }

    #[test]
    fn test_pause_at_move_boundary() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        rig.orchestrator.start().unwrap();

        rig.orchestrator.pause().unwrap();
        assert_eq!(rig.state(), ScanState::WaitPause);

        rig.finish_move();
        assert_eq!(rig.state(), ScanState::Paused);
        assert!(rig.capture.captures().is_empty());
        assert_eq!(rig.context.scan().unwrap().reached_angles, vec![0.0]);
        assert!(rig.context.is_locked());

        rig.orchestrator.resume().unwrap();
        assert_eq!(rig.state(), ScanState::WaitCapture);
        assert_eq!(rig.capture.captures().len(), 1);
        assert_eq!(rig.positioner.moves().len(), 1);

        let states = rig.states();
        assert_eq!(
            &states[states.len() - 4..],
            &[
                ScanState::WaitPause,
                ScanState::Paused,
                ScanState::Resuming,
                ScanState::WaitCapture
            ]
        );
    }

    #[test]
    fn test_pause_at_capture_boundary() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        rig.orchestrator.start().unwrap();
        rig.finish_move();

        rig.orchestrator.pause().unwrap();
        rig.finish_capture();

        assert_eq!(rig.state(), ScanState::Paused);
        assert_eq!(rig.projections.lock().unwrap().len(), 1);
        assert_eq!(rig.positioner.moves().len(), 1);

        rig.orchestrator.resume().unwrap();
        assert_eq!(rig.state(), ScanState::WaitMove);
        assert_eq!(rig.positioner.last_move().unwrap().0, 90.0);
    }

    #[test]
    fn test_pause_before_last_capture_completes_then_resume_finishes() {
        let rig = Rig::new(ScanRecord::new(1, 360.0));
        rig.orchestrator.start().unwrap();
        rig.finish_move();
        rig.orchestrator.pause().unwrap();
        rig.finish_capture();
        assert_eq!(rig.state(), ScanState::Paused);

        rig.orchestrator.resume().unwrap();
        assert_eq!(rig.state(), ScanState::Done);
        assert_eq!(rig.positioner.moves().len(), 1);
        assert!(!rig.context.is_locked());
    }

    #[test]
    fn test_pause_and_resume_preconditions() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        assert!(matches!(
            rig.orchestrator.pause(),
            Err(ScanError::NotRunning(ScanState::Standby))
        ));
        assert!(matches!(
            rig.orchestrator.resume(),
            Err(ScanError::NotPaused(ScanState::Standby))
        ));

        rig.orchestrator.start().unwrap();
        assert!(matches!(
            rig.orchestrator.resume(),
            Err(ScanError::NotPaused(ScanState::WaitMove))
        ));

        rig.orchestrator.pause().unwrap();
        rig.orchestrator.pause().unwrap();
        rig.finish_move();

        rig.capture.set_ready(false);
        assert!(matches!(
            rig.orchestrator.resume(),
            Err(ScanError::DeviceNotReady(DeviceRole::Capture))
        ));
        assert_eq!(rig.state(), ScanState::Paused);
        assert!(rig.capture.captures().is_empty());
    }

    #[test]
    fn test_stop_releases_everything() {
        let rig = Rig::new(ScanRecord::new(3, 90.0));
        rig.orchestrator.start().unwrap();
        rig.finish_move();
        let (_, stale) = rig.capture.last_capture().unwrap();

        rig.orchestrator.stop();
        assert_eq!(rig.state(), ScanState::Standby);
        assert!(!rig.context.is_locked());
        assert_eq!(rig.positioner.listener_count(), 0);
        assert_eq!(rig.capture.listener_count(), 0);
        rig.context.set_scan(ScanRecord::new(2, 90.0)).unwrap();

        rig.orchestrator.start().unwrap();
        let first_token = rig.positioner.moves()[0].1;
        let second_token = rig.positioner.moves()[1].1;
        assert_ne!(first_token, second_token);

        rig.capture.complete_capture(stale, None);
        assert_eq!(rig.state(), ScanState::WaitMove);
        assert!(rig.projections.lock().unwrap().is_empty());
    }

    #[test]
    fn test_link_lost_while_awaited_retries_on_resume() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        rig.orchestrator.start().unwrap();
        let (_, lost) = rig.positioner.last_move().unwrap();

        rig.positioner.disconnect();
        assert_eq!(rig.state(), ScanState::Paused);
        assert!(matches!(
            rig.orchestrator.resume(),
            Err(ScanError::DeviceNotReady(DeviceRole::Positioner))
        ));

        rig.positioner.set_ready(true);
        rig.orchestrator.resume().unwrap();
        let moves = rig.positioner.moves();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[1].0, 0.0);
        assert_ne!(moves[1].1, lost);

        rig.positioner.complete_move(0.0, lost);
        assert_eq!(rig.state(), ScanState::WaitMove);
        rig.finish_move();
        assert_eq!(rig.state(), ScanState::WaitCapture);
    }

    #[test]
    fn test_link_lost_on_idle_device_pauses_at_boundary() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        rig.orchestrator.start().unwrap();

        rig.capture.disconnect();
        assert_eq!(rig.state(), ScanState::WaitPause);

        rig.finish_move();
        assert_eq!(rig.state(), ScanState::Paused);
        assert!(rig.capture.captures().is_empty());

        rig.capture.set_ready(true);
        rig.orchestrator.resume().unwrap();
        assert_eq!(rig.capture.captures().len(), 1);
    }

    #[test]
    fn test_done_writes_reached_angles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.json");
        let rig = Rig::new(ScanRecord::new(2, 10.0).with_path(&path));

        rig.orchestrator.start().unwrap();
        for _ in 0..2 {
            rig.finish_move();
            rig.finish_capture();
        }

        let saved = ScanRecord::load(&path).unwrap();
        assert_eq!(saved.reached_angles, vec![0.0, 5.0]);
    }

    #[test]
    fn test_reset_and_restart_from_done() {
        let rig = Rig::new(ScanRecord::new(1, 360.0));
        rig.orchestrator.start().unwrap();
        rig.finish_move();
        rig.finish_capture();
        assert_eq!(rig.state(), ScanState::Done);

        rig.orchestrator.start().unwrap();
        assert_eq!(rig.state(), ScanState::WaitMove);
        assert!(rig.context.scan().unwrap().reached_angles.is_empty());
        assert!(matches!(
            rig.orchestrator.reset(),
            Err(ScanError::ScanRunning(ScanState::WaitMove))
        ));

        rig.finish_move();
        rig.finish_capture();
        rig.orchestrator.reset().unwrap();
        assert_eq!(rig.state(), ScanState::Standby);
        assert_eq!(rig.states().last(), Some(&ScanState::Standby));
    }

    #[test]
    fn test_context_cannot_change_while_running() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        rig.orchestrator.start().unwrap();

        assert!(matches!(
            rig.orchestrator.set_context(ScanContext::new()),
            Err(ScanError::ScanRunning(_))
        ));
        assert!(matches!(
            rig.context.set_scan(ScanRecord::default()),
            Err(ScanError::ContextLocked)
        ));
    }

    #[test]
    fn test_callbacks_may_call_back_in() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        let handle = rig.orchestrator.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        rig.orchestrator.set_state_callback(Arc::new(move |state| {
            sink.lock().unwrap().push((state, handle.status().state));
        }));

        rig.orchestrator.start().unwrap();
        rig.finish_move();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], (ScanState::WaitCapture, ScanState::WaitCapture));
    }

    #[tokio::test]
    async fn test_subscribe_observes_state() {
        let rig = Rig::new(ScanRecord::new(1, 360.0));
        let rx = rig.orchestrator.subscribe();
        assert_eq!(*rx.borrow(), ScanState::Standby);

        rig.orchestrator.start().unwrap();
        rig.finish_move();
        rig.finish_capture();

        let state = rig.orchestrator.wait_for(|s| *s == ScanState::Done).await;
        assert_eq!(state, ScanState::Done);
        assert_eq!(*rx.borrow(), ScanState::Done);
    }

    #[test]
    fn test_stop_while_pausing_drops_the_inflight_move() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        rig.orchestrator.start().unwrap();
        let (angle, inflight) = rig.positioner.last_move().unwrap();
        rig.orchestrator.pause().unwrap();
        assert_eq!(rig.state(), ScanState::WaitPause);

        rig.orchestrator.stop();
        assert_eq!(rig.state(), ScanState::Standby);
        assert!(!rig.context.is_locked());
        assert_eq!(rig.positioner.listener_count(), 0);
        assert_eq!(rig.capture.listener_count(), 0);

        rig.positioner.complete_move(angle, inflight);
        assert_eq!(rig.state(), ScanState::Standby);
        assert!(rig.context.scan().unwrap().reached_angles.is_empty());
        assert_eq!(rig.positioner.moves().len(), 1);
        assert!(rig.capture.captures().is_empty());
        assert!(matches!(
            rig.orchestrator.resume(),
            Err(ScanError::NotPaused(ScanState::Standby))
        ));
        assert_eq!(rig.states().last(), Some(&ScanState::Standby));
    }

    #[test]
    fn test_stop_while_paused_cannot_be_resumed() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        rig.orchestrator.start().unwrap();
        rig.orchestrator.pause().unwrap();
        rig.finish_move();
        assert_eq!(rig.state(), ScanState::Paused);

        rig.orchestrator.stop();
        assert_eq!(rig.state(), ScanState::Standby);
        assert!(!rig.context.is_locked());
        assert_eq!(rig.positioner.listener_count(), 0);
        assert!(matches!(
            rig.orchestrator.resume(),
            Err(ScanError::NotPaused(ScanState::Standby))
        ));
        assert!(rig.capture.captures().is_empty());
        assert_eq!(rig.positioner.moves().len(), 1);

        // A fresh run starts from the first angle.
        rig.orchestrator.start().unwrap();
        assert_eq!(rig.state(), ScanState::WaitMove);
        assert_eq!(rig.positioner.last_move().unwrap().0, 0.0);
        assert_eq!(rig.positioner.moves().len(), 2);
    }

    #[test]
    fn test_stop_after_link_loss_ignores_the_lost_request() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        rig.orchestrator.start().unwrap();
        let (angle, lost) = rig.positioner.last_move().unwrap();

        rig.positioner.disconnect();
        assert_eq!(rig.state(), ScanState::Paused);
        rig.orchestrator.stop();
        assert_eq!(rig.state(), ScanState::Standby);
        assert!(!rig.context.is_locked());

        rig.positioner.set_ready(true);
        rig.positioner.complete_move(angle, lost);
        assert_eq!(rig.state(), ScanState::Standby);
        assert!(rig.context.scan().unwrap().reached_angles.is_empty());
        assert_eq!(rig.positioner.moves().len(), 1);
        assert!(rig.capture.captures().is_empty());
        assert!(rig.orchestrator.resume().is_err());
    }

    #[test]
    fn test_stop_after_idle_device_loss() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        rig.orchestrator.start().unwrap();

        rig.capture.disconnect();
        assert_eq!(rig.state(), ScanState::WaitPause);
        rig.orchestrator.stop();
        assert_eq!(rig.state(), ScanState::Standby);

        rig.positioner.complete_last_move();
        assert_eq!(rig.state(), ScanState::Standby);
        assert!(rig.capture.captures().is_empty());
        assert_eq!(rig.capture.listener_count(), 0);
    }

    #[test]
    fn test_stop_from_projection_sink_sends_nothing_more() {
        let rig = Rig::new(ScanRecord::new(3, 180.0));
        let handle = rig.orchestrator.clone();
        let delivered = Arc::new(Mutex::new(0usize));
        let count = delivered.clone();
        rig.orchestrator.set_projection_sink(Arc::new(move |_| {
            *count.lock().unwrap() += 1;
            handle.stop();
        }));

        rig.orchestrator.start().unwrap();
        rig.finish_move();
        rig.finish_capture();

        assert_eq!(*delivered.lock().unwrap(), 1);
        assert_eq!(rig.state(), ScanState::Standby);
        assert_eq!(rig.positioner.moves().len(), 1);
        assert_eq!(rig.capture.captures().len(), 1);
        assert_eq!(rig.states().last(), Some(&rig.state()));
        assert!(!rig.context.is_locked());
        assert_eq!(rig.positioner.listener_count(), 0);
        assert_eq!(rig.capture.listener_count(), 0);
    }

    #[test]
    fn test_stop_from_state_callback_sends_nothing_more() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        let handle = rig.orchestrator.clone();
        let sink = rig.states.clone();
        rig.orchestrator.set_state_callback(Arc::new(move |state| {
            sink.lock().unwrap().push(state);
            if state == ScanState::WaitCapture {
                handle.stop();
            }
        }));

        rig.orchestrator.start().unwrap();
        rig.finish_move();

        assert_eq!(rig.state(), ScanState::Standby);
        assert!(rig.capture.captures().is_empty());
        assert_eq!(
            rig.states(),
            vec![ScanState::WaitMove, ScanState::WaitCapture, ScanState::Standby]
        );
        assert!(!rig.context.is_locked());
    }

    #[test]
    fn test_pause_from_state_callback_parks_after_capture() {
        let rig = Rig::new(ScanRecord::new(2, 180.0));
        let handle = rig.orchestrator.clone();
        let sink = rig.states.clone();
        rig.orchestrator.set_state_callback(Arc::new(move |state| {
            sink.lock().unwrap().push(state);
            if state == ScanState::WaitCapture {
                handle.pause().unwrap();
            }
        }));

        rig.orchestrator.start().unwrap();
        rig.finish_move();
        assert_eq!(rig.state(), ScanState::WaitPause);
        assert_eq!(rig.capture.captures().len(), 1);

        rig.finish_capture();
        assert_eq!(rig.state(), ScanState::Paused);
        assert_eq!(rig.positioner.moves().len(), 1);
        assert_eq!(
            rig.states(),
            vec![
                ScanState::WaitMove,
                ScanState::WaitCapture,
                ScanState::WaitPause,
                ScanState::Paused
            ]
        );
    }
}
