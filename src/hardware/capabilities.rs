//! Device Capabilities
//!
//! The scan orchestrator never talks to sockets directly. It drives two small
//! capability traits:
//!
//! - [`Positioner`]: rotates the sample to an angle
//! - [`CaptureDevice`]: takes one projection image
//!
//! Both are request/notify interfaces: a request queues a command frame and
//! returns immediately, the completion arrives later through a listener
//! ([`PositionerListener`], [`CaptureListener`]) registered on the device.
//! Every request carries a [`Token`] that the device echoes in its response.
//!
//! The network-backed links in [`crate::hardware::positioner`] and
//! [`crate::hardware::capture`] implement these traits, as do the in-memory
//! devices in [`crate::hardware::mock`].
//!
//! # Thread Safety
//! - All methods take `&self`; implementations use interior mutability
//! - Listener callbacks run synchronously on the thread/task that received the
//!   response, so they must not block

use crate::error::AppResult;
use crate::hardware::DeviceRole;
use crate::network::protocol::Token;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Per-projection capture timings, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureParams {
    /// How long the shutter button is held down.
    #[serde(rename = "shutterlen")]
    pub shutter_ms: u32,
    /// Exposure time.
    #[serde(rename = "exposure")]
    pub exposure_ms: u32,
    /// How long auto focus is active before the shutter.
    #[serde(rename = "focuslen")]
    pub focus_ms: u32,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            shutter_ms: 500,
            exposure_ms: 500,
            focus_ms: 500,
        }
    }
}

/// Observer of positioner events.
pub trait PositionerListener: Send + Sync {
    /// A move request finished at `angle` degrees.
    fn on_position_done(&self, angle: f64, token: Token);

    /// The device reported its current angle.
    fn on_status(&self, _angle: f64) {}

    /// The connection to the device of `role` was lost.
    fn on_link_lost(&self, _role: DeviceRole) {}
}

/// Observer of capture device events.
pub trait CaptureListener: Send + Sync {
    /// A capture request finished. `data` holds the raw image if the device sent one.
    fn on_capture_done(
        &self,
        data: Option<Bytes>,
        stride_pixel: u32,
        stride_row: u32,
        sensor: u32,
        token: Token,
    );

    /// A diagnostic capture arrived.
    fn on_test_capture(&self, _data: Option<Bytes>, _token: Token) {}

    /// The connection to the device of `role` was lost.
    fn on_link_lost(&self, _role: DeviceRole) {}
}

/// Capability: rotate the sample.
///
/// # Contract
/// - `move_to` only queues the request; completion is reported through
///   [`PositionerListener::on_position_done`] with the same token
/// - When the device is not ready the request is dropped with a warning
pub trait Positioner: Send + Sync {
    /// True iff a device is connected.
    fn is_ready(&self) -> bool;

    /// Requests a move to `angle` degrees.
    fn move_to(&self, angle: f64, token: Token) -> AppResult<()>;

    /// Registers a listener (appended to the dispatch order).
    fn add_listener(&self, listener: Arc<dyn PositionerListener>);

    /// Unregisters a listener; false if it was not registered.
    fn remove_listener(&self, listener: &Arc<dyn PositionerListener>) -> bool;
}

/// Capability: capture one projection image.
///
/// # Contract
/// - `capture` only queues the request; completion is reported through
///   [`CaptureListener::on_capture_done`] with the same token
/// - When the device is not ready the request is dropped with a warning
pub trait CaptureDevice: Send + Sync {
    /// True iff a device is connected.
    fn is_ready(&self) -> bool;

    /// Requests a capture with the given timings.
    fn capture(&self, params: &CaptureParams, token: Token) -> AppResult<()>;

    /// Registers a listener (appended to the dispatch order).
    fn add_listener(&self, listener: Arc<dyn CaptureListener>);

    /// Unregisters a listener; false if it was not registered.
    fn remove_listener(&self, listener: &Arc<dyn CaptureListener>) -> bool;
}

/// Default positioner listener: logs every event.
#[derive(Debug, Default)]
pub struct LoggingPositionerListener;

impl PositionerListener for LoggingPositionerListener {
    fn on_position_done(&self, angle: f64, token: Token) {
        info!(angle, %token, "Positioner: move done");
    }

    fn on_status(&self, angle: f64) {
        info!(angle, "Positioner: status");
    }
}

/// Default capture listener: logs every event.
#[derive(Debug, Default)]
pub struct LoggingCaptureListener;

impl CaptureListener for LoggingCaptureListener {
    fn on_capture_done(
        &self,
        data: Option<Bytes>,
        stride_pixel: u32,
        stride_row: u32,
        sensor: u32,
        token: Token,
    ) {
        info!(
            %token,
            stride_pixel,
            stride_row,
            sensor,
            bytes = data.as_ref().map_or(0, Bytes::len),
            "Capture: raw image received"
        );
    }

    fn on_test_capture(&self, data: Option<Bytes>, token: Token) {
        info!(
            %token,
            bytes = data.as_ref().map_or(0, Bytes::len),
            "Capture: test image received"
        );
    }
}
