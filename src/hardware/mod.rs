//! Scanner Hardware
//!
//! Capability traits, the network links serving the two device roles, and
//! in-process stand-ins for testing without physical hardware.
//!
//! - [`capabilities`]: `Positioner` / `CaptureDevice` traits and listener interfaces
//! - [`positioner`] / [`capture`]: TCP links to the turntable and camera controllers
//! - [`mock`]: in-memory devices driven directly by tests
//! - [`sim`]: TCP clients that behave like the real controllers

pub mod capabilities;
pub mod capture;
pub mod mock;
pub mod positioner;
pub mod sim;

pub use capabilities::{
    CaptureDevice, CaptureListener, CaptureParams, LoggingCaptureListener,
    LoggingPositionerListener, Positioner, PositionerListener,
};
pub use capture::{CaptureLink, CaptureProtocol};
pub use mock::{MockCapture, MockPositioner};
pub use positioner::{PositionerLink, PositionerProtocol};
pub use sim::{SimulatedCamera, SimulatedPositioner};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known TCP port of the positioner link.
pub const POSITIONER_PORT: u16 = 25599;
/// Well-known TCP port of the capture link.
pub const CAPTURE_PORT: u16 = 25588;

/// The two kinds of device a scan talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Rotates the sample.
    Positioner,
    /// Takes the projection images.
    Capture,
}

impl DeviceRole {
    /// Human readable name, also used as log field value.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceRole::Positioner => "Positioner",
            DeviceRole::Capture => "Capture",
        }
    }

    /// Port the device expects its link on.
    pub fn default_port(self) -> u16 {
        match self {
            DeviceRole::Positioner => POSITIONER_PORT,
            DeviceRole::Capture => CAPTURE_PORT,
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
