//! # CT Scan Core Library
//!
//! Device protocol and scan orchestration for a turntable computed-tomography
//! rig. Two hardware controllers connect to this process over TCP: a
//! positioner that rotates the sample and a camera that captures projection
//! images. The scan orchestrator walks a scan through its angles, moving and
//! capturing one step at a time, and supports pause, resume and abort.
//!
//! ## Crate Structure
//!
//! - **`network`**: the fixed 33-byte frame codec, the generic TCP device link
//!   and the listener registry.
//! - **`hardware`**: capability traits at the orchestrator seam, the positioner
//!   and capture links, mock devices and TCP device simulators.
//! - **`experiment`**: scan records, the scan context, the orchestrator state
//!   machine and projection output.
//! - **`config`**: layered configuration via `figment`.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: the crate-wide `ScanError` enum.

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod network;

pub use error::{AppResult, ScanError};
pub use experiment::{ScanContext, ScanOrchestrator, ScanRecord, ScanState};
pub use hardware::{CaptureLink, DeviceRole, PositionerLink};
