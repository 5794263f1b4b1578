//! Scan execution.
//!
//! - [`scan`]: the scan description and its JSON file
//! - [`context`]: scan plus devices, locked while a scan runs
//! - [`orchestrator`]: the move/capture state machine
//! - [`projection`]: captured images and where they go
//! - [`state`]: orchestrator states

pub mod context;
pub mod orchestrator;
pub mod projection;
pub mod scan;
pub mod state;

pub use context::ScanContext;
pub use orchestrator::{ScanOrchestrator, ScanStatus, StateCallback};
pub use projection::{Projection, ProjectionSink, ProjectionWriter};
pub use scan::ScanRecord;
pub use state::ScanState;
