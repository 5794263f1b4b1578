//! Scan lifecycle states.

use serde::{Deserialize, Serialize};

/// Orchestrator state.
///
/// # State Machine
///
/// ```text
///            start                move done             capture done (last)
/// Standby ─────────> WaitMove ─────────────> WaitCapture ─────────────────> Done
///    ▲                  ▲  │ pause                │ pause                     │
///    │                  │  ▼                      ▼                           │
///    │                  │ WaitPause <─────────────┘                           │
///    │                  │  │ next completion                                  │
///    │        Resuming <──── Paused                                           │
///    │                                                                        │
///    └──────────────────────────── stop (any) / reset (Done) ─────────────────┘
/// ```
///
/// `Resuming` is only observed through notifications: `resume()` passes
/// through it on the way to `WaitMove`, `WaitCapture` or `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// No scan running.
    #[default]
    Standby,
    /// Waiting for the positioner to reach the current target.
    WaitMove,
    /// Waiting for the capture device to deliver the current projection.
    WaitCapture,
    /// Pause requested; waiting for the in-flight request to complete.
    WaitPause,
    /// Paused between steps.
    Paused,
    /// Resume requested, about to re-issue the next request.
    Resuming,
    /// Every target angle has been captured.
    Done,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanState::Standby => "standby",
            ScanState::WaitMove => "wait_move",
            ScanState::WaitCapture => "wait_capture",
            ScanState::WaitPause => "wait_pause",
            ScanState::Paused => "paused",
            ScanState::Resuming => "resuming",
            ScanState::Done => "done",
        };
        f.write_str(name)
    }
}

impl ScanState {
    /// Check if the state allows starting a new scan.
    pub fn can_start(&self) -> bool {
        matches!(self, ScanState::Standby | ScanState::Done)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, ScanState::WaitMove | ScanState::WaitCapture)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, ScanState::Paused)
    }

    /// True while a scan holds the context, including paused scans.
    pub fn is_active(&self) -> bool {
        !matches!(self, ScanState::Standby | ScanState::Done)
    }
}
