//! Link to the camera controller.
//!
//! Capture responses are the only frames followed by raw bytes: `0xBB` and
//! `0xBA` announce the payload length in their fifth field and the link reads
//! exactly that many bytes before dispatching.

use crate::error::AppResult;
use crate::hardware::capabilities::{CaptureDevice, CaptureListener, CaptureParams, LoggingCaptureListener};
use crate::hardware::DeviceRole;
use crate::network::link::{DeviceLink, LinkProtocol};
use crate::network::listeners::ListenerRegistry;
use crate::network::protocol::{CaptureMessage, Frame, Token};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Capture side of the wire protocol.
#[derive(Debug)]
pub struct CaptureProtocol;

impl LinkProtocol for CaptureProtocol {
    type Listener = dyn CaptureListener;

    const ROLE: DeviceRole = DeviceRole::Capture;

    fn trailing_len(frame: &Frame) -> usize {
        CaptureMessage::from_frame(frame).map_or(0, |m| m.payload_len())
    }

    fn dispatch(frame: &Frame, payload: Option<Bytes>, listeners: &ListenerRegistry<Self::Listener>) {
        match CaptureMessage::from_frame(frame) {
            Some(CaptureMessage::CaptureDone {
                token,
                stride_pixel,
                stride_row,
                sensor,
                ..
            }) => {
                debug!(%token, bytes = payload.as_ref().map_or(0, Bytes::len), "Capture done");
                listeners.for_each(|l| {
                    l.on_capture_done(payload.clone(), stride_pixel, stride_row, sensor, token)
                });
            }
            Some(CaptureMessage::TestCapture { token, .. }) => {
                listeners.for_each(|l| l.on_test_capture(payload.clone(), token));
            }
            Some(other) => warn!(message = ?other, "Request frame received from camera, ignored"),
            None => warn!(
                opcode = format_args!("{:#04X}", frame.opcode),
                "Opcode not valid on the capture link, ignored"
            ),
        }
    }

    fn link_lost(listeners: &ListenerRegistry<Self::Listener>) {
        listeners.for_each(|l| l.on_link_lost(DeviceRole::Capture));
    }

    fn default_listener() -> Arc<Self::Listener> {
        Arc::new(LoggingCaptureListener)
    }
}

/// TCP link serving the camera controller.
pub type CaptureLink = DeviceLink<CaptureProtocol>;

impl CaptureDevice for DeviceLink<CaptureProtocol> {
    fn is_ready(&self) -> bool {
        DeviceLink::is_ready(self)
    }

    fn capture(&self, params: &CaptureParams, token: Token) -> AppResult<()> {
        let bytes = CaptureMessage::Capture {
            token,
            params: *params,
        }
        .encode()?;
        debug!(%token, ?params, "Requesting capture");
        self.send_request(bytes, "capture");
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn CaptureListener>) {
        self.listeners().add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn CaptureListener>) -> bool {
        self.listeners().remove(listener)
    }
}
