//! Link to the turntable controller.

use crate::error::AppResult;
use crate::hardware::capabilities::{LoggingPositionerListener, Positioner, PositionerListener};
use crate::hardware::DeviceRole;
use crate::network::link::{DeviceLink, LinkProtocol};
use crate::network::listeners::ListenerRegistry;
use crate::network::protocol::{Frame, PositionerMessage, Token};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Positioner side of the wire protocol.
#[derive(Debug)]
pub struct PositionerProtocol;

impl LinkProtocol for PositionerProtocol {
    type Listener = dyn PositionerListener;

    const ROLE: DeviceRole = DeviceRole::Positioner;

    fn trailing_len(_frame: &Frame) -> usize {
        0
    }

    fn dispatch(frame: &Frame, _payload: Option<Bytes>, listeners: &ListenerRegistry<Self::Listener>) {
        match PositionerMessage::from_frame(frame) {
            Some(PositionerMessage::MoveDone { token, angle }) => {
                debug!(%token, angle, "Move done");
                listeners.for_each(|l| l.on_position_done(angle, token));
            }
            Some(PositionerMessage::Status { angle }) => {
                debug!(angle, "Position status");
                listeners.for_each(|l| l.on_status(angle));
            }
            Some(other) => warn!(message = ?other, "Request frame received from positioner, ignored"),
            None => warn!(
                opcode = format_args!("{:#04X}", frame.opcode),
                "Opcode not valid on the positioner link, ignored"
            ),
        }
    }

    fn link_lost(listeners: &ListenerRegistry<Self::Listener>) {
        listeners.for_each(|l| l.on_link_lost(DeviceRole::Positioner));
    }

    fn default_listener() -> Arc<Self::Listener> {
        Arc::new(LoggingPositionerListener)
    }
}

/// TCP link serving the positioner.
pub type PositionerLink = DeviceLink<PositionerProtocol>;

impl DeviceLink<PositionerProtocol> {
    /// Asks the positioner to report its current angle.
    ///
    /// The answer arrives through [`PositionerListener::on_status`].
    pub fn request_status(&self) -> AppResult<()> {
        let bytes = PositionerMessage::RequestStatus.encode()?;
        self.send_request(bytes, "request_status");
        Ok(())
    }
}

impl Positioner for DeviceLink<PositionerProtocol> {
    fn is_ready(&self) -> bool {
        DeviceLink::is_ready(self)
    }

    fn move_to(&self, angle: f64, token: Token) -> AppResult<()> {
        let bytes = PositionerMessage::MoveTo { token, angle }.encode()?;
        debug!(%token, angle, "Requesting move");
        self.send_request(bytes, "move_to");
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn PositionerListener>) {
        self.listeners().add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn PositionerListener>) -> bool {
        self.listeners().remove(listener)
    }
}
