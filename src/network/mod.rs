//! Wire protocol and TCP plumbing shared by both device links.

pub mod link;
pub mod listeners;
pub mod protocol;

pub use link::{ConnectivityCallback, DeviceLink, LinkProtocol, LinkState};
pub use listeners::ListenerRegistry;
pub use protocol::{CaptureMessage, Frame, Opcode, PositionerMessage, Token, FRAME_SIZE};
