//! RTP media transport (RFC 3550)

pub mod packet;
pub mod session;

pub use packet::{RtpError, RtpPacket};
pub use session::{RtpListener, RtpTransport};
