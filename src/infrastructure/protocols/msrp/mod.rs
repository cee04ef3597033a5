//! MSRP protocol stack (RFC 4975)

pub mod connection;
pub mod message;

pub use connection::{MsrpConnection, MsrpEventListener, MsrpPaths, DEFAULT_CHUNK_SIZE};
pub use message::{ByteRange, ContinuationFlag, MsrpChunk, MsrpDecoder, MsrpError};
