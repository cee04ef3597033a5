//! Magpie - an IMS/RCS client core built with Rust
//!
//! Implements SIP registration and session signaling, MSRP instant
//! messaging and file transfer, and RTP audio streaming behind a single
//! `ImsClient` engine.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{ImsClient, IncomingSessionListener};
pub use domain::shared::error::{Result, SessionError, SessionErrorCode};
pub use domain::shared::events::{RegistrationListener, SessionEventListener};
