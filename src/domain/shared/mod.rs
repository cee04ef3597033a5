//! Shared domain concepts: errors, results, event listeners

pub mod error;
pub mod events;

pub use error::{Result, SessionError, SessionErrorCode};
pub use events::{ListenerSet, RegistrationListener, SessionEventListener};
