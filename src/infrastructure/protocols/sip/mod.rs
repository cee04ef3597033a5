//! SIP protocol stack (RFC 3261)

pub mod auth;
pub mod builder;
pub mod dialog;
pub mod dispatcher;
pub mod message;
pub mod registration;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use auth::SessionAuthAgent;
pub use builder::{RequestFactory, ResponseBuilder};
pub use dialog::{DialogPath, DialogState};
pub use dispatcher::{
    IncomingRequestHandler, NewSessionHandler, ServiceDispatcher, ServiceKind, SessionTable,
};
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use registration::{RegistrationConfig, RegistrationManager};
pub use sdp::{SdpMedia, SdpSession, SetupRole};
pub use transaction::{TransactionKey, TransactionOutcome, TransactionRegistry};
pub use transport::SipTransport;
