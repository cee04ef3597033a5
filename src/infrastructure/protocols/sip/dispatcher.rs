//! Inbound SIP routing
//!
//! A single worker drains the transport's receive channel in arrival order.
//! Responses are matched against pending transactions, requests against the
//! session table by Call-ID. INVITEs for unknown dialogs are classified from
//! their SDP and feature tags and handed to the new-session handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::builder::ResponseBuilder;
use super::message::{SipMessage, SipMethod, SipRequest};
use super::transaction::TransactionRegistry;
use super::transport::SipTransport;

/// Service classification of an unknown INVITE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Chat,
    FileTransfer,
    Streaming,
}

/// Entry point for requests belonging to an existing dialog
#[async_trait]
pub trait IncomingRequestHandler: Send + Sync {
    async fn handle_request(&self, request: SipRequest);
}

/// Creates a terminating session from a classified INVITE
#[async_trait]
pub trait NewSessionHandler: Send + Sync {
    async fn on_new_invite(&self, kind: ServiceKind, request: SipRequest);
}

/// Active sessions keyed by Call-ID
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<dyn IncomingRequestHandler>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, call_id: &str, session: Arc<dyn IncomingRequestHandler>) {
        self.sessions
            .write()
            .await
            .insert(call_id.to_string(), session);
    }

    pub async fn lookup(&self, call_id: &str) -> Option<Arc<dyn IncomingRequestHandler>> {
        self.sessions.read().await.get(call_id).cloned()
    }

    /// Returns true only for the call that actually removed the entry, so
    /// terminal cleanup runs at most once even when teardown races.
    pub async fn remove(&self, call_id: &str) -> bool {
        self.sessions.write().await.remove(call_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide what kind of session an out-of-dialog INVITE is asking for
pub fn classify_invite(request: &SipRequest) -> Option<ServiceKind> {
    let body = request.body_str().unwrap_or_default();
    let accept_contact = request.header("Accept-Contact").unwrap_or_default();

    let has_file_selector = body.contains("a=file-selector")
        || accept_contact.contains("application.ims.iari.rcs.fthttp")
        || accept_contact.contains("file-transfer");
    let has_message_media = body.lines().any(|l| l.starts_with("m=message"));
    let has_streaming_media = body
        .lines()
        .any(|l| l.starts_with("m=audio") || l.starts_with("m=video"));

    if has_message_media && has_file_selector {
        Some(ServiceKind::FileTransfer)
    } else if has_message_media {
        Some(ServiceKind::Chat)
    } else if has_streaming_media {
        Some(ServiceKind::Streaming)
    } else {
        None
    }
}

/// The serialized intake worker
pub struct ServiceDispatcher {
    transport: Arc<SipTransport>,
    registry: Arc<TransactionRegistry>,
    table: Arc<SessionTable>,
    handler: Arc<dyn NewSessionHandler>,
}

impl ServiceDispatcher {
    pub fn new(
        transport: Arc<SipTransport>,
        registry: Arc<TransactionRegistry>,
        table: Arc<SessionTable>,
        handler: Arc<dyn NewSessionHandler>,
    ) -> Self {
        Self {
            transport,
            registry,
            table,
            handler,
        }
    }

    /// Drain the receive channel until the transport shuts down. Per-message
    /// failures are logged and the loop keeps going.
    pub async fn run(self, mut rx: mpsc::Receiver<SipMessage>) {
        info!("Service dispatcher started");
        while let Some(message) = rx.recv().await {
            match message {
                SipMessage::Response(response) => {
                    if !self.registry.dispatch(&response) {
                        debug!(
                            "Stray response {} for Call-ID {:?}",
                            response.status_code(),
                            response.call_id()
                        );
                    }
                }
                SipMessage::Request(request) => {
                    self.route_request(request).await;
                }
            }
        }
        info!("Service dispatcher stopped");
    }

    async fn route_request(&self, request: SipRequest) {
        let call_id = match request.call_id() {
            Some(id) => id,
            None => {
                warn!("Dropping request without Call-ID");
                return;
            }
        };

        if let Some(session) = self.table.lookup(&call_id).await {
            session.handle_request(request).await;
            return;
        }

        match request.method() {
            Some(SipMethod::Invite) => match classify_invite(&request) {
                Some(kind) => {
                    info!("New {:?} invitation, Call-ID {}", kind, call_id);
                    self.handler.on_new_invite(kind, request).await;
                }
                None => {
                    debug!("INVITE with unsupported media, Call-ID {}", call_id);
                    self.reply(&request, 488).await;
                }
            },
            // Retransmitted ACKs for dead dialogs are absorbed silently
            Some(SipMethod::Ack) => {
                debug!("ACK for unknown dialog {}", call_id);
            }
            _ => {
                debug!("Request for unknown dialog {}, answering 481", call_id);
                self.reply(&request, 481).await;
            }
        }
    }

    async fn reply(&self, request: &SipRequest, status_code: u16) {
        let response = match ResponseBuilder::new(status_code).build_for_request(request) {
            Ok(r) => r,
            Err(e) => {
                warn!("Could not build {} response: {}", status_code, e);
                return;
            }
        };
        if let Err(e) = self.transport.send_response(&response).await {
            warn!("Could not send {} response: {}", status_code, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn invite_with_body(body: &str, accept_contact: Option<&str>) -> SipRequest {
        let mut raw = String::from(
            "INVITE sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKtest\r\n\
             From: <sip:alice@example.com>;tag=a1\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: classify-1\r\n\
             CSeq: 1 INVITE\r\n",
        );
        if let Some(ac) = accept_contact {
            raw.push_str(&format!("Accept-Contact: {}\r\n", ac));
        }
        raw.push_str(&format!(
            "Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ));
        SipRequest::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_classify_chat_invite() {
        let body = "v=0\r\no=- 0 0 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\n\
                    m=message 2855 TCP/MSRP *\r\na=accept-types:text/plain\r\n";
        let invite = invite_with_body(body, None);
        assert_eq!(classify_invite(&invite), Some(ServiceKind::Chat));
    }

    #[test]
    fn test_classify_file_transfer_invite() {
        let body = "v=0\r\nm=message 2855 TCP/MSRP *\r\n\
                    a=file-selector:name:\"photo.jpg\" type:image/jpeg size:4096\r\n";
        let invite = invite_with_body(body, None);
        assert_eq!(classify_invite(&invite), Some(ServiceKind::FileTransfer));
    }

    #[test]
    fn test_classify_streaming_invite() {
        let body = "v=0\r\nm=audio 49170 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\n";
        let invite = invite_with_body(body, None);
        assert_eq!(classify_invite(&invite), Some(ServiceKind::Streaming));
    }

    #[test]
    fn test_classify_unknown_media() {
        let body = "v=0\r\nm=application 5000 UDP/DTLS datachannel\r\n";
        let invite = invite_with_body(body, None);
        assert_eq!(classify_invite(&invite), None);
    }

    struct CountingSession {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl IncomingRequestHandler for CountingSession {
        async fn handle_request(&self, _request: SipRequest) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_session_table_remove_exactly_once() {
        let table = SessionTable::new();
        let session = Arc::new(CountingSession {
            hits: AtomicUsize::new(0),
        });
        table.insert("call-1", session).await;

        assert!(table.lookup("call-1").await.is_some());
        assert!(table.remove("call-1").await);
        assert!(!table.remove("call-1").await);
        assert!(table.lookup("call-1").await.is_none());
    }

    #[tokio::test]
    async fn test_table_routes_to_existing_session() {
        let table = SessionTable::new();
        let session = Arc::new(CountingSession {
            hits: AtomicUsize::new(0),
        });
        table.insert("classify-1", Arc::clone(&session) as _).await;

        let invite = invite_with_body("v=0\r\nm=message 2855 TCP/MSRP *\r\n", None);
        let found = table
            .lookup(&invite.call_id().unwrap())
            .await
            .expect("session should match by Call-ID");
        found.handle_request(invite).await;
        assert_eq!(session.hits.load(Ordering::SeqCst), 1);
    }
}
