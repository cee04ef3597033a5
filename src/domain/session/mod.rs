//! Session engine
//!
//! A `Session` combines one `DialogPath` with a media transport and a
//! service-specific `SessionBehavior` (chat, file transfer, streaming).
//! The behavior supplies SDP offers/answers and opens the media plane; the
//! session drives the shared INVITE state machine around it.

pub mod chat;
pub mod file_transfer;
pub mod streaming;

pub use chat::ChatBehavior;
pub use file_transfer::{FileDescriptor, FileTransferBehavior};
pub use streaming::StreamingBehavior;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::domain::messaging::{MessageDirection, MessageStatus, MessageStore, StoredMessage};
use crate::domain::shared::{Result, SessionError, SessionEventListener, ListenerSet};
use crate::infrastructure::media::rtp::{RtpListener, RtpTransport};
use crate::infrastructure::protocols::msrp::{MsrpConnection, MsrpEventListener};
use crate::infrastructure::protocols::sip::dispatcher::{
    IncomingRequestHandler, ServiceKind, SessionTable,
};
use crate::infrastructure::protocols::sip::{
    DialogPath, RequestFactory, ResponseBuilder, SdpSession, SessionAuthAgent, SipMethod,
    SipRequest, SipResponse, SipTransport, TransactionKey, TransactionOutcome,
    TransactionRegistry,
};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    OfferSent,
    OfferReceived,
    Ringing,
    Established,
    Terminated,
    Cancelled,
    Rejected,
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Terminated
                | SessionState::Cancelled
                | SessionState::Rejected
                | SessionState::Error
        )
    }
}

/// Media plane attached once the session is established
pub enum MediaTransport {
    Msrp(MsrpConnection),
    Rtp(RtpTransport),
    None,
}

impl MediaTransport {
    fn stop(&self) {
        match self {
            MediaTransport::Msrp(conn) => conn.terminate(),
            MediaTransport::Rtp(transport) => transport.stop(),
            MediaTransport::None => {}
        }
    }
}

/// Shared SIP plumbing handed to every session
pub struct SessionRuntime {
    pub transport: Arc<SipTransport>,
    pub registry: Arc<TransactionRegistry>,
    pub factory: Arc<RequestFactory>,
    pub table: Arc<SessionTable>,
    pub store: Arc<dyn MessageStore>,
    pub transaction_timeout: Duration,
    pub ringing_period: Duration,
}

/// Service-specific SDP and media handling
#[async_trait]
pub trait SessionBehavior: Send + Sync {
    fn kind(&self) -> ServiceKind;

    /// SDP offer for an originating session
    fn build_offer(&self) -> Result<SdpSession>;

    /// SDP answer against a remote offer, or an unsupported-media error
    /// before any transport is opened
    fn build_answer(&self, offer: &SdpSession) -> Result<SdpSession>;

    /// Open the media plane once both descriptions are known
    async fn open_media(
        &self,
        local: &SdpSession,
        remote: &SdpSession,
        bridge: Arc<MediaBridge>,
    ) -> Result<MediaTransport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Accept,
    Reject,
}

enum RingOutcome {
    Accept,
    Reject,
    Cancelled,
    Interrupted,
    TimedOut,
}

pub struct Session {
    runtime: Arc<SessionRuntime>,
    behavior: Box<dyn SessionBehavior>,
    dialog: Mutex<DialogPath>,
    state: StdMutex<SessionState>,
    pub listeners: ListenerSet<dyn SessionEventListener>,
    auth: Mutex<SessionAuthAgent>,
    media: Mutex<MediaTransport>,
    interrupted: AtomicBool,
    interrupted_changed: Notify,
    terminal_reached: AtomicBool,
    transfer_complete: AtomicBool,
    invite_cseq: AtomicU32,
    decision: StdMutex<Option<Decision>>,
    decision_changed: Notify,
    ack_received: Notify,
}

impl Session {
    /// Originating session toward `remote_uri`
    pub fn originating(
        runtime: Arc<SessionRuntime>,
        behavior: Box<dyn SessionBehavior>,
        local_uri: &str,
        remote_uri: &str,
        auth_username: &str,
        auth_password: &str,
    ) -> Arc<Self> {
        let call_id = DialogPath::generate_call_id(&runtime.transport.via_address());
        let dialog = DialogPath::new(
            call_id,
            0,
            remote_uri.to_string(),
            local_uri.to_string(),
            remote_uri.to_string(),
            Vec::new(),
        );
        Arc::new(Self::with_dialog(
            runtime,
            behavior,
            dialog,
            auth_username,
            auth_password,
        ))
    }

    /// Terminating session built from a received INVITE
    pub fn terminating(
        runtime: Arc<SessionRuntime>,
        behavior: Box<dyn SessionBehavior>,
        invite: &SipRequest,
        local_uri: &str,
        auth_username: &str,
        auth_password: &str,
    ) -> Result<Arc<Self>> {
        let call_id = invite
            .call_id()
            .ok_or_else(|| SessionError::Signaling("INVITE without Call-ID".to_string()))?;
        let remote_party = invite
            .from_uri()
            .ok_or_else(|| SessionError::Signaling("INVITE without From".to_string()))?;
        let target = invite.contact_uri().unwrap_or_else(|| remote_party.clone());

        let mut dialog = DialogPath::new(
            call_id,
            1,
            target,
            local_uri.to_string(),
            remote_party,
            Vec::new(),
        );
        if let Some(tag) = invite.from_tag() {
            dialog.set_remote_tag(tag);
        }
        Ok(Arc::new(Self::with_dialog(
            runtime,
            behavior,
            dialog,
            auth_username,
            auth_password,
        )))
    }

    fn with_dialog(
        runtime: Arc<SessionRuntime>,
        behavior: Box<dyn SessionBehavior>,
        dialog: DialogPath,
        auth_username: &str,
        auth_password: &str,
    ) -> Self {
        Self {
            runtime,
            behavior,
            dialog: Mutex::new(dialog),
            state: StdMutex::new(SessionState::Idle),
            listeners: ListenerSet::new(),
            auth: Mutex::new(SessionAuthAgent::new(auth_username, auth_password)),
            media: Mutex::new(MediaTransport::None),
            interrupted: AtomicBool::new(false),
            interrupted_changed: Notify::new(),
            terminal_reached: AtomicBool::new(false),
            transfer_complete: AtomicBool::new(false),
            invite_cseq: AtomicU32::new(0),
            decision: StdMutex::new(None),
            decision_changed: Notify::new(),
            ack_received: Notify::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug!("Session state {:?} -> {:?}", *guard, state);
        *guard = state;
    }

    pub fn kind(&self) -> ServiceKind {
        self.behavior.kind()
    }

    pub async fn call_id(&self) -> String {
        self.dialog.lock().await.call_id().to_string()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.listeners.add(listener);
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.interrupted.load(Ordering::SeqCst) {
            Err(SessionError::Internal("session interrupted".to_string()))
        } else {
            Ok(())
        }
    }

    /// Drive a full originating exchange. Failures surface through the
    /// listener callbacks, never as a return value.
    pub async fn start_outgoing(self: &Arc<Self>) {
        if let Err(e) = self.run_outgoing().await {
            self.fail(e).await;
        }
    }

    /// Drive a full terminating exchange for a received INVITE
    pub async fn start_incoming(self: &Arc<Self>, invite: SipRequest) {
        if let Err(e) = self.run_incoming(invite).await {
            self.fail(e).await;
        }
    }

    async fn fail(&self, error: SessionError) {
        if self.interrupted.load(Ordering::SeqCst) {
            debug!("Suppressing error after interrupt: {}", error);
            return;
        }
        let (terminal_state, code) = match &error {
            SessionError::Cancelled => (SessionState::Cancelled, error.code()),
            SessionError::Declined(_) => (SessionState::Rejected, error.code()),
            _ => (SessionState::Error, error.code()),
        };
        warn!("Session failed: {}", error);
        if self.end_session(terminal_state).await {
            self.listeners.broadcast(|l| l.on_error(code));
        }
    }

    /// Move to a terminal state, tear down media and leave the session
    /// table. Returns true for the one caller that performed the transition.
    async fn end_session(&self, state: SessionState) -> bool {
        if self.terminal_reached.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.set_state(state);
        self.media.lock().await.stop();
        let call_id = {
            let mut dialog = self.dialog.lock().await;
            if state == SessionState::Cancelled {
                dialog.session_cancelled();
            } else {
                dialog.session_terminated();
            }
            dialog.call_id().to_string()
        };
        self.runtime.table.remove(&call_id).await;
        true
    }

    async fn run_outgoing(self: &Arc<Self>) -> Result<()> {
        self.set_state(SessionState::OfferSent);
        let offer = self.behavior.build_offer()?;
        let offer_text = offer.to_sdp_string();

        let (invite, key, call_id) = {
            let mut dialog = self.dialog.lock().await;
            dialog.increment_cseq();
            dialog.set_local_sdp(offer_text.clone());
            let invite = self
                .runtime
                .factory
                .invite(&dialog, &offer_text)
                .map_err(|e| SessionError::Signaling(e.to_string()))?;
            let key = TransactionKey::new(dialog.call_id(), dialog.cseq(), "INVITE");
            (invite, key, dialog.call_id().to_string())
        };
        self.invite_cseq.store(key.cseq, Ordering::SeqCst);
        self.runtime
            .table
            .insert(&call_id, Arc::clone(self) as Arc<dyn IncomingRequestHandler>)
            .await;

        info!("Sending INVITE for {:?} session {}", self.kind(), call_id);
        let response = self.invite_transaction(invite, key).await?;
        self.check_interrupted()?;

        let remote_sdp_text = response
            .body_str()
            .map(|s| s.to_string())
            .ok_or_else(|| SessionError::Signaling("200 OK without SDP answer".to_string()))?;
        let remote_sdp = SdpSession::parse(&remote_sdp_text)
            .map_err(|e| SessionError::Signaling(e.to_string()))?;

        let ack = {
            let mut dialog = self.dialog.lock().await;
            if let Some(tag) = response.to_tag() {
                dialog.set_remote_tag(tag);
            }
            let mut routes = response.record_routes();
            if !routes.is_empty() {
                // Record-Route applies reversed on the caller side
                routes.reverse();
                dialog.set_route_set(routes);
            }
            if let Some(contact) = response.contact_uri() {
                dialog.set_target(contact);
            }
            dialog.set_remote_sdp(remote_sdp_text);
            dialog.sig_established();
            dialog.session_established();
            self.runtime
                .factory
                .ack(&dialog, self.invite_cseq.load(Ordering::SeqCst))
                .map_err(|e| SessionError::Signaling(e.to_string()))?
        };
        self.runtime
            .transport
            .send_request(&ack)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        self.open_media(&offer, &remote_sdp).await?;
        self.set_state(SessionState::Established);
        info!("Session {} established", call_id);
        self.listeners.broadcast(|l| l.on_started());
        Ok(())
    }

    /// Send the INVITE and wait for a final answer, retrying once on a
    /// digest challenge.
    async fn invite_transaction(
        &self,
        mut invite: SipRequest,
        mut key: TransactionKey,
    ) -> Result<SipResponse> {
        let wait = self.runtime.ringing_period + self.runtime.transaction_timeout;
        let mut challenged = false;
        loop {
            let mut ctx = self.runtime.registry.register(key.clone());
            self.runtime
                .transport
                .send_request(&invite)
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;

            // A local abort must interrupt the wait, not linger until the
            // ringing deadline
            let outcome = tokio::select! {
                outcome = ctx.wait_final(wait) => outcome,
                _ = self.interrupted_changed.notified() => {
                    return Err(SessionError::Internal("session interrupted".to_string()));
                }
            };
            let response = match outcome {
                TransactionOutcome::Received(r) => r,
                TransactionOutcome::Timeout => {
                    return Err(SessionError::Timeout("INVITE response".to_string()))
                }
            };

            match response.status_code() {
                200..=299 => return Ok(response),
                401 | 407 => {
                    self.ack_failure(&key).await;
                    if challenged {
                        return Err(SessionError::AuthenticationFailed(
                            "challenged twice".to_string(),
                        ));
                    }
                    challenged = true;
                    self.auth
                        .lock()
                        .await
                        .read_challenge(&response)
                        .map_err(|e| SessionError::AuthenticationFailed(e.to_string()))?;

                    let (retry, retry_key) = {
                        let mut dialog = self.dialog.lock().await;
                        dialog.increment_cseq();
                        let sdp = dialog.local_sdp().unwrap_or_default().to_string();
                        let mut retry = self
                            .runtime
                            .factory
                            .invite(&dialog, &sdp)
                            .map_err(|e| SessionError::Signaling(e.to_string()))?;
                        self.auth.lock().await.set_authorization_header(&mut retry);
                        let retry_key =
                            TransactionKey::new(dialog.call_id(), dialog.cseq(), "INVITE");
                        (retry, retry_key)
                    };
                    self.invite_cseq.store(retry_key.cseq, Ordering::SeqCst);
                    invite = retry;
                    key = retry_key;
                }
                487 => {
                    self.ack_failure(&key).await;
                    return Err(SessionError::Cancelled);
                }
                403 | 480 | 486 | 600 | 603 => {
                    self.ack_failure(&key).await;
                    return Err(SessionError::Declined(response.status_code()));
                }
                code => {
                    self.ack_failure(&key).await;
                    return Err(SessionError::Signaling(format!(
                        "INVITE rejected with {}",
                        code
                    )));
                }
            }
        }
    }

    /// ACK for a failed INVITE, best effort
    async fn ack_failure(&self, key: &TransactionKey) {
        let ack = {
            let dialog = self.dialog.lock().await;
            self.runtime.factory.ack(&dialog, key.cseq)
        };
        match ack {
            Ok(ack) => {
                if let Err(e) = self.runtime.transport.send_request(&ack).await {
                    debug!("Could not ACK failed INVITE: {}", e);
                }
            }
            Err(e) => debug!("Could not build ACK: {}", e),
        }
    }

    async fn run_incoming(self: &Arc<Self>, invite: SipRequest) -> Result<()> {
        self.set_state(SessionState::OfferReceived);
        let call_id = self.call_id().await;
        self.runtime
            .table
            .insert(&call_id, Arc::clone(self) as Arc<dyn IncomingRequestHandler>)
            .await;

        let offer_text = invite
            .body_str()
            .map(|s| s.to_string())
            .ok_or_else(|| SessionError::Signaling("INVITE without SDP".to_string()))?;
        let offer = SdpSession::parse(&offer_text)
            .map_err(|e| SessionError::UnsupportedMedia(e.to_string()))?;

        // 100 Trying right away to stop retransmissions
        self.reply(&invite, ResponseBuilder::trying()).await?;

        let local_tag = self.dialog.lock().await.local_tag().to_string();
        self.reply(&invite, ResponseBuilder::ringing().to_tag(&local_tag))
            .await?;
        self.set_state(SessionState::Ringing);
        info!("Incoming {:?} session {} ringing", self.kind(), call_id);

        match self.await_local_decision().await {
            RingOutcome::Accept => {}
            RingOutcome::Reject => {
                self.reply(&invite, ResponseBuilder::new(603).to_tag(&local_tag))
                    .await?;
                if self.end_session(SessionState::Rejected).await {
                    self.listeners.broadcast(|l| l.on_aborted());
                }
                return Ok(());
            }
            RingOutcome::Cancelled => {
                if self.end_session(SessionState::Cancelled).await {
                    self.listeners.broadcast(|l| l.on_terminated_by_remote());
                }
                return Ok(());
            }
            RingOutcome::Interrupted => {
                return Err(SessionError::Internal("session interrupted".to_string()));
            }
            RingOutcome::TimedOut => {
                self.reply(&invite, ResponseBuilder::new(486).to_tag(&local_tag))
                    .await?;
                return Err(SessionError::Timeout("local answer".to_string()));
            }
        }
        self.check_interrupted()?;

        let answer = match self.behavior.build_answer(&offer) {
            Ok(answer) => answer,
            Err(e) => {
                self.reply(&invite, ResponseBuilder::new(488).to_tag(&local_tag))
                    .await?;
                return Err(e);
            }
        };
        let answer_text = answer.to_sdp_string();
        {
            let mut dialog = self.dialog.lock().await;
            dialog.set_remote_sdp(offer_text);
            dialog.set_local_sdp(answer_text.clone());
            dialog.sig_established();
        }

        self.reply(
            &invite,
            ResponseBuilder::ok()
                .to_tag(&local_tag)
                .body("application/sdp", answer_text.into_bytes()),
        )
        .await?;

        let ack_wait =
            tokio::time::timeout(self.runtime.transaction_timeout, self.ack_received.notified())
                .await;
        if ack_wait.is_err() {
            return Err(SessionError::Timeout("ACK".to_string()));
        }
        self.check_interrupted()?;
        self.dialog.lock().await.session_established();

        self.open_media(&answer, &offer).await?;
        self.set_state(SessionState::Established);
        info!("Session {} established", call_id);
        self.listeners.broadcast(|l| l.on_started());
        Ok(())
    }

    async fn open_media(self: &Arc<Self>, local: &SdpSession, remote: &SdpSession) -> Result<()> {
        let bridge = Arc::new(MediaBridge {
            session: Arc::downgrade(self),
        });
        let transport = self.behavior.open_media(local, remote, bridge).await?;
        *self.media.lock().await = transport;
        Ok(())
    }

    /// Wait for accept/reject within the ringing period. CANCEL and local
    /// abort also resolve the wait.
    async fn await_local_decision(&self) -> RingOutcome {
        let deadline = tokio::time::Instant::now() + self.runtime.ringing_period;
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return RingOutcome::Interrupted;
            }
            if self.dialog.lock().await.is_cancelled() {
                return RingOutcome::Cancelled;
            }
            match *self.decision.lock().unwrap_or_else(|e| e.into_inner()) {
                Some(Decision::Accept) => return RingOutcome::Accept,
                Some(Decision::Reject) => return RingOutcome::Reject,
                None => {}
            }
            let notified = self.decision_changed.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return RingOutcome::TimedOut;
            }
        }
    }

    /// Accept a ringing terminating session
    pub fn accept(&self) {
        let mut decision = self.decision.lock().unwrap_or_else(|e| e.into_inner());
        decision.get_or_insert(Decision::Accept);
        self.decision_changed.notify_one();
    }

    /// Decline a ringing terminating session with 603
    pub fn reject(&self) {
        let mut decision = self.decision.lock().unwrap_or_else(|e| e.into_inner());
        decision.get_or_insert(Decision::Reject);
        self.decision_changed.notify_one();
    }

    /// Send a message over the session's MSRP transport and record it
    pub async fn send_message(&self, content_type: &str, data: &[u8]) -> Result<String> {
        let message_id = {
            let media = self.media.lock().await;
            match &*media {
                MediaTransport::Msrp(conn) => conn
                    .send_message(content_type, data)
                    .await
                    .map_err(|e| SessionError::Transport(e.to_string()))?,
                _ => {
                    return Err(SessionError::InvalidStateTransition(
                        "no message transport on this session".to_string(),
                    ))
                }
            }
        };
        let (session_id, remote_party) = {
            let dialog = self.dialog.lock().await;
            (
                dialog.call_id().to_string(),
                dialog.remote_party().to_string(),
            )
        };
        self.runtime
            .store
            .insert(StoredMessage::new(
                session_id,
                MessageDirection::Outgoing,
                remote_party,
                content_type.to_string(),
                data.to_vec(),
            ))
            .await;
        Ok(message_id)
    }

    /// Send a media frame over the session's RTP transport
    pub async fn send_media_frame(&self, payload: Bytes, samples: u32, marker: bool) -> Result<()> {
        let media = self.media.lock().await;
        match &*media {
            MediaTransport::Rtp(transport) => transport
                .send_frame(payload, samples, marker)
                .await
                .map_err(|e| SessionError::Transport(e.to_string())),
            _ => Err(SessionError::InvalidStateTransition(
                "no media transport on this session".to_string(),
            )),
        }
    }

    /// Local teardown. Interrupts any blocked wait, sends BYE or CANCEL as
    /// appropriate, and notifies `on_aborted` exactly once.
    pub async fn abort(&self) {
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Aborting session");
        self.decision_changed.notify_one();
        self.interrupted_changed.notify_one();

        let state = self.state();
        let request = {
            let mut dialog = self.dialog.lock().await;
            match state {
                SessionState::Established => {
                    dialog.increment_cseq();
                    self.runtime.factory.bye(&dialog).ok()
                }
                SessionState::OfferSent => self
                    .runtime
                    .factory
                    .cancel(&dialog, self.invite_cseq.load(Ordering::SeqCst))
                    .ok(),
                _ => None,
            }
        };
        if let Some(request) = request {
            if let Err(e) = self.runtime.transport.send_request(&request).await {
                debug!("Teardown request failed: {}", e);
            }
        }

        if self.end_session(SessionState::Terminated).await {
            self.listeners.broadcast(|l| l.on_aborted());
        }
    }

    /// Media plane failure reported by a transport worker
    async fn on_transport_failure(&self, reason: String) {
        if self.interrupted.load(Ordering::SeqCst) {
            debug!("Transport closed after interrupt: {}", reason);
            return;
        }
        self.fail(SessionError::Transport(reason)).await;
    }

    async fn reply(&self, request: &SipRequest, builder: ResponseBuilder) -> Result<()> {
        let response = builder
            .build_for_request(request)
            .map_err(|e| SessionError::Signaling(e.to_string()))?;
        self.runtime
            .transport
            .send_response(&response)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn handle_bye(&self, request: &SipRequest) {
        if let Err(e) = self.reply(request, ResponseBuilder::ok()).await {
            debug!("Could not answer BYE: {}", e);
        }
        if self.end_session(SessionState::Terminated).await {
            self.listeners.broadcast(|l| l.on_terminated_by_remote());
        }
    }

    async fn handle_cancel(&self, request: &SipRequest) {
        let late = {
            let mut dialog = self.dialog.lock().await;
            let late = dialog.is_sig_established();
            if !late {
                dialog.session_cancelled();
            }
            late
        };
        if late {
            // A CANCEL after the final response has no effect
            debug!("CANCEL after signaling established, ignoring");
            return;
        }
        if let Err(e) = self.reply(request, ResponseBuilder::ok()).await {
            debug!("Could not answer CANCEL: {}", e);
        }
        // Wake the blocked ringing wait; it observes the cancelled dialog
        // and performs the terminal transition
        self.decision_changed.notify_one();
    }
}

#[async_trait]
impl IncomingRequestHandler for Session {
    async fn handle_request(&self, request: SipRequest) {
        match request.method() {
            Some(SipMethod::Ack) => {
                debug!("ACK received");
                self.ack_received.notify_one();
            }
            Some(SipMethod::Bye) => self.handle_bye(&request).await,
            Some(SipMethod::Cancel) => self.handle_cancel(&request).await,
            Some(SipMethod::Invite) => {
                // Session refresh re-INVITE: answer with the current local SDP
                let (local_tag, sdp) = {
                    let dialog = self.dialog.lock().await;
                    (
                        dialog.local_tag().to_string(),
                        dialog.local_sdp().unwrap_or_default().to_string(),
                    )
                };
                let builder = ResponseBuilder::ok()
                    .to_tag(&local_tag)
                    .body("application/sdp", sdp.into_bytes());
                if let Err(e) = self.reply(&request, builder).await {
                    debug!("Could not answer re-INVITE: {}", e);
                }
            }
            _ => {
                if let Err(e) = self.reply(&request, ResponseBuilder::ok()).await {
                    debug!("Could not answer in-dialog request: {}", e);
                }
            }
        }
    }
}

/// Routes media transport callbacks back into the owning session
pub struct MediaBridge {
    session: Weak<Session>,
}

impl MsrpEventListener for MediaBridge {
    fn on_message_received(&self, _message_id: &str, content_type: &str, data: Vec<u8>) {
        if let Some(session) = self.session.upgrade() {
            session
                .listeners
                .broadcast(|l| l.on_message_received(content_type, &data));
            let mime_type = content_type.to_string();
            tokio::spawn(async move {
                let (session_id, remote_party) = {
                    let dialog = session.dialog.lock().await;
                    (
                        dialog.call_id().to_string(),
                        dialog.remote_party().to_string(),
                    )
                };
                let mut message = StoredMessage::new(
                    session_id,
                    MessageDirection::Incoming,
                    remote_party,
                    mime_type,
                    data,
                );
                message.status = MessageStatus::Delivered;
                session.runtime.store.insert(message).await;
            });
        }
    }

    fn on_progress(&self, current: u64, total: u64) {
        if let Some(session) = self.session.upgrade() {
            session
                .listeners
                .broadcast(|l| l.on_transfer_progress(current, total));
            if current == total
                && session.kind() == ServiceKind::FileTransfer
                && !session.transfer_complete.swap(true, Ordering::SeqCst)
            {
                session.listeners.broadcast(|l| l.on_transfer_complete());
            }
        }
    }

    fn on_report_received(&self, message_id: &str, status_code: u16) {
        debug!("Delivery report for {}: {}", message_id, status_code);
    }

    fn on_transfer_error(&self, reason: &str) {
        if let Some(session) = self.session.upgrade() {
            let reason = reason.to_string();
            tokio::spawn(async move {
                session.on_transport_failure(reason).await;
            });
        }
    }
}

impl RtpListener for MediaBridge {
    fn on_media_received(&self, payload_type: u8, _timestamp: u32, payload: Bytes) {
        // Media frames stay inside the session; decoding is out of scope
        if self.session.upgrade().is_some() {
            debug!("RTP frame pt={} len={}", payload_type, payload.len());
        }
    }
}
