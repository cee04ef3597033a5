//! MSRP chat sessions, one-to-one and group

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info};
use uuid::Uuid;

use super::{MediaBridge, MediaTransport, Session, SessionBehavior};
use crate::domain::shared::{Result, SessionError};
use crate::infrastructure::protocols::msrp::{MsrpConnection, MsrpEventListener, MsrpPaths};
use crate::infrastructure::protocols::sip::dispatcher::ServiceKind;
use crate::infrastructure::protocols::sip::sdp::negotiate_accept_types;
use crate::infrastructure::protocols::sip::{
    SdpSession, SetupRole, TransactionKey, TransactionOutcome,
};

pub struct ChatBehavior {
    local_ip: IpAddr,
    msrp_port: u16,
    local_path: String,
    accept_types: Vec<String>,
}

impl ChatBehavior {
    pub fn new(local_ip: IpAddr, msrp_port: u16, accept_types: Vec<String>) -> Self {
        let local_path = format!(
            "msrp://{}:{}/{};tcp",
            local_ip,
            msrp_port,
            Uuid::new_v4().simple()
        );
        Self {
            local_ip,
            msrp_port,
            local_path,
            accept_types,
        }
    }
}

#[async_trait]
impl SessionBehavior for ChatBehavior {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Chat
    }

    fn build_offer(&self) -> Result<SdpSession> {
        Ok(SdpSession::create_message_session(
            self.local_ip,
            self.msrp_port,
            &self.local_path,
            SetupRole::Active,
            &self.accept_types,
        ))
    }

    fn build_answer(&self, offer: &SdpSession) -> Result<SdpSession> {
        let media = offer
            .msrp_media()
            .ok_or_else(|| SessionError::UnsupportedMedia("no MSRP media in offer".to_string()))?;
        let common = negotiate_accept_types(&media.accept_types(), &self.accept_types)
            .map_err(|e| SessionError::UnsupportedMedia(e.to_string()))?;
        let role = media.setup().unwrap_or(SetupRole::ActPass).answer();
        Ok(SdpSession::create_message_session(
            self.local_ip,
            self.msrp_port,
            &self.local_path,
            role,
            &common,
        ))
    }

    async fn open_media(
        &self,
        local: &SdpSession,
        remote: &SdpSession,
        bridge: Arc<MediaBridge>,
    ) -> Result<MediaTransport> {
        open_msrp_transport(local, remote, &self.local_path, self.local_ip, self.msrp_port, bridge)
            .await
    }
}

/// Host:port part of an MSRP path URI
fn msrp_endpoint(path: &str) -> Option<String> {
    let rest = path
        .strip_prefix("msrp://")
        .or_else(|| path.strip_prefix("msrps://"))?;
    let endpoint = rest.split('/').next()?;
    if endpoint.contains(':') {
        Some(endpoint.to_string())
    } else {
        None
    }
}

/// Open the MSRP connection in the role the negotiated SDP assigned us.
/// The passive side listens on its advertised media port.
pub(super) async fn open_msrp_transport(
    local: &SdpSession,
    remote: &SdpSession,
    local_path: &str,
    local_ip: IpAddr,
    local_port: u16,
    bridge: Arc<MediaBridge>,
) -> Result<MediaTransport> {
    let local_media = local
        .msrp_media()
        .ok_or_else(|| SessionError::Internal("no local MSRP media".to_string()))?;
    let remote_media = remote
        .msrp_media()
        .ok_or_else(|| SessionError::UnsupportedMedia("no remote MSRP media".to_string()))?;
    let remote_path = remote_media
        .msrp_path()
        .ok_or_else(|| SessionError::UnsupportedMedia("remote offer without a=path".to_string()))?
        .to_string();

    let paths = MsrpPaths {
        local_path: local_path.to_string(),
        remote_path: remote_path.clone(),
    };
    let listener = bridge as Arc<dyn MsrpEventListener>;

    let role = local_media.setup().unwrap_or(SetupRole::Active);
    let connection = match role {
        SetupRole::Active => {
            let endpoint = msrp_endpoint(&remote_path).unwrap_or_else(|| {
                format!("{}:{}", remote.connection.address, remote_media.port)
            });
            MsrpConnection::connect(&endpoint, paths, listener)
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?
        }
        SetupRole::Passive | SetupRole::ActPass => {
            let tcp = TcpListener::bind((local_ip, local_port))
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            MsrpConnection::accept(tcp, paths, listener)
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?
        }
    };
    Ok(MediaTransport::Msrp(connection))
}

/// Group-chat participant management over REFER
impl Session {
    pub async fn add_participant(&self, participant: &str) {
        self.add_participants(&[participant.to_string()]).await;
    }

    /// Invite each participant with a REFER on the session dialog and
    /// report the per-participant outcome. Session state is unchanged.
    pub async fn add_participants(&self, participants: &[String]) {
        for participant in participants {
            let outcome = self.refer_participant(participant).await;
            match &outcome {
                Ok(()) => info!("Participant {} referred", participant),
                Err(e) => debug!("REFER for {} failed: {}", participant, e),
            }
            self.listeners
                .broadcast(|l| l.on_participant_result(participant, outcome.is_ok()));
        }
    }

    async fn refer_participant(&self, participant: &str) -> Result<()> {
        {
            let dialog = self.dialog.lock().await;
            if !dialog.is_sig_established() {
                return Err(SessionError::InvalidStateTransition(
                    "REFER requires an established dialog".to_string(),
                ));
            }
        }

        let mut challenged = false;
        loop {
            let (request, key) = {
                let mut dialog = self.dialog.lock().await;
                dialog.increment_cseq();
                let mut request = self
                    .runtime
                    .factory
                    .refer(&dialog, participant)
                    .map_err(|e| SessionError::Signaling(e.to_string()))?;
                self.auth
                    .lock()
                    .await
                    .set_authorization_header(&mut request);
                let key = TransactionKey::new(dialog.call_id(), dialog.cseq(), "REFER");
                (request, key)
            };

            let mut ctx = self.runtime.registry.register(key);
            self.runtime
                .transport
                .send_request(&request)
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;

            let response = match ctx.wait_final(self.runtime.transaction_timeout).await {
                TransactionOutcome::Received(r) => r,
                TransactionOutcome::Timeout => {
                    return Err(SessionError::Timeout("REFER response".to_string()))
                }
            };
            match response.status_code() {
                200..=299 => return Ok(()),
                401 | 407 => {
                    if challenged {
                        return Err(SessionError::AuthenticationFailed(
                            "REFER challenged twice".to_string(),
                        ));
                    }
                    challenged = true;
                    self.auth
                        .lock()
                        .await
                        .read_challenge(&response)
                        .map_err(|e| SessionError::AuthenticationFailed(e.to_string()))?;
                }
                code => {
                    return Err(SessionError::Signaling(format!(
                        "REFER rejected with {}",
                        code
                    )))
                }
            }
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}
