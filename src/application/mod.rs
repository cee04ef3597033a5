//! Client engine
//!
//! `ImsClient` owns the transport, the transaction registry and the session
//! table, and wires the service dispatcher to a factory for terminating
//! sessions. Applications start sessions through it and observe incoming
//! ones through `IncomingSessionListener`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::domain::messaging::{InMemoryMessageStore, MessageStore};
use crate::domain::session::{
    ChatBehavior, FileDescriptor, FileTransferBehavior, Session, SessionBehavior, SessionRuntime,
    StreamingBehavior,
};
use crate::domain::shared::{ListenerSet, RegistrationListener, Result, SessionError};
use crate::infrastructure::protocols::sip::{
    NewSessionHandler, RegistrationConfig, RegistrationManager, RequestFactory, ServiceDispatcher,
    ServiceKind, SessionTable, SipRequest, SipTransport, TransactionRegistry,
};

/// Notified when a remote party opens a session toward us.
///
/// The session is still ringing when this fires; it proceeds only once the
/// application calls `accept` or `reject` on it.
pub trait IncomingSessionListener: Send + Sync {
    fn on_incoming_session(&self, session: Arc<Session>);
}

/// Static payload type assignments from the RTP A/V profile (RFC 3551)
fn codec_entry(name: &str) -> Option<(String, String)> {
    match name {
        "PCMU" => Some(("0".to_string(), "PCMU/8000".to_string())),
        "PCMA" => Some(("8".to_string(), "PCMA/8000".to_string())),
        "G722" => Some(("9".to_string(), "G722/8000".to_string())),
        other => {
            warn!("Dropping unsupported codec {}", other);
            None
        }
    }
}

pub struct ImsClient {
    config: ClientConfig,
    runtime: Arc<SessionRuntime>,
    registration: Arc<RegistrationManager>,
    local_ip: IpAddr,
    incoming_listeners: Arc<ListenerSet<dyn IncomingSessionListener>>,
}

impl ImsClient {
    /// Bind the SIP transport and start the dispatcher and registration
    /// machinery. No signaling is sent until `register` is called.
    pub async fn start(config: ClientConfig) -> Result<Arc<Self>> {
        let bind_addr = format!("{}:{}", config.sip.bind_address, config.sip.bind_port)
            .parse()
            .map_err(|e| SessionError::Internal(format!("bad bind address: {}", e)))?;
        let proxy_addr = format!("{}:{}", config.sip.proxy_address, config.sip.proxy_port)
            .parse()
            .map_err(|e| SessionError::Internal(format!("bad proxy address: {}", e)))?;
        let local_ip: IpAddr = config
            .sip
            .bind_address
            .parse()
            .map_err(|e| SessionError::Internal(format!("bad bind address: {}", e)))?;

        let (transport, rx) = SipTransport::bind(bind_addr, proxy_addr)
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))?;

        let via_address = transport.via_address();
        let factory = RequestFactory {
            via_address: via_address.clone(),
            transport: "UDP".to_string(),
            contact_uri: format!("sip:{}@{}", config.ims.auth_username, via_address),
            feature_tags: config.ims.feature_tags.clone(),
            instance_id: Uuid::new_v4().to_string(),
            user_agent: config.sip.user_agent.clone(),
        };

        let registry = Arc::new(TransactionRegistry::new());
        let table = Arc::new(SessionTable::new());
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());

        let runtime = Arc::new(SessionRuntime {
            transport: transport.clone(),
            registry: registry.clone(),
            factory: Arc::new(factory.clone()),
            table: table.clone(),
            store,
            transaction_timeout: Duration::from_secs(config.timers.transaction_timeout),
            ringing_period: Duration::from_secs(config.timers.ringing_period),
        });

        let registration = Arc::new(RegistrationManager::new(
            RegistrationConfig {
                public_user_id: config.ims.public_user_id.clone(),
                domain: config.ims.domain.clone(),
                auth_username: config.ims.auth_username.clone(),
                auth_password: config.ims.auth_password.clone(),
                expire_period: config.ims.expire_period,
                transaction_timeout: Duration::from_secs(config.timers.transaction_timeout),
            },
            transport.clone(),
            registry.clone(),
            factory,
        ));

        let client = Arc::new(Self {
            config,
            runtime,
            registration,
            local_ip,
            incoming_listeners: Arc::new(ListenerSet::new()),
        });

        let handler = Arc::new(TerminatingSessionFactory {
            client: client.clone(),
        });
        let dispatcher = ServiceDispatcher::new(transport, registry, table, handler);
        tokio::spawn(dispatcher.run(rx));

        info!("Client engine started as {}", client.config.ims.public_user_id);
        Ok(client)
    }

    pub fn add_registration_listener(&self, listener: Arc<dyn RegistrationListener>) {
        self.registration.add_listener(listener);
    }

    pub fn add_incoming_session_listener(&self, listener: Arc<dyn IncomingSessionListener>) {
        self.incoming_listeners.add(listener);
    }

    /// Register with the IMS network. Returns false when the registrar
    /// rejects us; listeners carry the reason.
    pub async fn register(&self) -> bool {
        self.registration.register().await
    }

    pub async fn unregister(&self) {
        self.registration.unregister().await;
    }

    pub async fn is_registered(&self) -> bool {
        self.registration.is_registered().await
    }

    fn new_session(&self, behavior: Box<dyn SessionBehavior>, remote_uri: &str) -> Arc<Session> {
        Session::originating(
            self.runtime.clone(),
            behavior,
            &self.config.ims.public_user_id,
            remote_uri,
            &self.config.ims.auth_username,
            &self.config.ims.auth_password,
        )
    }

    /// Open a one-to-one chat session toward `remote_uri`.
    ///
    /// The returned session is still negotiating; attach listeners before
    /// the spawned INVITE completes to observe `on_started`.
    pub fn start_chat(&self, remote_uri: &str) -> Arc<Session> {
        let behavior = ChatBehavior::new(
            self.local_ip,
            self.config.media.msrp_port,
            self.config.media.accept_types.clone(),
        );
        let session = self.new_session(Box::new(behavior), remote_uri);
        let task = session.clone();
        tokio::spawn(async move { task.start_outgoing().await });
        session
    }

    /// Offer `file` to `remote_uri` over an MSRP file transfer session.
    pub fn send_file(&self, remote_uri: &str, file: FileDescriptor) -> Arc<Session> {
        let behavior = FileTransferBehavior::sending(
            self.local_ip,
            self.config.media.msrp_port,
            file,
            self.config.media.max_file_size,
        );
        let session = self.new_session(Box::new(behavior), remote_uri);
        let task = session.clone();
        tokio::spawn(async move { task.start_outgoing().await });
        session
    }

    /// Place an audio call toward `remote_uri` using the configured codecs.
    pub fn start_audio_call(&self, remote_uri: &str) -> Arc<Session> {
        let codecs = self
            .config
            .media
            .audio_codecs
            .iter()
            .filter_map(|name| codec_entry(name))
            .collect();
        let behavior = StreamingBehavior::new(self.local_ip, self.config.media.rtp_port, codecs);
        let session = self.new_session(Box::new(behavior), remote_uri);
        let task = session.clone();
        tokio::spawn(async move { task.start_outgoing().await });
        session
    }

    /// Bound SIP address, useful when the port was configured as 0
    pub fn local_sip_addr(&self) -> std::net::SocketAddr {
        self.runtime.transport.local_addr()
    }

    pub async fn active_session_count(&self) -> usize {
        self.runtime.table.len().await
    }

    /// Message history backing all sessions on this client
    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.runtime.store.clone()
    }

    /// Deregister and stop the background refresh timer. Callers should
    /// abort any sessions they still hold before shutting down.
    pub async fn shutdown(&self) {
        self.registration.unregister().await;
        self.registration.stop();
        info!("Client engine stopped");
    }
}

/// Builds terminating sessions for INVITEs the dispatcher classified
struct TerminatingSessionFactory {
    client: Arc<ImsClient>,
}

impl TerminatingSessionFactory {
    fn behavior_for(&self, kind: ServiceKind) -> Box<dyn SessionBehavior> {
        let config = &self.client.config;
        match kind {
            ServiceKind::Chat => Box::new(ChatBehavior::new(
                self.client.local_ip,
                config.media.msrp_port,
                config.media.accept_types.clone(),
            )),
            ServiceKind::FileTransfer => Box::new(FileTransferBehavior::receiving(
                self.client.local_ip,
                config.media.msrp_port,
                config.media.max_file_size,
            )),
            ServiceKind::Streaming => {
                let codecs = config
                    .media
                    .audio_codecs
                    .iter()
                    .filter_map(|name| codec_entry(name))
                    .collect();
                Box::new(StreamingBehavior::new(
                    self.client.local_ip,
                    config.media.rtp_port,
                    codecs,
                ))
            }
        }
    }
}

#[async_trait]
impl NewSessionHandler for TerminatingSessionFactory {
    async fn on_new_invite(&self, kind: ServiceKind, request: SipRequest) {
        let behavior = self.behavior_for(kind);
        let session = match Session::terminating(
            self.client.runtime.clone(),
            behavior,
            &request,
            &self.client.config.ims.public_user_id,
            &self.client.config.ims.auth_username,
            &self.client.config.ims.auth_password,
        ) {
            Ok(session) => session,
            Err(e) => {
                error!("Rejecting malformed INVITE: {}", e);
                return;
            }
        };

        info!("Incoming {:?} session {}", kind, session.call_id().await);
        for listener in self.client.incoming_listeners.snapshot() {
            listener.on_incoming_session(session.clone());
        }
        let task = session.clone();
        tokio::spawn(async move { task.start_incoming(request).await });
    }
}
