//! IMS registration engine
//!
//! Periodic REGISTER / un-REGISTER state machine. One dialog path is reused
//! across refreshes (CSeq keeps incrementing); the refresh timer is a
//! single-shot rescheduled task so a manual stop always wins over a pending
//! tick. Every terminal outcome notifies exactly one listener callback.

use super::auth::SessionAuthAgent;
use super::builder::RequestFactory;
use super::dialog::DialogPath;
use super::message::SipError;
use super::transaction::{TransactionKey, TransactionOutcome, TransactionRegistry};
use super::transport::SipTransport;
use crate::domain::shared::{ListenerSet, RegistrationListener};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registration identity and tunables
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Public user identity, e.g. "sip:alice@ims.example.com"
    pub public_user_id: String,
    /// Registrar domain, e.g. "ims.example.com"
    pub domain: String,
    pub auth_username: String,
    pub auth_password: String,
    /// Requested binding lifetime in seconds
    pub expire_period: u32,
    pub transaction_timeout: Duration,
}

struct RegState {
    dialog: DialogPath,
    auth: SessionAuthAgent,
    registered: bool,
}

pub struct RegistrationManager {
    config: RegistrationConfig,
    transport: Arc<SipTransport>,
    registry: Arc<TransactionRegistry>,
    factory: RequestFactory,
    listeners: ListenerSet<dyn RegistrationListener>,
    state: Mutex<RegState>,
    /// Server-imposed Min-Expires floor, persisted across attempts
    min_expires_floor: AtomicU32,
    /// Current negotiated expire period
    expire_period: AtomicU32,
    stopped: AtomicBool,
    refresh_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RegistrationManager {
    pub fn new(
        config: RegistrationConfig,
        transport: Arc<SipTransport>,
        registry: Arc<TransactionRegistry>,
        factory: RequestFactory,
    ) -> Self {
        let auth = SessionAuthAgent::new(&config.auth_username, &config.auth_password);
        let expire = config.expire_period;
        // One dialog path reused across every re-registration
        let dialog = DialogPath::new(
            DialogPath::generate_call_id(&transport.via_address()),
            0,
            format!("sip:{}", config.domain),
            config.public_user_id.clone(),
            config.public_user_id.clone(),
            vec![],
        );
        Self {
            config,
            transport,
            registry,
            factory,
            listeners: ListenerSet::new(),
            state: Mutex::new(RegState {
                dialog,
                auth,
                registered: false,
            }),
            min_expires_floor: AtomicU32::new(0),
            expire_period: AtomicU32::new(expire),
            stopped: AtomicBool::new(false),
            refresh_task: std::sync::Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn RegistrationListener>) {
        self.listeners.add(listener);
    }

    pub async fn is_registered(&self) -> bool {
        self.state.lock().await.registered
    }

    /// Negotiated expire period, raised to the server's Min-Expires floor
    pub fn effective_expire_period(&self) -> u32 {
        let configured = self.expire_period.load(Ordering::SeqCst);
        let floor = self.min_expires_floor.load(Ordering::SeqCst);
        configured.max(floor)
    }

    /// Register or refresh the binding. Returns true when registered.
    pub async fn register(self: &Arc<Self>) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("Registration stopped, skipping register");
            return false;
        }
        match self.do_register(self.effective_expire_period()).await {
            Ok(expires) => {
                {
                    let mut state = self.state.lock().await;
                    state.registered = true;
                }
                info!("Registered for {} seconds", expires);
                // Refresh at half the granted lifetime
                self.schedule_refresh(Duration::from_secs((expires as u64 / 2).max(1)));
                self.listeners.broadcast(|l| l.on_registered());
                true
            }
            Err(reason) => {
                {
                    let mut state = self.state.lock().await;
                    state.registered = false;
                }
                self.cancel_refresh();
                warn!("Registration failed: {}", reason);
                self.listeners
                    .broadcast(|l| l.on_registration_failed(&reason.to_string()));
                false
            }
        }
    }

    /// Remove the binding (expires=0). No-op besides logging on success.
    pub async fn unregister(self: &Arc<Self>) {
        self.cancel_refresh();
        let was_registered = {
            let mut state = self.state.lock().await;
            let was = state.registered;
            state.registered = false;
            was
        };
        if !was_registered {
            debug!("Not registered, nothing to unregister");
            return;
        }
        match self.do_register(0).await {
            Ok(_) => info!("Unregistered"),
            Err(e) => warn!("Un-registration failed: {}", e),
        }
        self.listeners.broadcast(|l| l.on_unregistered());
    }

    /// Stop all registration activity; pending refresh ticks are cancelled
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel_refresh();
    }

    /// Core REGISTER exchange: auth challenge handling bounded to one retry,
    /// 423 interval renegotiation with persisted floor.
    async fn do_register(self: &Arc<Self>, expires: u32) -> Result<u32, SipError> {
        let mut expires = expires;
        let mut auth_retried = false;
        let mut interval_retried = false;

        loop {
            let (request, key) = {
                let mut state = self.state.lock().await;
                state.dialog.increment_cseq();
                let mut request = self.factory.register(&state.dialog, expires)?;
                // Attach the security header once a challenge is known
                state.auth.set_authorization_header(&mut request);
                let key =
                    TransactionKey::new(state.dialog.call_id(), state.dialog.cseq(), "REGISTER");
                (request, key)
            };

            let mut ctx = self.registry.register(key);
            self.transport.send_request(&request).await?;

            let response = match ctx.wait_final(self.config.transaction_timeout).await {
                TransactionOutcome::Received(response) => response,
                TransactionOutcome::Timeout => return Err(SipError::Timeout),
            };

            match response.status_code() {
                200 => {
                    if expires == 0 {
                        debug!("200 OK for un-REGISTER");
                        return Ok(0);
                    }
                    let granted = response.expires().unwrap_or(expires);
                    self.expire_period.store(granted, Ordering::SeqCst);
                    return Ok(granted);
                }
                401 | 407 => {
                    if auth_retried {
                        // A second challenge is a hard failure, no retry loop
                        return Err(SipError::Authentication(
                            "Registration challenged twice".to_string(),
                        ));
                    }
                    auth_retried = true;
                    let mut state = self.state.lock().await;
                    state.auth.read_challenge(&response)?;
                    debug!("REGISTER challenged, retrying with credentials");
                }
                423 => {
                    if interval_retried {
                        return Err(SipError::InvalidMessage(
                            "423 after Min-Expires adjustment".to_string(),
                        ));
                    }
                    interval_retried = true;
                    let min = response.min_expires().ok_or_else(|| {
                        SipError::InvalidMessage("423 without Min-Expires".to_string())
                    })?;
                    info!("Interval too brief, server requires at least {}s", min);
                    self.min_expires_floor.store(min, Ordering::SeqCst);
                    expires = expires.max(min);
                }
                code => {
                    return Err(SipError::TransactionError(format!(
                        "REGISTER rejected with {}",
                        code
                    )));
                }
            }
        }
    }

    /// Cancel-and-reschedule: the previous pending tick never fires once a
    /// new one is armed
    fn schedule_refresh(self: &Arc<Self>, delay: Duration) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if manager.stopped.load(Ordering::SeqCst) {
                return;
            }
            debug!("Registration refresh tick");
            manager.register().await;
        });

        let mut task = self.refresh_task.lock().expect("refresh task lock poisoned");
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    fn cancel_refresh(&self) {
        let mut task = self.refresh_task.lock().expect("refresh task lock poisoned");
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}

impl Drop for RegistrationManager {
    fn drop(&mut self) {
        let mut task = self.refresh_task.lock().expect("refresh task lock poisoned");
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}
