//! SIP dialog path (RFC 3261 Section 12)
//!
//! One `DialogPath` identifies a dialog: Call-ID, CSeq, tags, route set and
//! the current offer/answer SDP. Signaling-state transitions only ever move
//! forward; calling a transition that is already in effect is a logged no-op.

use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

/// Signaling state of a dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Dialog created, no final signaling outcome yet
    NotStarted,
    /// 2xx exchanged, signaling path established
    Established,
    /// Cancelled before signaling was established
    Cancelled,
    /// Dialog over, no further requests may be sent
    Terminated,
}

impl DialogState {
    /// Ordering rank; transitions never regress to a lower rank
    fn rank(&self) -> u8 {
        match self {
            DialogState::NotStarted => 0,
            DialogState::Established => 1,
            DialogState::Cancelled => 2,
            DialogState::Terminated => 3,
        }
    }
}

/// Identity and state of one SIP dialog
#[derive(Debug, Clone)]
pub struct DialogPath {
    call_id: String,
    cseq: u32,
    local_tag: String,
    remote_tag: Option<String>,
    target: String,
    local_party: String,
    remote_party: String,
    route_set: Vec<String>,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    state: DialogState,
    session_established: bool,
}

impl DialogPath {
    pub fn new(
        call_id: String,
        cseq_start: u32,
        target: String,
        local_party: String,
        remote_party: String,
        route_set: Vec<String>,
    ) -> Self {
        Self {
            call_id,
            cseq: cseq_start,
            local_tag: generate_tag(),
            remote_tag: None,
            target,
            local_party,
            remote_party,
            route_set,
            local_sdp: None,
            remote_sdp: None,
            state: DialogState::NotStarted,
            session_established: false,
        }
    }

    /// Globally unique Call-ID for a fresh dialog
    pub fn generate_call_id(local_host: &str) -> String {
        format!("{}@{}", Uuid::new_v4().simple(), local_host)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    /// Increment before each new request on this dialog
    pub fn increment_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    /// Set the remote tag once it is learned; immutable afterwards
    pub fn set_remote_tag(&mut self, tag: String) {
        match &self.remote_tag {
            Some(existing) if *existing != tag => {
                warn!(
                    call_id = %self.call_id,
                    "Ignoring remote tag change {} -> {}", existing, tag
                );
            }
            Some(_) => {}
            None => self.remote_tag = Some(tag),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Update the target URI from a Contact learned in a response
    pub fn set_target(&mut self, target: String) {
        self.target = target;
    }

    pub fn local_party(&self) -> &str {
        &self.local_party
    }

    pub fn remote_party(&self) -> &str {
        &self.remote_party
    }

    pub fn route_set(&self) -> &[String] {
        &self.route_set
    }

    /// Replace the route set from Record-Route headers of a response
    pub fn set_route_set(&mut self, routes: Vec<String>) {
        self.route_set = routes;
    }

    pub fn local_sdp(&self) -> Option<&str> {
        self.local_sdp.as_deref()
    }

    /// Replaced wholesale on each offer/answer exchange
    pub fn set_local_sdp(&mut self, sdp: String) {
        self.local_sdp = Some(sdp);
    }

    pub fn remote_sdp(&self) -> Option<&str> {
        self.remote_sdp.as_deref()
    }

    pub fn set_remote_sdp(&mut self, sdp: String) {
        self.remote_sdp = Some(sdp);
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn is_sig_established(&self) -> bool {
        self.state.rank() >= DialogState::Established.rank()
    }

    pub fn is_session_established(&self) -> bool {
        self.session_established
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == DialogState::Cancelled
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }

    fn transition(&mut self, next: DialogState) {
        if next.rank() < self.state.rank() {
            warn!(
                call_id = %self.call_id,
                "Ignoring dialog state regression {:?} -> {:?}", self.state, next
            );
            return;
        }
        if next != self.state {
            debug!(call_id = %self.call_id, "Dialog state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Mark the signaling path established (2xx exchanged)
    pub fn sig_established(&mut self) {
        self.transition(DialogState::Established);
    }

    /// Mark the session fully established (ACK exchanged, media may start)
    pub fn session_established(&mut self) {
        self.transition(DialogState::Established);
        self.session_established = true;
    }

    /// Mark the session cancelled; ignored after signaling is established
    pub fn session_cancelled(&mut self) {
        if self.is_sig_established() && self.state != DialogState::Cancelled {
            debug!(call_id = %self.call_id, "CANCEL after signaling established, ignored");
            return;
        }
        self.transition(DialogState::Cancelled);
    }

    /// Mark the dialog terminated; no further requests may be sent
    pub fn session_terminated(&mut self) {
        self.transition(DialogState::Terminated);
    }
}

/// Random tag for From/To headers
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    let random: u64 = rng.gen();
    format!("{:x}", random)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog() -> DialogPath {
        DialogPath::new(
            "abc@host".to_string(),
            1,
            "sip:bob@example.com".to_string(),
            "sip:alice@example.com".to_string(),
            "sip:bob@example.com".to_string(),
            vec![],
        )
    }

    #[test]
    fn test_cseq_strictly_increasing() {
        let mut d = dialog();
        let mut last = d.cseq();
        for _ in 0..100 {
            let next = d.increment_cseq();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_remote_tag_immutable() {
        let mut d = dialog();
        d.set_remote_tag("first".to_string());
        d.set_remote_tag("second".to_string());
        assert_eq!(d.remote_tag(), Some("first"));
    }

    #[test]
    fn test_no_state_regression() {
        let mut d = dialog();
        d.session_terminated();
        d.sig_established();
        assert!(d.is_terminated());
    }

    #[test]
    fn test_cancel_after_sig_established_is_noop() {
        let mut d = dialog();
        d.sig_established();
        d.session_cancelled();
        assert!(!d.is_cancelled());
        assert!(d.is_sig_established());
    }

    #[test]
    fn test_cancel_before_sig_established() {
        let mut d = dialog();
        d.session_cancelled();
        assert!(d.is_cancelled());
    }

    #[test]
    fn test_transition_methods_idempotent() {
        let mut d = dialog();
        d.sig_established();
        d.session_established();
        d.session_established();
        assert!(d.is_session_established());
        d.session_terminated();
        d.session_terminated();
        assert!(d.is_terminated());
    }

    #[test]
    fn test_generated_call_ids_unique() {
        let a = DialogPath::generate_call_id("10.0.0.1");
        let b = DialogPath::generate_call_id("10.0.0.1");
        assert_ne!(a, b);
        assert!(a.ends_with("@10.0.0.1"));
    }
}
