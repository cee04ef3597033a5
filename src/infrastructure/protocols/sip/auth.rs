//! Client-side SIP Digest Authentication (RFC 2617, RFC 3261)
//!
//! One agent per registration and per session; no state is shared between
//! them. The agent is a no-op until it has read a challenge, then answers
//! every subsequent request with an incrementing nonce count.

use super::message::{remove_header, SipError, SipRequest, SipResponse};
use base64::Engine;
use rand::Rng;
use rsip::Header;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Which header pair the challenge arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// 401 / WWW-Authenticate, answered with Authorization
    WwwAuthenticate,
    /// 407 / Proxy-Authenticate, answered with Proxy-Authorization
    ProxyAuthenticate,
}

impl ChallengeKind {
    pub fn answer_header(&self) -> &'static str {
        match self {
            ChallengeKind::WwwAuthenticate => "Authorization",
            ChallengeKind::ProxyAuthenticate => "Proxy-Authorization",
        }
    }
}

/// Parsed digest challenge
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: String,
    pub kind: ChallengeKind,
}

impl DigestChallenge {
    /// Parse a `Digest realm="...", nonce="..."` challenge value
    pub fn parse(value: &str, kind: ChallengeKind) -> Result<Self, SipError> {
        let params = parse_digest_params(value);

        let realm = params
            .get("realm")
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?
            .clone();
        let nonce = params
            .get("nonce")
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?
            .clone();

        Ok(Self {
            realm,
            nonce,
            qop: params.get("qop").cloned(),
            opaque: params.get("opaque").cloned(),
            algorithm: params
                .get("algorithm")
                .cloned()
                .unwrap_or_else(|| "MD5".to_string()),
            kind,
        })
    }
}

/// Parse `key="value"` pairs of a Digest header value
fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let digest_str = value.strip_prefix("Digest ").unwrap_or(value).trim();

    for part in digest_str.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim().to_lowercase();
            let value = value.trim().trim_matches('"');
            params.insert(key, value.to_string());
        }
    }
    params
}

/// Digest response per RFC 2617 Section 3.2.2
pub fn compute_digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: u32,
    cnonce: &str,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = {
        let digest = md5::compute(format!("{}:{}:{}", username, realm, password));
        format!("{:x}", digest)
    };

    // HA2 = MD5(method:uri)
    let ha2 = {
        let digest = md5::compute(format!("{}:{}", method, uri));
        format!("{:x}", digest)
    };

    if let Some(qop_value) = qop {
        let digest = md5::compute(format!(
            "{}:{}:{:08x}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop_value, ha2
        ));
        format!("{:x}", digest)
    } else {
        let digest = md5::compute(format!("{}:{}:{}", ha1, nonce, ha2));
        format!("{:x}", digest)
    }
}

/// Per-registration / per-session authentication agent
pub struct SessionAuthAgent {
    username: String,
    password: String,
    challenge: Option<DigestChallenge>,
    /// Increments on every computed response sharing the same nonce
    nonce_count: u32,
}

impl SessionAuthAgent {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            challenge: None,
            nonce_count: 0,
        }
    }

    pub fn has_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    pub fn realm(&self) -> Option<&str> {
        self.challenge.as_ref().map(|c| c.realm.as_str())
    }

    /// Read the challenge from a 401/407 response for use on the next attempt
    pub fn read_challenge(&mut self, response: &SipResponse) -> Result<(), SipError> {
        let (value, kind) = if let Some(value) = response.header("WWW-Authenticate") {
            (value, ChallengeKind::WwwAuthenticate)
        } else if let Some(value) = response.header("Proxy-Authenticate") {
            (value, ChallengeKind::ProxyAuthenticate)
        } else {
            return Err(SipError::Authentication(
                "Challenge response without authenticate header".to_string(),
            ));
        };

        let challenge = DigestChallenge::parse(&value, kind)?;

        // A fresh nonce restarts the replay counter
        let same_nonce = self
            .challenge
            .as_ref()
            .map(|c| c.nonce == challenge.nonce)
            .unwrap_or(false);
        if !same_nonce {
            self.nonce_count = 0;
        }

        debug!(realm = %challenge.realm, "Read digest challenge");
        self.challenge = Some(challenge);
        Ok(())
    }

    /// Compute the authorization value for a request, or `None` before any
    /// challenge is known
    pub fn authorization_value(&mut self, method: &str, uri: &str) -> Option<(String, String)> {
        let challenge = self.challenge.as_ref()?;

        self.nonce_count += 1;
        let nc = self.nonce_count;
        let cnonce = generate_cnonce();
        // qop=auth only; auth-int would hash the body as well
        let qop = challenge.qop.as_ref().map(|q| {
            if q.split(',').any(|q| q.trim() == "auth") {
                "auth".to_string()
            } else {
                q.clone()
            }
        });

        let response = compute_digest_response(
            &self.username,
            &self.password,
            &challenge.realm,
            &challenge.nonce,
            method,
            uri,
            qop.as_deref(),
            nc,
            &cnonce,
        );

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            self.username, challenge.realm, challenge.nonce, uri, response, challenge.algorithm
        );
        if let Some(qop) = &qop {
            value.push_str(&format!(r#", qop={}, nc={:08x}, cnonce="{}""#, qop, nc, cnonce));
        }
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }

        Some((challenge.kind.answer_header().to_string(), value))
    }

    /// Append the Authorization / Proxy-Authorization header to a request.
    ///
    /// No-op (returns false) if no realm/nonce is known yet.
    pub fn set_authorization_header(&mut self, request: &mut SipRequest) -> bool {
        let method = match request.method() {
            Some(m) => m.as_str().to_string(),
            None => {
                warn!("Cannot authorize request with unknown method");
                return false;
            }
        };
        let uri = request.uri().to_string();

        match self.authorization_value(&method, &uri) {
            Some((name, value)) => {
                remove_header(&mut request.inner.headers, &name);
                request
                    .inner
                    .headers
                    .push(Header::Other(name, value));
                true
            }
            None => false,
        }
    }
}

/// Random client nonce
fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..12).map(|_| rng.gen()).collect();
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(random_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc2617_reference_vector() {
        // RFC 2617 Section 3.5 example
        let response = compute_digest_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some("auth"),
            1,
            "0a4f113b",
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_parse_challenge() {
        let value = r#"Digest realm="ims.example.com", qop="auth", nonce="abcdef", opaque="xyz", algorithm=MD5"#;
        let challenge = DigestChallenge::parse(value, ChallengeKind::WwwAuthenticate).unwrap();
        assert_eq!(challenge.realm, "ims.example.com");
        assert_eq!(challenge.nonce, "abcdef");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert_eq!(challenge.algorithm, "MD5");
    }

    #[test]
    fn test_agent_noop_before_challenge() {
        let mut agent = SessionAuthAgent::new("alice", "secret");
        assert!(agent.authorization_value("REGISTER", "sip:ims.example.com").is_none());
    }

    fn challenge_response(header: &str, value: &str) -> SipResponse {
        let data = format!(
            "SIP/2.0 401 Unauthorized\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\r\n\
             From: <sip:a@x>;tag=1\r\n\
             To: <sip:a@x>;tag=2\r\n\
             Call-ID: auth-test\r\n\
             CSeq: 1 REGISTER\r\n\
             {}: {}\r\n\
             Content-Length: 0\r\n\r\n",
            header, value
        );
        SipResponse::parse(data.as_bytes()).unwrap()
    }

    #[test]
    fn test_nonce_count_increments_per_answer() {
        let mut agent = SessionAuthAgent::new("alice", "secret");
        let resp = challenge_response(
            "WWW-Authenticate",
            r#"Digest realm="ims.example.com", qop="auth", nonce="n1""#,
        );
        agent.read_challenge(&resp).unwrap();

        let (_, first) = agent
            .authorization_value("REGISTER", "sip:ims.example.com")
            .unwrap();
        let (_, second) = agent
            .authorization_value("REGISTER", "sip:ims.example.com")
            .unwrap();
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn test_fresh_nonce_resets_counter() {
        let mut agent = SessionAuthAgent::new("alice", "secret");
        let first = challenge_response(
            "WWW-Authenticate",
            r#"Digest realm="ims.example.com", qop="auth", nonce="n1""#,
        );
        agent.read_challenge(&first).unwrap();
        agent
            .authorization_value("REGISTER", "sip:ims.example.com")
            .unwrap();

        let second = challenge_response(
            "WWW-Authenticate",
            r#"Digest realm="ims.example.com", qop="auth", nonce="n2""#,
        );
        agent.read_challenge(&second).unwrap();
        let (_, value) = agent
            .authorization_value("REGISTER", "sip:ims.example.com")
            .unwrap();
        assert!(value.contains("nc=00000001"));
        assert!(value.contains(r#"nonce="n2""#));
    }

    #[test]
    fn test_proxy_challenge_answered_with_proxy_authorization() {
        let mut agent = SessionAuthAgent::new("alice", "secret");
        let resp = challenge_response(
            "Proxy-Authenticate",
            r#"Digest realm="ims.example.com", nonce="n1""#,
        );
        agent.read_challenge(&resp).unwrap();
        let (name, value) = agent
            .authorization_value("INVITE", "sip:bob@example.com")
            .unwrap();
        assert_eq!(name, "Proxy-Authorization");
        // Without qop the nc/cnonce fields are omitted
        assert!(!value.contains("nc="));
    }
}
