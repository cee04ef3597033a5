//! SIP message types and parsing
//!
//! Thin wrappers over the `rsip` parser. Header access is string-level where
//! the untyped representation is enough; the parser library stays a black
//! box.

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Transaction timeout")]
    Timeout,

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Dialog error: {0}")]
    Dialog(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Refer,
    Message,
    Notify,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Notify => "NOTIFY",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Refer => Some(SipMethod::Refer),
            Method::Message => Some(SipMethod::Message),
            Method::Notify => Some(SipMethod::Notify),
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
            SipMethod::Notify => Method::Notify,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Find a header value by name, independent of how rsip typed it.
///
/// Each `Header` renders as a full `Name: value` line, so splitting at the
/// first colon works for dedicated variants and `Other` alike.
pub fn find_header_value(headers: &Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|h| {
        let line = h.to_string();
        let (header_name, value) = line.split_once(':')?;
        if header_name.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Find every value of a repeatable header, in message order
pub fn find_header_values(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| {
            let line = h.to_string();
            let (header_name, value) = line.split_once(':')?;
            if header_name.trim().eq_ignore_ascii_case(name) {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Extract the `tag` parameter from a From/To header value
fn extract_tag(value: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, tag) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("tag") {
            Some(tag.trim().to_string())
        } else {
            None
        }
    })
}

/// Extract the URI part of a name-addr header value (`"Name" <sip:a@b>;p=1`)
pub fn extract_uri(value: &str) -> String {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].to_string();
        }
    }
    // addr-spec form: strip parameters
    value
        .split(';')
        .next()
        .unwrap_or(value)
        .trim()
        .to_string()
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn header(&self, name: &str) -> Option<String> {
        find_header_value(&self.inner.headers, name)
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header("From").and_then(|v| extract_tag(&v))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(|v| extract_tag(&v))
    }

    pub fn from_uri(&self) -> Option<String> {
        self.header("From").map(|v| extract_uri(&v))
    }

    pub fn contact_uri(&self) -> Option<String> {
        self.header("Contact").map(|v| extract_uri(&v))
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq")
            .and_then(|v| v.split_whitespace().next().map(|s| s.to_string()))
            .and_then(|s| s.parse().ok())
    }

    pub fn cseq_method(&self) -> Option<String> {
        self.header("CSeq")
            .and_then(|v| v.split_whitespace().nth(1).map(|s| s.to_string()))
    }

    pub fn content_type(&self) -> Option<String> {
        self.header("Content-Type")
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.inner.body).ok()
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn header(&self, name: &str) -> Option<String> {
        find_header_value(&self.inner.headers, name)
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(|v| extract_tag(&v))
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq")
            .and_then(|v| v.split_whitespace().next().map(|s| s.to_string()))
            .and_then(|s| s.parse().ok())
    }

    pub fn cseq_method(&self) -> Option<String> {
        self.header("CSeq")
            .and_then(|v| v.split_whitespace().nth(1).map(|s| s.to_string()))
    }

    pub fn contact_uri(&self) -> Option<String> {
        self.header("Contact").map(|v| extract_uri(&v))
    }

    /// Expires from the Expires header, falling back to the Contact
    /// `expires` parameter
    pub fn expires(&self) -> Option<u32> {
        if let Some(value) = self.header("Expires") {
            if let Ok(secs) = value.parse() {
                return Some(secs);
            }
        }
        self.header("Contact").and_then(|contact| {
            contact.split(';').skip(1).find_map(|param| {
                let (key, value) = param.split_once('=')?;
                if key.trim().eq_ignore_ascii_case("expires") {
                    value.trim().parse().ok()
                } else {
                    None
                }
            })
        })
    }

    pub fn min_expires(&self) -> Option<u32> {
        self.header("Min-Expires").and_then(|v| v.parse().ok())
    }

    /// Route set from Record-Route headers, top first
    pub fn record_routes(&self) -> Vec<String> {
        find_header_values(&self.inner.headers, "Record-Route")
            .iter()
            .map(|v| extract_uri(v))
            .collect()
    }

    /// WWW-Authenticate or Proxy-Authenticate challenge value
    pub fn authenticate_header(&self) -> Option<String> {
        self.header("WWW-Authenticate")
            .or_else(|| self.header("Proxy-Authenticate"))
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.inner.body).ok()
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Requests and responses are distinguished by the start line
        if data.starts_with(b"SIP/2.0") {
            return Ok(SipMessage::Response(SipResponse::parse(data)?));
        }
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }
        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }
        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<String> {
        match self {
            SipMessage::Request(req) => req.call_id(),
            SipMessage::Response(resp) => resp.call_id(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

/// Remove a header (all occurrences) by name, for auth-retry rebuilds
pub fn remove_header(headers: &mut Headers, name: &str) {
    let kept: Vec<Header> = headers
        .iter()
        .filter(|h| {
            let line = h.to_string();
            match line.split_once(':') {
                Some((header_name, _)) => !header_name.trim().eq_ignore_ascii_case(name),
                None => true,
            }
        })
        .cloned()
        .collect();
    *headers = Headers::from(kept);
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &[u8] = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
        From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
        To: Alice <sip:alice@example.com>\r\n\
        Call-ID: a84b4c76e66710@pc33.example.com\r\n\
        CSeq: 314159 REGISTER\r\n\
        Contact: <sip:alice@192.168.1.100:5060>\r\n\
        Expires: 3600\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_register_request() {
        let msg = SipMessage::parse(REGISTER).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(
            req.call_id(),
            Some("a84b4c76e66710@pc33.example.com".to_string())
        );
        assert_eq!(req.cseq(), Some(314159));
        assert_eq!(req.cseq_method(), Some("REGISTER".to_string()));
        assert_eq!(req.from_tag(), Some("1928301774".to_string()));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.from_uri(), Some("sip:alice@example.com".to_string()));
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
            From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
            To: Alice <sip:alice@example.com>;tag=a6c85cf\r\n\
            Call-ID: a84b4c76e66710@pc33.example.com\r\n\
            CSeq: 314159 REGISTER\r\n\
            Record-Route: <sip:p1.example.com;lr>\r\n\
            Record-Route: <sip:p2.example.com;lr>\r\n\
            Contact: <sip:alice@192.168.1.100:5060>;expires=1800\r\n\
            Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.to_tag(), Some("a6c85cf".to_string()));
        assert_eq!(resp.expires(), Some(1800));
        assert_eq!(
            resp.record_routes(),
            vec!["sip:p1.example.com;lr", "sip:p2.example.com;lr"]
        );
    }

    #[test]
    fn test_min_expires() {
        let data = b"SIP/2.0 423 Interval Too Brief\r\n\
            Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
            From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
            To: Alice <sip:alice@example.com>;tag=b12\r\n\
            Call-ID: a84b4c76e66710@pc33.example.com\r\n\
            CSeq: 1 REGISTER\r\n\
            Min-Expires: 600\r\n\
            Content-Length: 0\r\n\r\n";

        let resp = SipResponse::parse(data).unwrap();
        assert_eq!(resp.status_code(), 423);
        assert_eq!(resp.min_expires(), Some(600));
    }

    #[test]
    fn test_extract_uri_forms() {
        assert_eq!(
            extract_uri("\"Bob\" <sip:bob@example.com>;tag=x"),
            "sip:bob@example.com"
        );
        assert_eq!(extract_uri("sip:bob@example.com;transport=tcp"), "sip:bob@example.com");
    }
}
