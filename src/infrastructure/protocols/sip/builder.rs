//! SIP message builder utilities
//!
//! Builds outbound requests from a `DialogPath` and responses from inbound
//! requests. Non-standard headers (feature tags, Session-Expires, Refer-To)
//! go through `Header::Other`.

use super::dialog::DialogPath;
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use rand::Rng;
use rsip::prelude::UntypedHeader;
use rsip::{Header, Headers, Request, Response, StatusCode, Uri, Version};

/// Magic cookie prefix required for Via branches (RFC 3261 Section 8.1.1.7)
pub fn generate_branch() -> String {
    let mut rng = rand::thread_rng();
    let random: u64 = rng.gen();
    format!("z9hG4bK{:x}", random)
}

/// Per-client constants carried into every built request
#[derive(Debug, Clone)]
pub struct RequestFactory {
    /// Local address for Via headers, e.g. "192.168.1.100:5060"
    pub via_address: String,
    /// Via transport token, "UDP" or "TCP"
    pub transport: String,
    /// Local contact URI
    pub contact_uri: String,
    /// Feature tags appended to Contact (e.g. "+g.oma.sip-im")
    pub feature_tags: Vec<String>,
    /// `+sip.instance` value, one per client instance
    pub instance_id: String,
    pub user_agent: String,
}

impl RequestFactory {
    fn contact_value(&self) -> String {
        let mut value = format!("<{}>;+sip.instance=\"<urn:uuid:{}>\"", self.contact_uri, self.instance_id);
        for tag in &self.feature_tags {
            value.push(';');
            value.push_str(tag);
        }
        value
    }

    /// Build an in-dialog (or dialog-forming) request with a fresh branch.
    ///
    /// The caller is responsible for having incremented CSeq beforehand;
    /// ACK and CANCEL pass the CSeq of the INVITE they refer to.
    pub fn request(
        &self,
        method: SipMethod,
        dialog: &DialogPath,
        cseq: u32,
    ) -> Result<SipRequest, SipError> {
        let uri = Uri::try_from(dialog.target())
            .map_err(|e| SipError::InvalidMessage(format!("bad target URI: {}", e)))?;

        let mut headers = Headers::default();
        headers.push(Header::Via(rsip::headers::Via::new(format!(
            "SIP/2.0/{} {};branch={}",
            self.transport,
            self.via_address,
            generate_branch()
        ))));
        headers.push(Header::MaxForwards(rsip::headers::MaxForwards::new("70")));
        headers.push(Header::From(rsip::headers::From::new(format!(
            "<{}>;tag={}",
            dialog.local_party(),
            dialog.local_tag()
        ))));
        let to_value = match dialog.remote_tag() {
            Some(tag) => format!("<{}>;tag={}", dialog.remote_party(), tag),
            None => format!("<{}>", dialog.remote_party()),
        };
        headers.push(Header::To(rsip::headers::To::new(to_value)));
        headers.push(Header::CallId(rsip::headers::CallId::new(
            dialog.call_id().to_string(),
        )));
        headers.push(Header::CSeq(rsip::headers::CSeq::new(format!(
            "{} {}",
            cseq,
            method.as_str()
        ))));
        for route in dialog.route_set() {
            headers.push(Header::Route(rsip::headers::Route::new(format!(
                "<{}>",
                route
            ))));
        }
        if matches!(method, SipMethod::Invite | SipMethod::Register) {
            headers.push(Header::Contact(rsip::headers::Contact::new(
                self.contact_value(),
            )));
        }
        headers.push(Header::UserAgent(rsip::headers::UserAgent::new(
            self.user_agent.clone(),
        )));
        headers.push(Header::ContentLength(rsip::headers::ContentLength::new(
            "0",
        )));

        Ok(SipRequest::new(Request {
            method: method.to_rsip(),
            uri,
            version: Version::V2,
            headers,
            body: Vec::new(),
        }))
    }

    /// INVITE with an SDP offer body
    pub fn invite(&self, dialog: &DialogPath, sdp: &str) -> Result<SipRequest, SipError> {
        let mut request = self.request(SipMethod::Invite, dialog, dialog.cseq())?;
        set_body(&mut request, "application/sdp", sdp.as_bytes());
        // RFC 4028 session keep-alive, refreshed by the UAC
        request.inner.headers.push(Header::Other(
            "Session-Expires".to_string(),
            "1800;refresher=uac".to_string(),
        ));
        request.inner.headers.push(Header::Other(
            "Accept-Contact".to_string(),
            format!("*;{}", self.feature_tags.join(";")),
        ));
        Ok(request)
    }

    /// ACK for a 2xx, sharing the INVITE's CSeq number
    pub fn ack(&self, dialog: &DialogPath, invite_cseq: u32) -> Result<SipRequest, SipError> {
        self.request(SipMethod::Ack, dialog, invite_cseq)
    }

    /// CANCEL for a pending INVITE, sharing its CSeq number
    pub fn cancel(&self, dialog: &DialogPath, invite_cseq: u32) -> Result<SipRequest, SipError> {
        self.request(SipMethod::Cancel, dialog, invite_cseq)
    }

    pub fn bye(&self, dialog: &DialogPath) -> Result<SipRequest, SipError> {
        self.request(SipMethod::Bye, dialog, dialog.cseq())
    }

    /// REFER inviting `refer_to` into the dialog's conference
    pub fn refer(&self, dialog: &DialogPath, refer_to: &str) -> Result<SipRequest, SipError> {
        let mut request = self.request(SipMethod::Refer, dialog, dialog.cseq())?;
        request.inner.headers.push(Header::Other(
            "Refer-To".to_string(),
            format!("<{}>", refer_to),
        ));
        request.inner.headers.push(Header::Other(
            "Referred-By".to_string(),
            format!("<{}>", dialog.local_party()),
        ));
        Ok(request)
    }

    /// REGISTER for the dialog's local party with the given expire period
    pub fn register(&self, dialog: &DialogPath, expires: u32) -> Result<SipRequest, SipError> {
        let mut request = self.request(SipMethod::Register, dialog, dialog.cseq())?;
        request
            .inner
            .headers
            .push(Header::Expires(rsip::headers::Expires::new(
                expires.to_string(),
            )));
        request.inner.headers.push(Header::Other(
            "Supported".to_string(),
            "path,gruu".to_string(),
        ));
        Ok(request)
    }
}

/// Replace the body and Content-Type/Content-Length of a request
pub fn set_body(request: &mut SipRequest, content_type: &str, body: &[u8]) {
    super::message::remove_header(&mut request.inner.headers, "Content-Type");
    super::message::remove_header(&mut request.inner.headers, "Content-Length");
    request.inner.headers.push(Header::ContentType(
        rsip::headers::ContentType::new(content_type.to_string()),
    ));
    request
        .inner
        .headers
        .push(Header::ContentLength(rsip::headers::ContentLength::new(
            body.len().to_string(),
        )));
    request.inner.body = body.to_vec();
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
    content_type: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
            content_type: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn trying() -> Self {
        Self::new(100)
    }

    pub fn ringing() -> Self {
        Self::new(180)
    }

    /// Local tag appended to To when the request carried none
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.content_type = Some(content_type.to_string());
        self.body = body;
        self
    }

    pub fn build_for_request(mut self, request: &SipRequest) -> Result<SipResponse, SipError> {
        // Copy essential headers from the request
        for header in request.headers().iter() {
            match header {
                Header::Via(_)
                | Header::From(_)
                | Header::CallId(_)
                | Header::CSeq(_)
                | Header::RecordRoute(_) => {
                    self.headers.push(header.clone());
                }
                Header::Other(name, _) if name.eq_ignore_ascii_case("Record-Route") => {
                    self.headers.push(header.clone());
                }
                Header::To(to) => {
                    let value = to.value().to_string();
                    let tagged = if value.contains("tag=") {
                        value
                    } else if let Some(tag) = &self.to_tag {
                        format!("{};tag={}", value, tag)
                    } else {
                        value
                    };
                    self.headers.push(Header::To(rsip::headers::To::new(tagged)));
                }
                _ => {}
            }
        }

        if let Some(content_type) = &self.content_type {
            self.headers.push(Header::ContentType(
                rsip::headers::ContentType::new(content_type.clone()),
            ));
        }
        self.headers
            .push(Header::ContentLength(rsip::headers::ContentLength::new(
                self.body.len().to_string(),
            )));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(self.headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}
