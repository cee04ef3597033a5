//! SDP (Session Description Protocol) handling and answer negotiation
//!
//! Covers the subset IMS sessions use: audio/video RTP offers with
//! rtpmap/fmtp/framerate, and MSRP message/file-transfer offers with
//! path/setup/accept-types/file-selector attributes. Negotiation picks a
//! mutually supported codec or MIME type, or fails before any transport is
//! opened.

use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SdpError {
    #[error("Malformed SDP: {0}")]
    Malformed(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMedia(String),
}

/// TCP setup role from `a=setup` (RFC 4145)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupRole {
    /// Initiates the outbound TCP connection
    Active,
    /// Listens for the connection
    Passive,
    /// Offerer leaves the choice to the answerer
    ActPass,
}

impl SetupRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "active" => Some(SetupRole::Active),
            "passive" => Some(SetupRole::Passive),
            "actpass" => Some(SetupRole::ActPass),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SetupRole::Active => "active",
            SetupRole::Passive => "passive",
            SetupRole::ActPass => "actpass",
        }
    }

    /// Role the answerer takes against this offered role
    pub fn answer(&self) -> SetupRole {
        match self {
            SetupRole::Active => SetupRole::Passive,
            SetupRole::Passive => SetupRole::Active,
            // We prefer to listen when given the choice
            SetupRole::ActPass => SetupRole::Passive,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

/// One m= section with its attribute lines
#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String, // "audio", "video", "message"
    pub port: u16,
    pub protocol: String, // "RTP/AVP" or "TCP/MSRP"
    pub formats: Vec<String>,
    pub rtpmap: Vec<(String, String)>, // (payload type, encoding)
    /// Remaining a= lines in order; flag attributes carry an empty value
    pub attributes: Vec<(String, String)>,
}

impl SdpMedia {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        self.attributes.push((name.to_string(), value.to_string()));
    }

    pub fn setup(&self) -> Option<SetupRole> {
        self.attribute("setup").and_then(SetupRole::parse)
    }

    /// MSRP path URI, e.g. `msrp://10.0.0.1:2855/abc;tcp`
    pub fn msrp_path(&self) -> Option<&str> {
        self.attribute("path")
    }

    pub fn accept_types(&self) -> Vec<String> {
        self.attribute("accept-types")
            .map(|v| v.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn file_selector(&self) -> Option<&str> {
        self.attribute("file-selector")
    }

    pub fn file_transfer_id(&self) -> Option<&str> {
        self.attribute("file-transfer-id")
    }

    pub fn max_size(&self) -> Option<u64> {
        self.attribute("max-size").and_then(|v| v.parse().ok())
    }

    pub fn fmtp(&self, payload_type: &str) -> Option<&str> {
        self.attributes.iter().find_map(|(n, v)| {
            if n.eq_ignore_ascii_case("fmtp") && v.starts_with(payload_type) {
                Some(v.as_str())
            } else {
                None
            }
        })
    }

    pub fn is_msrp(&self) -> bool {
        self.protocol.contains("MSRP")
    }
}

/// Parsed SDP session description
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: SdpConnection,
    pub media: Vec<SdpMedia>,
}

fn origin_and_connection(local_ip: IpAddr) -> (SdpOrigin, SdpConnection) {
    let address_type = if local_ip.is_ipv4() { "IP4" } else { "IP6" }.to_string();
    (
        SdpOrigin {
            username: "magpie".to_string(),
            session_id: chrono::Utc::now().timestamp().to_string(),
            session_version: "1".to_string(),
            network_type: "IN".to_string(),
            address_type: address_type.clone(),
            address: local_ip.to_string(),
        },
        SdpConnection {
            network_type: "IN".to_string(),
            address_type,
            address: local_ip.to_string(),
        },
    )
}

impl SdpSession {
    fn with_media(local_ip: IpAddr, media: SdpMedia) -> Self {
        let (origin, connection) = origin_and_connection(local_ip);
        Self {
            version: 0,
            origin,
            session_name: "-".to_string(),
            connection,
            media: vec![media],
        }
    }

    /// MSRP chat offer/answer: `m=message <port> TCP/MSRP *`
    pub fn create_message_session(
        local_ip: IpAddr,
        local_port: u16,
        msrp_path: &str,
        setup: SetupRole,
        accept_types: &[String],
    ) -> Self {
        let mut media = SdpMedia {
            media_type: "message".to_string(),
            port: local_port,
            protocol: "TCP/MSRP".to_string(),
            formats: vec!["*".to_string()],
            rtpmap: Vec::new(),
            attributes: Vec::new(),
        };
        media.set_attribute("path", msrp_path);
        media.set_attribute("setup", setup.as_str());
        media.set_attribute("accept-types", &accept_types.join(" "));
        media.set_attribute("sendrecv", "");
        Self::with_media(local_ip, media)
    }

    /// MSRP file-transfer offer with the selector attributes
    #[allow(clippy::too_many_arguments)]
    pub fn create_file_session(
        local_ip: IpAddr,
        local_port: u16,
        msrp_path: &str,
        setup: SetupRole,
        file_name: &str,
        mime_type: &str,
        file_size: u64,
        transfer_id: &str,
        max_size: u64,
    ) -> Self {
        let mut session = Self::create_message_session(
            local_ip,
            local_port,
            msrp_path,
            setup,
            &[mime_type.to_string()],
        );
        let media = &mut session.media[0];
        media.set_attribute(
            "file-selector",
            &format!("name:\"{}\" type:{} size:{}", file_name, mime_type, file_size),
        );
        media.set_attribute("file-transfer-id", transfer_id);
        media.set_attribute("max-size", &max_size.to_string());
        session
    }

    /// RTP audio offer listing the supported codecs in preference order
    pub fn create_audio_session(
        local_ip: IpAddr,
        local_port: u16,
        codecs: &[(String, String)],
    ) -> Self {
        let media = SdpMedia {
            media_type: "audio".to_string(),
            port: local_port,
            protocol: "RTP/AVP".to_string(),
            formats: codecs.iter().map(|(pt, _)| pt.clone()).collect(),
            rtpmap: codecs.to_vec(),
            attributes: vec![("sendrecv".to_string(), String::new())],
        };
        Self::with_media(local_ip, media)
    }

    /// RTP video offer with framerate
    pub fn create_video_session(
        local_ip: IpAddr,
        local_port: u16,
        codecs: &[(String, String)],
        framerate: u32,
    ) -> Self {
        let mut session = Self::create_audio_session(local_ip, local_port, codecs);
        let media = &mut session.media[0];
        media.media_type = "video".to_string();
        media
            .attributes
            .insert(0, ("framerate".to_string(), framerate.to_string()));
        session
    }

    /// Serialize to SDP text
    pub fn to_sdp_string(&self) -> String {
        let mut sdp = String::new();

        sdp.push_str(&format!("v={}\r\n", self.version));
        sdp.push_str(&format!(
            "o={} {} {} {} {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.network_type,
            self.origin.address_type,
            self.origin.address
        ));
        sdp.push_str(&format!("s={}\r\n", self.session_name));
        sdp.push_str(&format!(
            "c={} {} {}\r\n",
            self.connection.network_type, self.connection.address_type, self.connection.address
        ));
        sdp.push_str("t=0 0\r\n");

        for media in &self.media {
            sdp.push_str(&format!(
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            ));
            for (pt, encoding) in &media.rtpmap {
                sdp.push_str(&format!("a=rtpmap:{} {}\r\n", pt, encoding));
            }
            for (name, value) in &media.attributes {
                if value.is_empty() {
                    sdp.push_str(&format!("a={}\r\n", name));
                } else {
                    sdp.push_str(&format!("a={}:{}\r\n", name, value));
                }
            }
        }

        sdp
    }

    /// Parse SDP from text
    pub fn parse(sdp_body: &str) -> Result<Self, SdpError> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut media: Vec<SdpMedia> = Vec::new();
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp_body.lines() {
            let line = line.trim_end_matches('\r').trim();
            if line.len() < 2 || !line.contains('=') {
                continue;
            }

            let (field_type, value) = line.split_at(2);
            let value = value.trim();

            match field_type {
                "v=" => {
                    version = value.parse().unwrap_or(0);
                }
                "o=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            network_type: parts[3].to_string(),
                            address_type: parts[4].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s=" => {
                    session_name = value.to_string();
                }
                "c=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        let conn = SdpConnection {
                            network_type: parts[0].to_string(),
                            address_type: parts[1].to_string(),
                            address: parts[2].to_string(),
                        };
                        if current_media.is_none() {
                            connection = Some(conn);
                        }
                        // Media-level connection overrides are not tracked
                    }
                }
                "m=" => {
                    if let Some(m) = current_media.take() {
                        media.push(m);
                    }
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 4 {
                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            rtpmap: Vec::new(),
                            attributes: Vec::new(),
                        });
                    }
                }
                "a=" => {
                    if let Some(media) = current_media.as_mut() {
                        if let Some(rtpmap_value) = value.strip_prefix("rtpmap:") {
                            if let Some((pt, encoding)) = rtpmap_value.split_once(' ') {
                                media.rtpmap.push((pt.to_string(), encoding.to_string()));
                            }
                        } else if let Some((name, attr_value)) = value.split_once(':') {
                            media
                                .attributes
                                .push((name.to_string(), attr_value.to_string()));
                        } else {
                            media.attributes.push((value.to_string(), String::new()));
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(m) = current_media.take() {
            media.push(m);
        }

        let origin = origin.ok_or_else(|| SdpError::Malformed("missing o= line".to_string()))?;
        let connection =
            connection.ok_or_else(|| SdpError::Malformed("missing c= line".to_string()))?;

        Ok(Self {
            version,
            origin,
            session_name,
            connection,
            media,
        })
    }

    pub fn first_media(&self) -> Option<&SdpMedia> {
        self.media.first()
    }

    pub fn media_of_type(&self, media_type: &str) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == media_type)
    }

    pub fn msrp_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.is_msrp())
    }
}

/// Pick the MIME types an MSRP answer accepts, or fail with unsupported media
pub fn negotiate_accept_types(
    offered: &[String],
    supported: &[String],
) -> Result<Vec<String>, SdpError> {
    // A bare "*" offer accepts anything we support
    if offered.iter().any(|t| t == "*") {
        return Ok(supported.to_vec());
    }
    let common: Vec<String> = offered
        .iter()
        .filter(|t| supported.iter().any(|s| s.eq_ignore_ascii_case(t)))
        .cloned()
        .collect();
    if common.is_empty() {
        Err(SdpError::UnsupportedMedia(format!(
            "no common accept-type in [{}]",
            offered.join(" ")
        )))
    } else {
        Ok(common)
    }
}

/// Pick the first offered RTP codec we support, by encoding name
pub fn negotiate_codec(
    offer: &SdpMedia,
    supported: &[(String, String)],
) -> Result<(String, String), SdpError> {
    for (pt, encoding) in &offer.rtpmap {
        let name = encoding.split('/').next().unwrap_or(encoding);
        if supported
            .iter()
            .any(|(_, enc)| enc.split('/').next().unwrap_or(enc).eq_ignore_ascii_case(name))
        {
            return Ok((pt.clone(), encoding.clone()));
        }
    }
    // Static payload types may appear without an rtpmap line
    for format in &offer.formats {
        if supported.iter().any(|(pt, _)| pt == format) {
            let encoding = supported
                .iter()
                .find(|(pt, _)| pt == format)
                .map(|(_, enc)| enc.clone())
                .unwrap_or_default();
            return Ok((format.clone(), encoding));
        }
    }
    Err(SdpError::UnsupportedMedia(format!(
        "no common codec for m={}",
        offer.media_type
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codecs() -> Vec<(String, String)> {
        vec![
            ("0".to_string(), "PCMU/8000".to_string()),
            ("8".to_string(), "PCMA/8000".to_string()),
        ]
    }

    #[test]
    fn test_create_audio_offer() {
        let local_ip: IpAddr = "192.168.1.100".parse().unwrap();
        let sdp = SdpSession::create_audio_session(local_ip, 10000, &codecs());
        let text = sdp.to_sdp_string();
        assert!(text.contains("v=0"));
        assert!(text.contains("m=audio 10000 RTP/AVP 0 8"));
        assert!(text.contains("a=rtpmap:0 PCMU/8000"));
        assert!(text.contains("a=sendrecv"));
    }

    #[test]
    fn test_message_offer_roundtrip() {
        let local_ip: IpAddr = "10.0.0.5".parse().unwrap();
        let sdp = SdpSession::create_message_session(
            local_ip,
            2855,
            "msrp://10.0.0.5:2855/fxo3s;tcp",
            SetupRole::Active,
            &["text/plain".to_string(), "message/cpim".to_string()],
        );
        let text = sdp.to_sdp_string();
        assert!(text.contains("m=message 2855 TCP/MSRP *"));

        let parsed = SdpSession::parse(&text).unwrap();
        let media = parsed.msrp_media().unwrap();
        assert_eq!(media.msrp_path(), Some("msrp://10.0.0.5:2855/fxo3s;tcp"));
        assert_eq!(media.setup(), Some(SetupRole::Active));
        assert_eq!(
            media.accept_types(),
            vec!["text/plain".to_string(), "message/cpim".to_string()]
        );
    }

    #[test]
    fn test_file_offer_attributes() {
        let local_ip: IpAddr = "10.0.0.5".parse().unwrap();
        let sdp = SdpSession::create_file_session(
            local_ip,
            2855,
            "msrp://10.0.0.5:2855/ft1;tcp",
            SetupRole::Active,
            "photo.jpg",
            "image/jpeg",
            48210,
            "ft-9981",
            1048576,
        );
        let parsed = SdpSession::parse(&sdp.to_sdp_string()).unwrap();
        let media = parsed.msrp_media().unwrap();
        assert_eq!(
            media.file_selector(),
            Some("name:\"photo.jpg\" type:image/jpeg size:48210")
        );
        assert_eq!(media.file_transfer_id(), Some("ft-9981"));
        assert_eq!(media.max_size(), Some(1048576));
    }

    #[test]
    fn test_setup_answer_roles() {
        assert_eq!(SetupRole::Active.answer(), SetupRole::Passive);
        assert_eq!(SetupRole::Passive.answer(), SetupRole::Active);
        assert_eq!(SetupRole::ActPass.answer(), SetupRole::Passive);
    }

    #[test]
    fn test_negotiate_codec_picks_mutual() {
        let offer_text = "v=0\r\no=u 1 1 IN IP4 10.0.0.9\r\ns=-\r\nc=IN IP4 10.0.0.9\r\nt=0 0\r\n\
                          m=audio 4000 RTP/AVP 97 8\r\na=rtpmap:97 AMR/8000\r\na=rtpmap:8 PCMA/8000\r\n";
        let offer = SdpSession::parse(offer_text).unwrap();
        let picked = negotiate_codec(offer.first_media().unwrap(), &codecs()).unwrap();
        assert_eq!(picked, ("8".to_string(), "PCMA/8000".to_string()));
    }

    #[test]
    fn test_negotiate_codec_fails_without_mutual() {
        let offer_text = "v=0\r\no=u 1 1 IN IP4 10.0.0.9\r\ns=-\r\nc=IN IP4 10.0.0.9\r\nt=0 0\r\n\
                          m=audio 4000 RTP/AVP 97\r\na=rtpmap:97 AMR/8000\r\n";
        let offer = SdpSession::parse(offer_text).unwrap();
        assert!(matches!(
            negotiate_codec(offer.first_media().unwrap(), &codecs()),
            Err(SdpError::UnsupportedMedia(_))
        ));
    }

    #[test]
    fn test_negotiate_accept_types() {
        let offered = vec!["message/cpim".to_string(), "text/plain".to_string()];
        let supported = vec!["text/plain".to_string()];
        assert_eq!(
            negotiate_accept_types(&offered, &supported).unwrap(),
            vec!["text/plain".to_string()]
        );

        let wildcard = vec!["*".to_string()];
        assert_eq!(
            negotiate_accept_types(&wildcard, &supported).unwrap(),
            supported
        );

        let disjoint = vec!["image/png".to_string()];
        assert!(negotiate_accept_types(&disjoint, &supported).is_err());
    }
}
