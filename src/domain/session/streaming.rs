//! RTP streaming sessions (audio/video)

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{MediaBridge, MediaTransport, SessionBehavior};
use crate::domain::shared::{Result, SessionError};
use crate::infrastructure::media::rtp::{RtpListener, RtpTransport};
use crate::infrastructure::protocols::sip::dispatcher::ServiceKind;
use crate::infrastructure::protocols::sip::sdp::negotiate_codec;
use crate::infrastructure::protocols::sip::SdpSession;

pub struct StreamingBehavior {
    local_ip: IpAddr,
    rtp_port: u16,
    /// (payload type, encoding) in preference order, e.g. ("0", "PCMU/8000")
    codecs: Vec<(String, String)>,
}

impl StreamingBehavior {
    pub fn new(local_ip: IpAddr, rtp_port: u16, codecs: Vec<(String, String)>) -> Self {
        Self {
            local_ip,
            rtp_port,
            codecs,
        }
    }

    fn streaming_media<'a>(sdp: &'a SdpSession) -> Result<&'a crate::infrastructure::protocols::sip::SdpMedia> {
        sdp.media_of_type("audio")
            .or_else(|| sdp.media_of_type("video"))
            .ok_or_else(|| {
                SessionError::UnsupportedMedia("no audio or video media".to_string())
            })
    }
}

fn clock_rate(encoding: &str) -> u32 {
    encoding
        .split('/')
        .nth(1)
        .and_then(|r| r.parse().ok())
        .unwrap_or(8000)
}

#[async_trait]
impl SessionBehavior for StreamingBehavior {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Streaming
    }

    fn build_offer(&self) -> Result<SdpSession> {
        if self.codecs.is_empty() {
            return Err(SessionError::UnsupportedMedia(
                "no codecs configured".to_string(),
            ));
        }
        Ok(SdpSession::create_audio_session(
            self.local_ip,
            self.rtp_port,
            &self.codecs,
        ))
    }

    fn build_answer(&self, offer: &SdpSession) -> Result<SdpSession> {
        let media = Self::streaming_media(offer)?;
        let picked = negotiate_codec(media, &self.codecs)
            .map_err(|e| SessionError::UnsupportedMedia(e.to_string()))?;
        Ok(SdpSession::create_audio_session(
            self.local_ip,
            self.rtp_port,
            &[picked],
        ))
    }

    async fn open_media(
        &self,
        local: &SdpSession,
        remote: &SdpSession,
        bridge: Arc<MediaBridge>,
    ) -> Result<MediaTransport> {
        let local_media = Self::streaming_media(local)?;
        let remote_media = Self::streaming_media(remote)?;
        // The negotiated codec is the first format of our own description
        let (payload_type, encoding) = local_media
            .rtpmap
            .first()
            .cloned()
            .ok_or_else(|| SessionError::Internal("no negotiated codec".to_string()))?;
        let payload_type: u8 = payload_type
            .parse()
            .map_err(|_| SessionError::Internal("bad payload type".to_string()))?;

        let remote_addr = format!("{}:{}", remote.connection.address, remote_media.port)
            .parse()
            .map_err(|_| SessionError::Signaling("bad remote media address".to_string()))?;

        let transport = RtpTransport::start(
            &format!("{}:{}", self.local_ip, self.rtp_port),
            remote_addr,
            payload_type,
            clock_rate(&encoding),
            bridge as Arc<dyn RtpListener>,
        )
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(MediaTransport::Rtp(transport))
    }
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
    fn test_offer_lists_codecs_in_order() {
        let behavior = StreamingBehavior::new("10.0.0.5".parse().unwrap(), 7000, codecs());
        let offer = behavior.build_offer().unwrap();
        let media = offer.media_of_type("audio").unwrap();
        assert_eq!(media.formats, vec!["0".to_string(), "8".to_string()]);
        assert_eq!(media.port, 7000);
    }

    #[test]
    fn test_answer_picks_mutual_codec() {
        let behavior = StreamingBehavior::new("10.0.0.5".parse().unwrap(), 7000, codecs());
        let offer_text = "v=0\r\no=u 1 1 IN IP4 10.0.0.9\r\ns=-\r\nc=IN IP4 10.0.0.9\r\nt=0 0\r\n\
                          m=audio 4000 RTP/AVP 97 8\r\na=rtpmap:97 AMR/8000\r\na=rtpmap:8 PCMA/8000\r\n";
        let offer = SdpSession::parse(offer_text).unwrap();
        let answer = behavior.build_answer(&offer).unwrap();
        let media = answer.media_of_type("audio").unwrap();
        assert_eq!(media.formats, vec!["8".to_string()]);
    }

    #[test]
    fn test_answer_fails_without_mutual_codec() {
        let behavior = StreamingBehavior::new("10.0.0.5".parse().unwrap(), 7000, codecs());
        let offer_text = "v=0\r\no=u 1 1 IN IP4 10.0.0.9\r\ns=-\r\nc=IN IP4 10.0.0.9\r\nt=0 0\r\n\
                          m=audio 4000 RTP/AVP 97\r\na=rtpmap:97 AMR/8000\r\n";
        let offer = SdpSession::parse(offer_text).unwrap();
        assert!(matches!(
            behavior.build_answer(&offer),
            Err(SessionError::UnsupportedMedia(_))
        ));
    }

    #[test]
    fn test_clock_rate_parse() {
        assert_eq!(clock_rate("PCMU/8000"), 8000);
        assert_eq!(clock_rate("opus/48000"), 48000);
        assert_eq!(clock_rate("weird"), 8000);
    }
}
