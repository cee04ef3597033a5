//! MSRP file-transfer sessions

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::chat::open_msrp_transport;
use super::{MediaBridge, MediaTransport, SessionBehavior};
use crate::domain::shared::{Result, SessionError};
use crate::infrastructure::protocols::sip::dispatcher::ServiceKind;
use crate::infrastructure::protocols::sip::{SdpSession, SetupRole};

/// The file being pushed or pulled over the session
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

pub struct FileTransferBehavior {
    local_ip: IpAddr,
    msrp_port: u16,
    local_path: String,
    transfer_id: String,
    /// Set on the offering side; the answering side validates the offer
    file: Option<FileDescriptor>,
    max_size: u64,
}

impl FileTransferBehavior {
    /// Originating side, pushing `file`
    pub fn sending(local_ip: IpAddr, msrp_port: u16, file: FileDescriptor, max_size: u64) -> Self {
        Self {
            local_ip,
            msrp_port,
            local_path: Self::generate_path(local_ip, msrp_port),
            transfer_id: Uuid::new_v4().simple().to_string(),
            file: Some(file),
            max_size,
        }
    }

    /// Terminating side, receiving whatever the offer describes
    pub fn receiving(local_ip: IpAddr, msrp_port: u16, max_size: u64) -> Self {
        Self {
            local_ip,
            msrp_port,
            local_path: Self::generate_path(local_ip, msrp_port),
            transfer_id: String::new(),
            file: None,
            max_size,
        }
    }

    fn generate_path(local_ip: IpAddr, msrp_port: u16) -> String {
        format!(
            "msrp://{}:{}/{};tcp",
            local_ip,
            msrp_port,
            Uuid::new_v4().simple()
        )
    }
}

/// Size from a file-selector value like `name:"a.jpg" type:image/jpeg size:123`
fn selector_size(selector: &str) -> Option<u64> {
    selector
        .split_whitespace()
        .find_map(|part| part.strip_prefix("size:"))
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl SessionBehavior for FileTransferBehavior {
    fn kind(&self) -> ServiceKind {
        ServiceKind::FileTransfer
    }

    fn build_offer(&self) -> Result<SdpSession> {
        let file = self.file.as_ref().ok_or_else(|| {
            SessionError::Internal("file transfer offer without a file".to_string())
        })?;
        if file.size > self.max_size {
            return Err(SessionError::UnsupportedMedia(format!(
                "file of {} bytes exceeds the {} byte limit",
                file.size, self.max_size
            )));
        }
        Ok(SdpSession::create_file_session(
            self.local_ip,
            self.msrp_port,
            &self.local_path,
            SetupRole::Active,
            &file.name,
            &file.mime_type,
            file.size,
            &self.transfer_id,
            self.max_size,
        ))
    }

    fn build_answer(&self, offer: &SdpSession) -> Result<SdpSession> {
        let media = offer
            .msrp_media()
            .ok_or_else(|| SessionError::UnsupportedMedia("no MSRP media in offer".to_string()))?;
        let selector = media.file_selector().ok_or_else(|| {
            SessionError::UnsupportedMedia("file offer without file-selector".to_string())
        })?;
        if let Some(size) = selector_size(selector) {
            if size > self.max_size {
                return Err(SessionError::UnsupportedMedia(format!(
                    "offered file of {} bytes exceeds the {} byte limit",
                    size, self.max_size
                )));
            }
        }

        let role = media.setup().unwrap_or(SetupRole::ActPass).answer();
        let mut answer = SdpSession::create_message_session(
            self.local_ip,
            self.msrp_port,
            &self.local_path,
            role,
            &media.accept_types(),
        );
        // The answer echoes the offered selector attributes
        let answer_media = &mut answer.media[0];
        answer_media.set_attribute("file-selector", selector);
        if let Some(id) = media.file_transfer_id() {
            answer_media.set_attribute("file-transfer-id", id);
        }
        answer_media.set_attribute("max-size", &self.max_size.to_string());
        Ok(answer)
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
