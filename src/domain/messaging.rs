//! Message persistence keyed by session

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Message delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
    Displayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    Outgoing,
    Incoming,
}

/// One chat message as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    /// Call-ID of the owning session
    pub session_id: String,
    pub direction: MessageDirection,
    pub remote_party: String,
    pub mime_type: String,
    pub content: Vec<u8>,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(
        session_id: String,
        direction: MessageDirection,
        remote_party: String,
        mime_type: String,
        content: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            direction,
            remote_party,
            mime_type,
            content,
            status: MessageStatus::Pending,
            timestamp: Utc::now(),
        }
    }

    pub fn content_as_string(&self) -> Option<String> {
        String::from_utf8(self.content.clone()).ok()
    }
}

/// Persistence sink for session messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: StoredMessage);

    async fn update_status(&self, id: Uuid, status: MessageStatus);

    /// Drop every message of a terminated session
    async fn delete_session(&self, session_id: &str);

    async fn messages_for_session(&self, session_id: &str) -> Vec<StoredMessage>;
}

/// Default store backed by a map keyed by session id
pub struct InMemoryMessageStore {
    messages: Mutex<HashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, message: StoredMessage) {
        let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        messages
            .entry(message.session_id.clone())
            .or_default()
            .push(message);
    }

    async fn update_status(&self, id: Uuid, status: MessageStatus) {
        let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        for session in messages.values_mut() {
            if let Some(message) = session.iter_mut().find(|m| m.id == id) {
                message.status = status;
                return;
            }
        }
    }

    async fn delete_session(&self, session_id: &str) {
        let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        messages.remove(session_id);
    }

    async fn messages_for_session(&self, session_id: &str) -> Vec<StoredMessage> {
        let messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        messages.get(session_id).cloned().unwrap_or_default()
    }
}
