use crate::{OmemoElement, Result};
use async_trait::async_trait;

/// An encrypted stanza produced by the manager itself, e.g. an empty
/// message completing a key exchange or a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub id: String,
    pub to: String,
    pub element: OmemoElement,
    /// Asks the server to store the message even though it has no body.
    pub store_hint: bool,
}

impl OutgoingMessage {
    pub fn new(to: impl Into<String>, element: OmemoElement) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            to: to.into(),
            element,
            store_hint: true,
        }
    }
}

#[async_trait]
pub trait StanzaSender: Send + Sync {
    async fn send(&self, message: OutgoingMessage) -> Result<()>;
}
