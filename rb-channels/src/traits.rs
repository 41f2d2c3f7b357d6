use crate::types::{ConversationId, InboundEvent, MessageId, SenderId};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Short identifier used in logs.
    fn source_id(&self) -> &str;

    /// Start producing events into `tx`. The sequence ends when the source
    /// does; it is never restarted. An error here means the source could not
    /// be started at all.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;
}

#[async_trait]
pub trait ChatRelay: Send + Sync {
    /// Map a message to the conversation it belongs to. Never fails: lookup
    /// problems degrade to a synthetic identifier built from `sender`.
    async fn resolve_conversation(
        &self,
        message_id: &MessageId,
        sender: &SenderId,
    ) -> ConversationId;

    /// Deliver `text` to `conversation`.
    async fn send_text(&self, conversation: &ConversationId, text: &str) -> Result<()>;
}
