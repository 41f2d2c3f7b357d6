//! Inbound filter chain: one event source feeds a single queue; each event is
//! gated, admin commands are answered, and everything else is handed to the
//! turn scheduler.

use crate::commands;
use crate::controls::BotControls;
use crate::scheduler::{ScheduleOutcome, TurnScheduler};
use anyhow::Result;
use rb_channels::{ChatRelay, InboundEvent};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OwnMessage,
    Disabled,
    EmptyText,
    Blocked,
    GroupChat,
    NotTriggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Ignored(IgnoreReason),
    AdminHandled,
    Scheduled(ScheduleOutcome),
}

pub struct Gateway {
    controls: Arc<BotControls>,
    relay: Arc<dyn ChatRelay>,
    scheduler: Arc<TurnScheduler>,
    group_marker: String,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>,
}

impl Gateway {
    pub fn new(
        controls: Arc<BotControls>,
        relay: Arc<dyn ChatRelay>,
        scheduler: Arc<TurnScheduler>,
        group_marker: impl Into<String>,
        inbound_rx: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        Self {
            controls,
            relay,
            scheduler,
            group_marker: group_marker.into(),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop().await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    /// Drain the inbound queue until every sender is gone. Events are handled
    /// one at a time so scheduler mutations stay in arrival order.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_loop(&self) -> Result<()> {
        let mut rx = self.inbound_rx.lock().await;
        while let Some(event) = rx.recv().await {
            match self.handle_inbound(event).await {
                Ok(InboundOutcome::Ignored(reason)) => {
                    tracing::debug!(?reason, "inbound ignored");
                }
                Ok(InboundOutcome::Scheduled(outcome)) => {
                    tracing::trace!(?outcome, "inbound scheduled");
                }
                Ok(InboundOutcome::AdminHandled) => {}
                Err(e) => tracing::warn!(%e, "handle_inbound failed"),
            }
        }
        tracing::info!("inbound stream ended");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(sender = %event.sender))]
    pub async fn handle_inbound(&self, event: InboundEvent) -> Result<InboundOutcome> {
        if event.is_self {
            return Ok(InboundOutcome::Ignored(IgnoreReason::OwnMessage));
        }

        let trusted = self.controls.is_trusted(&event.sender);
        if !trusted && self.controls.is_disabled().await {
            tracing::debug!("bot disabled; ignoring");
            return Ok(InboundOutcome::Ignored(IgnoreReason::Disabled));
        }

        let text = event.text.trim();
        if text.is_empty() {
            return Ok(InboundOutcome::Ignored(IgnoreReason::EmptyText));
        }

        let conversation = self
            .relay
            .resolve_conversation(&event.message_id, &event.sender)
            .await;

        if trusted {
            if let Some(reply) = commands::handle_admin(&self.controls, text).await {
                self.relay.send_text(&conversation, &reply).await?;
                return Ok(InboundOutcome::AdminHandled);
            }
        }

        if self.controls.is_blocked(&event.sender).await {
            tracing::info!("sender blacklisted; ignoring");
            return Ok(InboundOutcome::Ignored(IgnoreReason::Blocked));
        }

        if conversation.is_group(&self.group_marker) {
            tracing::info!(conversation_id = %conversation, "group chat; ignoring");
            return Ok(InboundOutcome::Ignored(IgnoreReason::GroupChat));
        }

        let text = if trusted {
            match commands::strip_trigger(text) {
                Some(rest) if !rest.is_empty() => rest,
                _ => return Ok(InboundOutcome::Ignored(IgnoreReason::NotTriggered)),
            }
        } else {
            text
        };

        let outcome = self
            .scheduler
            .on_message(event.sender, text.to_string(), conversation);
        match outcome {
            ScheduleOutcome::Started { delay } => tracing::info!(
                delay_ms = delay.as_millis() as u64,
                "turn started; accumulating messages"
            ),
            ScheduleOutcome::Extended { fragments, delay } => tracing::info!(
                fragments,
                delay_ms = delay.as_millis() as u64,
                "turn extended; timer reset"
            ),
            ScheduleOutcome::Rejected => {}
        }
        Ok(InboundOutcome::Scheduled(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{CompletedTurn, DebounceWindow, TurnHandler};
    use crate::store::{Blacklist, DisabledMarker};
    use async_trait::async_trait;
    use chrono::Utc;
    use rb_channels::{ConversationId, MessageId, SenderId};
    use std::sync::Mutex;
    use std::time::Duration;

    const OWNER: &str = "+15550000";

    #[derive(Default)]
    struct FakeRelay {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatRelay for FakeRelay {
        async fn resolve_conversation(
            &self,
            message_id: &MessageId,
            sender: &SenderId,
        ) -> ConversationId {
            // Message ids starting with "grp" resolve to a group chat.
            if message_id.as_str().starts_with("grp") {
                ConversationId::new(format!("iMessage;+;chat-{message_id}"))
            } else {
                ConversationId::new(format!("iMessage;-;{sender}"))
            }
        }

        async fn send_text(&self, conversation: &ConversationId, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((conversation.to_string(), text.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        turns: Mutex<Vec<CompletedTurn>>,
    }

    #[async_trait]
    impl TurnHandler for RecordingHandler {
        async fn handle_turn(&self, turn: CompletedTurn) {
            self.turns.lock().unwrap().push(turn);
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        gateway: Gateway,
        relay: Arc<FakeRelay>,
        handler: Arc<RecordingHandler>,
        scheduler: Arc<TurnScheduler>,
        controls: Arc<BotControls>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let controls = Arc::new(BotControls::new(
            [SenderId::from(OWNER)],
            DisabledMarker::new(dir.path().join("bot_disabled")),
            Blacklist::load(dir.path().join("blacklist.txt")),
        ));
        let relay = Arc::new(FakeRelay::default());
        let handler = Arc::new(RecordingHandler::default());
        let scheduler = Arc::new(TurnScheduler::new(
            handler.clone(),
            DebounceWindow::fixed(Duration::from_secs(10)),
        ));
        let (_tx, rx) = mpsc::channel(1);
        let gateway = Gateway::new(
            controls.clone(),
            relay.clone(),
            scheduler.clone(),
            ";+;",
            rx,
        );
        Harness {
            _dir: dir,
            gateway,
            relay,
            handler,
            scheduler,
            controls,
        }
    }

    fn event(sender: &str, text: &str) -> InboundEvent {
        InboundEvent {
            sender: SenderId::from(sender),
            text: text.to_string(),
            message_id: MessageId::from("msg-1"),
            is_self: false,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ordinary_message_is_scheduled_on_resolved_conversation() {
        let h = harness();
        let outcome = h.gateway.handle_inbound(event("A", "  hi  ")).await.unwrap();
        assert!(matches!(
            outcome,
            InboundOutcome::Scheduled(ScheduleOutcome::Started { .. })
        ));
        assert_eq!(
            h.scheduler.pending_fragments(&SenderId::from("A")).unwrap(),
            vec!["hi".to_string()]
        );
        assert!(h.relay.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn own_and_empty_messages_are_ignored() {
        let h = harness();
        let mut own = event("A", "hi");
        own.is_self = true;
        assert_eq!(
            h.gateway.handle_inbound(own).await.unwrap(),
            InboundOutcome::Ignored(IgnoreReason::OwnMessage)
        );
        assert_eq!(
            h.gateway.handle_inbound(event("A", " \n ")).await.unwrap(),
            InboundOutcome::Ignored(IgnoreReason::EmptyText)
        );
        assert_eq!(h.scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn disabled_bot_ignores_strangers_but_obeys_owner() {
        let h = harness();
        let off = h.gateway.handle_inbound(event(OWNER, "/bot off")).await.unwrap();
        assert_eq!(off, InboundOutcome::AdminHandled);
        assert!(h.controls.is_disabled().await);

        assert_eq!(
            h.gateway.handle_inbound(event("A", "hello?")).await.unwrap(),
            InboundOutcome::Ignored(IgnoreReason::Disabled)
        );
        assert_eq!(h.scheduler.pending_count(), 0);

        let status = h.gateway.handle_inbound(event(OWNER, "/BOT")).await.unwrap();
        assert_eq!(status, InboundOutcome::AdminHandled);
        h.gateway.handle_inbound(event(OWNER, "/bot on")).await.unwrap();
        assert!(!h.controls.is_disabled().await);

        let replies: Vec<String> = h
            .relay
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(conversation, text)| {
                assert_eq!(conversation, &format!("iMessage;-;{OWNER}"));
                text.clone()
            })
            .collect();
        assert_eq!(replies, ["Bot Disabled", "Status: Disabled", "Bot Enabled"]);

        assert!(matches!(
            h.gateway.handle_inbound(event("A", "hello?")).await.unwrap(),
            InboundOutcome::Scheduled(_)
        ));
    }

    #[tokio::test]
    async fn blocked_sender_is_ignored_until_unblocked() {
        let h = harness();
        h.gateway.handle_inbound(event(OWNER, "/block A")).await.unwrap();
        assert_eq!(
            h.gateway.handle_inbound(event("A", "hi")).await.unwrap(),
            InboundOutcome::Ignored(IgnoreReason::Blocked)
        );
        h.gateway.handle_inbound(event(OWNER, "/block A")).await.unwrap();
        assert!(matches!(
            h.gateway.handle_inbound(event("A", "hi")).await.unwrap(),
            InboundOutcome::Scheduled(_)
        ));
        let replies: Vec<String> = h
            .relay
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect();
        assert_eq!(replies, ["Blocked A", "Unblocked A"]);
    }

    #[tokio::test]
    async fn group_conversations_are_ignored() {
        let h = harness();
        let mut group = event("A", "hi all");
        group.message_id = MessageId::from("grp-7");
        assert_eq!(
            h.gateway.handle_inbound(group).await.unwrap(),
            InboundOutcome::Ignored(IgnoreReason::GroupChat)
        );
        assert_eq!(h.scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn owner_needs_star_trigger_for_a_reply() {
        let h = harness();
        assert_eq!(
            h.gateway.handle_inbound(event(OWNER, "just chatting")).await.unwrap(),
            InboundOutcome::Ignored(IgnoreReason::NotTriggered)
        );
        assert_eq!(
            h.gateway.handle_inbound(event(OWNER, "*")).await.unwrap(),
            InboundOutcome::Ignored(IgnoreReason::NotTriggered)
        );
        assert!(matches!(
            h.gateway.handle_inbound(event(OWNER, "* what's up")).await.unwrap(),
            InboundOutcome::Scheduled(ScheduleOutcome::Started { .. })
        ));
        assert_eq!(
            h.scheduler.pending_fragments(&SenderId::from(OWNER)).unwrap(),
            vec!["what's up".to_string()]
        );
    }

    #[tokio::test]
    async fn run_loop_feeds_scheduler_in_arrival_order_until_stream_ends() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        let gateway = Arc::new(Gateway::new(
            h.controls.clone(),
            h.relay.clone(),
            h.scheduler.clone(),
            ";+;",
            rx,
        ));
        let task = gateway.start();

        for text in ["hi", "there", "again"] {
            tx.send(event("A", text)).await.unwrap();
        }
        tx.send(event("B", "other")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(
            h.scheduler.pending_fragments(&SenderId::from("A")).unwrap(),
            ["hi", "there", "again"]
        );
        assert_eq!(h.scheduler.pending_count(), 2);
        assert!(h.handler.turns.lock().unwrap().is_empty());
    }
}
