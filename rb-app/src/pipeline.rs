//! Reply pipeline: history → prompt → model chain → relay send → history.

use crate::scheduler::{CompletedTurn, TurnHandler};
use crate::store::{HistoryRecord, HistoryStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use rb_channels::ChatRelay;
use rb_llm::LlmClient;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Replied { model: String, sent: bool },
    /// Every model failed; nothing was sent or recorded.
    NoReply,
}

pub struct ReplyPipeline {
    llm: LlmClient,
    relay: Arc<dyn ChatRelay>,
    history: HistoryStore,
    history_lines: usize,
}

impl ReplyPipeline {
    pub fn new(
        llm: LlmClient,
        relay: Arc<dyn ChatRelay>,
        history: HistoryStore,
        history_lines: usize,
    ) -> Self {
        Self {
            llm,
            relay,
            history,
            history_lines,
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(sender = %turn.sender, conversation_id = %turn.conversation_id)
    )]
    pub async fn run(&self, turn: &CompletedTurn) -> PipelineOutcome {
        let started = Instant::now();
        let turn_text = turn.text();

        let history = match self.load_history(turn).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(%e, "history read failed; continuing without context");
                Vec::new()
            }
        };
        let prompt = build_prompt(&history, &turn_text);
        tracing::debug!(
            history_lines = history.len(),
            fragments = turn.messages.len(),
            prompt_chars = prompt.len(),
            "prompt assembled"
        );

        let completion = match self.llm.generate_reply(&prompt).await {
            Ok(completion) => completion,
            Err(e) => {
                tracing::error!(%e, "no reply generated; dropping turn");
                return PipelineOutcome::NoReply;
            }
        };

        let sent = match self
            .relay
            .send_text(&turn.conversation_id, &completion.text)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%e, "relay send failed");
                false
            }
        };

        let record = HistoryRecord {
            turn_text,
            turn_at: turn.started_at,
            reply_text: completion.text,
            reply_at: Local::now(),
        };
        if let Err(e) = self.append_history(turn, record).await {
            tracing::warn!(%e, "history write failed");
        }

        tracing::info!(
            model = %completion.model,
            attempts = completion.attempts,
            sent,
            latency_ms = started.elapsed().as_millis() as u64,
            "turn processed"
        );
        PipelineOutcome::Replied {
            model: completion.model,
            sent,
        }
    }

    async fn load_history(&self, turn: &CompletedTurn) -> Result<Vec<String>> {
        let store = self.history.clone();
        let sender = turn.sender.to_string();
        let lines = self.history_lines;
        tokio::task::spawn_blocking(move || store.tail(&sender, lines))
            .await
            .context("history read task")?
    }

    async fn append_history(&self, turn: &CompletedTurn, record: HistoryRecord) -> Result<()> {
        let store = self.history.clone();
        let sender = turn.sender.to_string();
        tokio::task::spawn_blocking(move || store.append(&sender, &record))
            .await
            .context("history write task")?
    }
}

#[async_trait]
impl TurnHandler for ReplyPipeline {
    async fn handle_turn(&self, turn: CompletedTurn) {
        match self.run(&turn).await {
            PipelineOutcome::Replied { model, sent } => {
                tracing::debug!(sender = %turn.sender, model = %model, sent, "turn finished");
            }
            PipelineOutcome::NoReply => {
                tracing::debug!(sender = %turn.sender, "turn finished without reply");
            }
        }
    }
}

/// Prompt = optional history block followed by the new turn.
pub fn build_prompt(history: &[String], turn_text: &str) -> String {
    let mut prompt = String::new();
    if !history.is_empty() {
        prompt.push_str("\n--- HISTORY ---\n");
        for line in history {
            prompt.push_str(line);
            prompt.push('\n');
        }
        prompt.push_str("\n--- END HISTORY ---\n");
    }
    prompt.push_str("\nNEW INCOMING MESSAGE: ");
    prompt.push_str(turn_text);
    prompt
}
