//! Per-sender turn coalescing.
//!
//! Messages from one sender that arrive within a randomized quiet window of
//! each other are collected into a single turn; every new message restarts
//! the window. When a window elapses undisturbed the turn leaves the pending
//! table and is handed to the [`TurnHandler`] exactly once.
//!
//! Each scheduled timer carries a generation number and the pending entry
//! records the generation of its live timer. A timer finalizes only if the
//! entry still carries its generation; the check and the removal are a single
//! `DashMap::remove_if`. Aborting a superseded timer is advisory: a stale
//! timer that runs anyway finds a newer generation (or no entry) and exits.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use rb_channels::{ConversationId, SenderId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Receives completed turns.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn handle_turn(&self, turn: CompletedTurn);
}

/// Inclusive range the quiet window is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceWindow {
    min: Duration,
    max: Duration,
}

impl DebounceWindow {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
    }

    #[cfg(test)]
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }
}

/// A turn whose quiet window elapsed. `messages` is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTurn {
    pub sender: SenderId,
    pub messages: Vec<String>,
    pub conversation_id: ConversationId,
    pub started_at: DateTime<Local>,
}

impl CompletedTurn {
    /// Fragments in arrival order, one per line.
    pub fn text(&self) -> String {
        self.messages.join("\n")
    }
}

struct PendingTurn {
    sender: SenderId,
    messages: Vec<String>,
    conversation_id: ConversationId,
    started_at: DateTime<Local>,
    generation: u64,
    timer: AbortHandle,
}

impl PendingTurn {
    fn into_completed(self) -> CompletedTurn {
        CompletedTurn {
            sender: self.sender,
            messages: self.messages,
            conversation_id: self.conversation_id,
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// First fragment of a new turn.
    Started { delay: Duration },
    /// Appended to a pending turn; its window restarted.
    Extended { fragments: usize, delay: Duration },
    /// The scheduler is shut down.
    Rejected,
}

pub struct TurnScheduler {
    pending: Arc<DashMap<SenderId, PendingTurn>>,
    handler: Arc<dyn TurnHandler>,
    window: DebounceWindow,
    generations: AtomicU64,
    shutdown: CancellationToken,
}

impl TurnScheduler {
    pub fn new(handler: Arc<dyn TurnHandler>, window: DebounceWindow) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            handler,
            window,
            generations: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn window(&self) -> DebounceWindow {
        self.window
    }

    /// Add one qualifying message. Calls must be serialized by the caller
    /// (the gateway processes inbound events one at a time).
    pub fn on_message(
        &self,
        sender: SenderId,
        text: String,
        conversation_id: ConversationId,
    ) -> ScheduleOutcome {
        if self.shutdown.is_cancelled() {
            tracing::debug!(sender = %sender, "scheduler shut down; message dropped");
            return ScheduleOutcome::Rejected;
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = self.window.sample();

        match self.pending.entry(sender.clone()) {
            Entry::Occupied(mut occupied) => {
                let turn = occupied.get_mut();
                // The entry lock is held, so the old timer cannot finalize
                // between this abort and the generation bump below.
                turn.timer.abort();
                turn.messages.push(text);
                turn.conversation_id = conversation_id;
                turn.generation = generation;
                turn.timer = self.spawn_timer(sender, generation, delay);
                ScheduleOutcome::Extended {
                    fragments: turn.messages.len(),
                    delay,
                }
            }
            Entry::Vacant(vacant) => {
                let timer = self.spawn_timer(sender.clone(), generation, delay);
                vacant.insert(PendingTurn {
                    sender,
                    messages: vec![text],
                    conversation_id,
                    started_at: Local::now(),
                    generation,
                    timer,
                });
                ScheduleOutcome::Started { delay }
            }
        }
    }

    fn spawn_timer(&self, sender: SenderId, generation: u64, delay: Duration) -> AbortHandle {
        let pending = Arc::clone(&self.pending);
        let handler = Arc::clone(&self.handler);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some((_, turn)) =
                pending.remove_if(&sender, |_, turn| turn.generation == generation)
            else {
                tracing::debug!(sender = %sender, generation, "stale timer; turn superseded");
                return;
            };

            let turn = turn.into_completed();
            tracing::info!(
                sender = %turn.sender,
                fragments = turn.messages.len(),
                "quiet window elapsed; processing turn"
            );
            handler.handle_turn(turn).await;
        })
        .abort_handle()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_pending(&self, sender: &SenderId) -> bool {
        self.pending.contains_key(sender)
    }

    #[cfg(test)]
    pub fn pending_fragments(&self, sender: &SenderId) -> Option<Vec<String>> {
        self.pending.get(sender).map(|turn| turn.messages.clone())
    }

    /// Stop accepting messages and discard every pending turn. Turns already
    /// handed to the handler run to completion. Returns the number discarded.
    pub fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let mut discarded = 0usize;
        self.pending.retain(|sender, turn| {
            turn.timer.abort();
            tracing::debug!(sender = %sender, fragments = turn.messages.len(), "pending turn discarded");
            discarded += 1;
            false
        });
        if discarded > 0 {
            tracing::warn!(discarded, "scheduler shut down with pending turns");
        }
        discarded
    }
}

impl Drop for TurnScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
