//! Process-wide toggles shared by the gateway and the admin commands.

use crate::store::{Blacklist, BlacklistChange, DisabledMarker};
use anyhow::{Context, Result};
use rb_channels::SenderId;
use std::collections::HashSet;
use tokio::sync::Mutex;

pub struct BotControls {
    trusted: HashSet<SenderId>,
    disabled: DisabledMarker,
    blacklist: Mutex<Blacklist>,
}

impl BotControls {
    pub fn new(
        trusted: impl IntoIterator<Item = SenderId>,
        disabled: DisabledMarker,
        blacklist: Blacklist,
    ) -> Self {
        Self {
            trusted: trusted.into_iter().collect(),
            disabled,
            blacklist: Mutex::new(blacklist),
        }
    }

    pub fn is_trusted(&self, sender: &SenderId) -> bool {
        self.trusted.contains(sender)
    }

    pub fn trusted(&self) -> Vec<String> {
        let mut out: Vec<String> = self.trusted.iter().map(|s| s.to_string()).collect();
        out.sort();
        out
    }

    /// Checks the marker file on every call so an external `touch` takes effect.
    pub async fn is_disabled(&self) -> bool {
        let marker = self.disabled.clone();
        match tokio::task::spawn_blocking(move || marker.is_disabled()).await {
            Ok(disabled) => disabled,
            Err(e) => {
                tracing::warn!(%e, "disabled marker check failed; assuming enabled");
                false
            }
        }
    }

    pub async fn set_disabled(&self, disabled: bool) -> Result<()> {
        let marker = self.disabled.clone();
        tokio::task::spawn_blocking(move || marker.set_disabled(disabled))
            .await
            .context("disabled marker task")?
    }

    pub async fn is_blocked(&self, sender: &SenderId) -> bool {
        self.blacklist.lock().await.contains(sender.as_str())
    }

    pub async fn blocked(&self) -> Vec<String> {
        self.blacklist.lock().await.entries()
    }

    /// Toggle `target` and rewrite the blacklist file. The in-memory change
    /// stands even if the write fails; the error is returned for reporting.
    pub async fn toggle_block(&self, target: &str) -> (BlacklistChange, Result<()>) {
        let (change, snapshot) = {
            let mut list = self.blacklist.lock().await;
            let change = list.toggle(target);
            (change, list.clone())
        };
        let saved = tokio::task::spawn_blocking(move || snapshot.save())
            .await
            .context("blacklist save task")
            .and_then(|r| r);
        (change, saved)
    }
}
