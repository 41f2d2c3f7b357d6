use crate::traits::EventSource;
use crate::types::{InboundEvent, MessageId, SenderId};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;

/// Event source backed by a long-running watcher process that prints one
/// JSON object per line (`imsg watch --json` by default).
#[derive(Clone)]
pub struct WatchSource {
    command: Vec<String>,
}

impl WatchSource {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command: command
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn default_command() -> Vec<String> {
        ["script", "-q", "/dev/null", "imsg", "watch", "--json"]
            .into_iter()
            .map(ToOwned::to_owned)
            .collect()
    }

    fn spawn(&self) -> Result<(Child, ChildStdout)> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("watch command is empty"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn watcher {program:?}"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("watcher stdout was not captured"))?;
        Ok((child, stdout))
    }
}

#[async_trait::async_trait]
impl EventSource for WatchSource {
    fn source_id(&self) -> &str {
        "watch"
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let (child, stdout) = self.spawn()?;
        tracing::info!(command = ?self.command, "watcher started");
        tokio::spawn(async move {
            if let Err(e) = read_loop(child, stdout, tx).await {
                tracing::error!(%e, "watcher read loop exited");
            }
        });
        Ok(())
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn read_loop(
    mut child: Child,
    stdout: ChildStdout,
    tx: mpsc::Sender<InboundEvent>,
) -> Result<()> {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut skipped = 0usize;

    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .await
            .context("read watcher output")?;
        if read == 0 {
            break;
        }

        let Ok(line) = std::str::from_utf8(&buf) else {
            skipped += 1;
            continue;
        };
        let Some(event) = parse_watch_line(line) else {
            skipped += 1;
            continue;
        };

        // Receiver gone means the gateway stopped; nothing left to feed.
        if tx.send(event).await.is_err() {
            return Ok(());
        }
    }

    let status = child.wait().await.context("wait on watcher")?;
    tracing::warn!(%status, skipped, "watcher output ended");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    #[serde(default)]
    is_from_me: bool,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    guid: Option<String>,
}

/// Parse one watcher line. Blank lines, invalid JSON and events without a
/// sender yield `None`.
pub fn parse_watch_line(line: &str) -> Option<InboundEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw: RawWatchEvent = serde_json::from_str(line).ok()?;
    let sender = raw.sender.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())?;
    Some(InboundEvent {
        sender: SenderId::new(sender),
        text: raw.text.unwrap_or_default().trim().to_string(),
        message_id: MessageId::new(raw.guid.unwrap_or_default()),
        is_self: raw.is_from_me,
        received_at: Utc::now(),
    })
}
