//! On-disk state: per-sender transcripts, the blacklist file and the
//! disabled marker. All functions here block; async callers offload them.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::collections::{BTreeSet, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(at: &DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// One finished exchange.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub turn_text: String,
    pub turn_at: DateTime<Local>,
    pub reply_text: String,
    pub reply_at: DateTime<Local>,
}

impl HistoryRecord {
    /// Exactly two lines; line breaks inside either text become spaces.
    pub fn render(&self) -> String {
        format!(
            "[Sender - {}]: {}\n[Bot - {}]: {}\n",
            format_timestamp(&self.turn_at),
            single_line(&self.turn_text),
            format_timestamp(&self.reply_at),
            single_line(&self.reply_text)
        )
    }
}

fn single_line(text: &str) -> String {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, sender: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", history_file_stem(sender)))
    }

    /// Last `lines` lines of the sender's transcript. A missing file is empty.
    pub fn tail(&self, sender: &str, lines: usize) -> Result<Vec<String>> {
        let path = self.path_for(sender);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("open history {}", path.display())),
        };

        let mut window = VecDeque::with_capacity(lines);
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("read history {}", path.display()))?;
            if window.len() == lines {
                window.pop_front();
            }
            if lines > 0 {
                window.push_back(line);
            }
        }
        Ok(window.into())
    }

    pub fn append(&self, sender: &str, record: &HistoryRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create history dir {}", self.dir.display()))?;
        let path = self.path_for(sender);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open history {}", path.display()))?;
        file.write_all(record.render().as_bytes())
            .with_context(|| format!("append history {}", path.display()))?;
        Ok(())
    }
}

/// File stem for a sender's transcript; anything outside `[A-Za-z0-9@+._-]`
/// becomes `_` so a sender id can never escape the history directory.
pub fn history_file_stem(sender: &str) -> String {
    let stem: String = sender
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '+' | '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match stem.trim_matches('.') {
        "" => "_".to_string(),
        _ => stem,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistChange {
    Added,
    Removed,
}

/// Sender ids that never get replies. Persisted as sorted, newline separated text.
#[derive(Debug, Clone)]
pub struct Blacklist {
    path: PathBuf,
    entries: BTreeSet<String>,
}

impl Blacklist {
    /// Load from `path`. Missing or unreadable files give an empty set.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => parse_blacklist(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                tracing::warn!(%e, path = %path.display(), "blacklist load failed; starting empty");
                BTreeSet::new()
            }
        };
        Self { path, entries }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains(id)
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Add `id` if absent, remove it if present.
    pub fn toggle(&mut self, id: &str) -> BlacklistChange {
        if self.entries.remove(id) {
            BlacklistChange::Removed
        } else {
            self.entries.insert(id.to_string());
            BlacklistChange::Added
        }
    }

    /// Sorted entries, one per line, always newline-terminated.
    pub fn render(&self) -> String {
        let mut out = self
            .entries
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        out.push('\n');
        out
    }

    /// Overwrite the file with the current set.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create blacklist dir {}", parent.display()))?;
        }
        std::fs::write(&self.path, self.render())
            .with_context(|| format!("write blacklist {}", self.path.display()))?;
        tracing::debug!(entries = self.len(), path = %self.path.display(), "blacklist saved");
        Ok(())
    }
}

fn parse_blacklist(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Process-wide off switch: the bot is disabled while the marker file exists.
#[derive(Debug, Clone)]
pub struct DisabledMarker {
    path: PathBuf,
}

impl DisabledMarker {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.path.exists()
    }

    pub fn set_disabled(&self, disabled: bool) -> Result<()> {
        if disabled {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("create marker {}", self.path.display()))?;
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove marker {}", self.path.display())),
        }
    }
}
