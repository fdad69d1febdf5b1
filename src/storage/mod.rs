//! # Storage Module - Message Persistence
//!
//! Messages unpacked from inbound packets, and netmail written locally for
//! crash delivery, are kept as one JSON document per message:
//!
//! ```text
//! data/
//! ├── netmail/
//! │   ├── 6f1c2b0e9a3d4c55.json
//! │   └── ...
//! └── crashmail_queue.json   ← see crate::crashmail
//! ```
//!
//! Every write goes through [`write_file_locked`]: an exclusive `fs2` lock on
//! the destination, a unique temp file in the same directory, then an atomic
//! rename. Readers never observe a half-written document.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ftnbbs::storage::MessageStore;
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = MessageStore::new("./data")?;
//!     for m in store.list()? {
//!         println!("{} {} -> {} {}", m.id, m.message.orig, m.message.dest, m.message.subject);
//!     }
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::ftn::FtnMessage;

/// Refuse to parse anything larger than this as a stored message.
const MAX_MESSAGE_FILE: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub direction: Direction,
    pub message: FtnMessage,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub crash: bool,
    #[serde(default)]
    pub sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// Write `content` to `path` under an exclusive lock, via temp file and rename.
pub fn write_file_locked(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    lock_file.lock_exclusive()?;

    let base = path.file_name().and_then(|s| s.to_str()).unwrap_or("data.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(anyhow!("Failed to create temp file for atomic write: {}", e)),
        }
    };

    fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    drop(lock_file);
    Ok(())
}

/// Read a JSON document written by [`write_file_locked`], under a shared lock.
pub fn read_file_locked(path: &Path, max_len: u64) -> Result<Option<String>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    let len = file.metadata()?.len();
    if len > max_len {
        return Err(anyhow!("{} is too large ({} bytes)", path.display(), len));
    }
    file.lock_shared()?;
    let content = fs::read_to_string(path);
    file.unlock()?;
    Ok(Some(content?))
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[derive(Debug, Clone)]
pub struct MessageStore {
    dir: PathBuf,
}

impl MessageStore {
    /// Open (creating if needed) the message directory under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join("netmail");
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if !valid_id(id) {
            return Err(anyhow!("invalid message id '{}'", id));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    pub fn get(&self, id: &str) -> Result<Option<StoredMessage>> {
        let path = self.path_for(id)?;
        match read_file_locked(&path, MAX_MESSAGE_FILE)? {
            Some(content) => {
                let msg = serde_json::from_str(&content)
                    .with_context(|| format!("parse {}", path.display()))?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    pub fn save(&self, msg: &StoredMessage) -> Result<()> {
        let path = self.path_for(&msg.id)?;
        let content = serde_json::to_string_pretty(msg)?;
        write_file_locked(&path, &content)
    }

    fn insert(&self, message: FtnMessage, direction: Direction, crash: bool) -> Result<StoredMessage> {
        let stored = StoredMessage {
            id: Uuid::new_v4().simple().to_string(),
            direction,
            message,
            created_at: Utc::now(),
            crash,
            sent: false,
            sent_at: None,
        };
        self.save(&stored)?;
        Ok(stored)
    }

    /// Store messages unpacked from an inbound packet; returns their ids.
    pub fn import(&self, messages: &[FtnMessage]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for m in messages {
            ids.push(self.insert(m.clone(), Direction::Inbound, false)?.id);
        }
        Ok(ids)
    }

    /// Store a locally written netmail awaiting delivery.
    pub fn create_outbound(&self, message: FtnMessage, crash: bool) -> Result<StoredMessage> {
        self.insert(message, Direction::Outbound, crash)
    }

    /// Flag a message as delivered. Returns false if it does not exist.
    pub fn mark_sent(&self, id: &str) -> Result<bool> {
        let Some(mut msg) = self.get(id)? else {
            return Ok(false);
        };
        if !msg.sent {
            msg.sent = true;
            msg.sent_at = Some(Utc::now());
            self.save(&msg)?;
        }
        Ok(true)
    }

    /// All stored messages, oldest first. Unreadable documents are skipped.
    pub fn list(&self) -> Result<Vec<StoredMessage>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if !valid_id(id) {
                continue;
            }
            match self.get(id) {
                Ok(Some(m)) => out.push(m),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable message {}: {:#}", id, e),
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}
