//! Inbound packet queue.
//!
//! Completed `*.pkt` files land in the inbound directory. [`InboundQueue::process`]
//! claims each one by renaming it into `.processing/`, hands it to the
//! [`PacketStore`], and then deletes it or parks it under
//! `error/<name>.<unix-time>`. Error files are never deleted automatically;
//! an operator retries them or ages them out with [`InboundQueue::cleanup`].

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::binkp::transfer::unique_destination;
use crate::ftn::PacketStore;
use crate::logutil::escape_log;
use crate::validation::{is_packet_name, sanitize_inbound_filename};

const PROCESSING_DIR: &str = ".processing";
const ERROR_DIR: &str = "error";

#[derive(Debug, Clone, Serialize)]
pub struct InboundFailure {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InboundReport {
    pub processed: usize,
    pub messages: usize,
    pub failed: usize,
    pub errors: Vec<InboundFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorFile {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct InboundQueue {
    dir: PathBuf,
}

impl InboundQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn error_dir(&self) -> PathBuf {
        self.dir.join(ERROR_DIR)
    }

    pub fn list(&self) -> Result<Vec<PathBuf>> {
        list_packets(&self.dir)
    }

    /// Ingest every waiting packet. One bad packet never stops the batch.
    pub fn process(&self, store: &dyn PacketStore) -> Result<InboundReport> {
        let processing = self.dir.join(PROCESSING_DIR);
        fs::create_dir_all(&processing)
            .with_context(|| format!("create {}", processing.display()))?;
        self.recover_processing(&processing);

        let mut report = InboundReport::default();
        for path in self.list()? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let claimed = processing.join(&name);
            match fs::rename(&path, &claimed) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{} taken by another processor", name);
                    continue;
                }
                Err(e) => {
                    warn!("Cannot claim inbound {}: {}", name, e);
                    continue;
                }
            }

            let outcome = store.parse(&claimed).and_then(|msgs| store.store(&msgs));
            match outcome {
                Ok(count) => {
                    if let Err(e) = fs::remove_file(&claimed) {
                        warn!("Processed {} but could not delete it: {}", name, e);
                    }
                    info!("Imported {} message(s) from {}", count, name);
                    report.processed += 1;
                    report.messages += count;
                }
                Err(e) => {
                    let error = format!("{:#}", e);
                    warn!("Failed to import {}: {}", name, escape_log(&error));
                    if let Err(move_err) = self.move_to_error(&claimed, &name) {
                        warn!("Could not move {} to error/: {:#}", name, move_err);
                    }
                    report.failed += 1;
                    report.errors.push(InboundFailure { file: name, error });
                }
            }
        }
        Ok(report)
    }

    /// Put files stranded in `.processing/` by an interrupted run back in line.
    fn recover_processing(&self, processing: &Path) {
        let Ok(entries) = fs::read_dir(processing) else { return };
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
            let target = unique_destination(&self.dir, &name);
            match fs::rename(entry.path(), &target) {
                Ok(()) => info!("Requeued interrupted inbound {}", name),
                Err(e) => warn!("Could not requeue {}: {}", name, e),
            }
        }
    }

    fn move_to_error(&self, path: &Path, name: &str) -> Result<PathBuf> {
        let dir = self.error_dir();
        fs::create_dir_all(&dir)?;
        let mut stamp = Utc::now().timestamp();
        let mut target = dir.join(format!("{}.{}", name, stamp));
        while target.exists() {
            stamp += 1;
            target = dir.join(format!("{}.{}", name, stamp));
        }
        fs::rename(path, &target)?;
        Ok(target)
    }

    /// Move `filename` from `error/` back into the queue and process again.
    pub fn retry(&self, filename: &str, store: &dyn PacketStore) -> Result<InboundReport> {
        let name = sanitize_inbound_filename(filename).map_err(|e| anyhow!("{}: {}", filename, e))?;
        let source = self.error_dir().join(&name);
        if !source.is_file() {
            return Err(anyhow!("no error file named {}", name));
        }
        let original = original_name(&name);
        let target = unique_destination(&self.dir, original);
        fs::rename(&source, &target)
            .with_context(|| format!("move {} back to inbound", name))?;
        info!("Retrying {} as {}", name, target.display());
        self.process(store)
    }

    /// Delete error files older than `max_age_hours`. Returns how many went.
    pub fn cleanup(&self, max_age_hours: u64) -> Result<usize> {
        let dir = self.error_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let max_age = Duration::from_secs(max_age_hours.saturating_mul(3600));
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= max_age {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Could not remove {}: {}", entry.path().display(), e),
                }
            }
        }
        if removed > 0 {
            info!("Removed {} inbound error file(s) older than {}h", removed, max_age_hours);
        }
        Ok(removed)
    }

    pub fn list_errors(&self) -> Result<Vec<ErrorFile>> {
        let entries = match fs::read_dir(self.error_dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out: Vec<ErrorFile> = entries
            .flatten()
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                meta.is_file().then(|| ErrorFile {
                    name: e.file_name().to_string_lossy().into_owned(),
                    size: meta.len(),
                    modified: meta.modified().ok().map(DateTime::<Utc>::from),
                })
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

fn list_packets(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("scan {}", dir.display())),
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| e.file_name().to_str().map(is_packet_name).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    out.sort();
    Ok(out)
}

/// `name.pkt.1700000000` → `name.pkt`.
fn original_name(error_name: &str) -> &str {
    match error_name.rsplit_once('.') {
        Some((base, stamp))
            if !base.is_empty() && !stamp.is_empty() && stamp.chars().all(|c| c.is_ascii_digit()) =>
        {
            base
        }
        _ => error_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftn::{FtnAddress, FtnMessage};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Accepts any file except those starting with `BAD`, one message each.
    struct FakeStore {
        reject: AtomicBool,
    }

    impl FakeStore {
        fn new() -> Self {
            Self { reject: AtomicBool::new(true) }
        }
    }

    impl PacketStore for FakeStore {
        fn parse(&self, path: &Path) -> Result<Vec<FtnMessage>> {
            let data = fs::read(path)?;
            if self.reject.load(Ordering::SeqCst) && data.starts_with(b"BAD") {
                return Err(anyhow!("bad packet"));
            }
            let a = FtnAddress::parse("1:1/1").unwrap();
            Ok(vec![FtnMessage::netmail(a.clone(), a, "a", "b", "s", "t")])
        }

        fn write(&self, _m: &[FtnMessage], _d: &FtnAddress, _p: Option<&Path>) -> Result<PathBuf> {
            unreachable!()
        }

        fn store(&self, messages: &[FtnMessage]) -> Result<usize> {
            Ok(messages.len())
        }
    }

    #[test]
    fn good_files_are_deleted_bad_files_parked() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.pkt"), b"OK").unwrap();
        fs::write(dir.path().join("bad.pkt"), b"BAD").unwrap();
        fs::write(dir.path().join("readme.txt"), b"ignored").unwrap();
        let q = InboundQueue::new(dir.path());
        let report = q.process(&FakeStore::new()).unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.messages, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors[0].file, "bad.pkt");
        assert!(!dir.path().join("good.pkt").exists());
        assert!(!dir.path().join("bad.pkt").exists());
        assert!(dir.path().join("readme.txt").exists());

        let errors = q.list_errors().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].name.starts_with("bad.pkt."));
    }

    #[test]
    fn retry_moves_back_and_reprocesses() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.pkt"), b"BAD").unwrap();
        let q = InboundQueue::new(dir.path());
        let store = FakeStore::new();
        q.process(&store).unwrap();
        let name = q.list_errors().unwrap().remove(0).name;

        store.reject.store(false, Ordering::SeqCst);
        let report = q.retry(&name, &store).unwrap();
        assert_eq!(report.processed, 1);
        assert!(q.list_errors().unwrap().is_empty());
        assert!(q.retry("missing.pkt.1", &store).is_err());
    }

    #[test]
    fn cleanup_respects_age() {
        let dir = tempfile::tempdir().unwrap();
        let q = InboundQueue::new(dir.path());
        fs::create_dir_all(q.error_dir()).unwrap();
        fs::write(q.error_dir().join("old.pkt.1"), b"x").unwrap();
        assert_eq!(q.cleanup(24).unwrap(), 0);
        assert_eq!(q.cleanup(0).unwrap(), 1);
        assert!(q.list_errors().unwrap().is_empty());
    }

    #[test]
    fn interrupted_claims_are_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let processing = dir.path().join(PROCESSING_DIR);
        fs::create_dir_all(&processing).unwrap();
        fs::write(processing.join("stuck.pkt"), b"OK").unwrap();
        let report = InboundQueue::new(dir.path()).process(&FakeStore::new()).unwrap();
        assert_eq!(report.processed, 1);
        assert!(!processing.join("stuck.pkt").exists());
    }

    #[test]
    fn error_suffix_is_stripped() {
        assert_eq!(original_name("a.pkt.1700000000"), "a.pkt");
        assert_eq!(original_name("a.pkt"), "a.pkt");
        assert_eq!(original_name("a.pkt.1700000000-1.x"), "a.pkt.1700000000-1.x");
    }
}
