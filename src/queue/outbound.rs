//! Outbound packet queue.
//!
//! Packets waiting for an uplink live as `*.pkt` files in the outbound
//! directory. A session never sends straight out of that directory: it first
//! claims the files routed to its uplink by renaming them into
//! `.claims/<session-id>/`, so a concurrent poller or an inbound session from
//! the same uplink cannot pick up the same packet. Confirmed files are deleted
//! from the claim directory; everything else is renamed back on release.
//!
//! ```text
//! outbound/
//! ├── 0000abcd.pkt          ← waiting
//! └── .claims/
//!     └── 3f2a9c1e/         ← owned by one session
//!         └── 0000abce.pkt
//! ```

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Uplink;
use crate::ftn::PktHeader;
use crate::logutil::escape_log;
use crate::validation::is_packet_name;

const CLAIMS_DIR: &str = ".claims";

#[derive(Debug, Clone)]
pub struct OutboundQueue {
    dir: PathBuf,
}

impl OutboundQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All queued packets, sorted by name for a stable send order.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).with_context(|| format!("scan outbound {}", self.dir.display())),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_packet_name(name) && entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Packets that may go to `uplink`. Without an uplink context every
    /// packet is eligible. Packets whose header cannot be read are skipped.
    pub fn eligible(&self, uplink: Option<&Uplink>) -> Result<Vec<PathBuf>> {
        let files = self.list()?;
        let Some(uplink) = uplink else { return Ok(files) };
        let mut out = Vec::new();
        for path in files {
            match PktHeader::read_from(&path) {
                Ok(h) if uplink.covers(&h.dest) => out.push(path),
                Ok(h) => debug!(
                    "outbound {} is for {}, not routed via {}",
                    path.display(),
                    h.dest,
                    uplink.address
                ),
                Err(e) => warn!(
                    "Skipping outbound {}: unreadable packet header ({})",
                    path.display(),
                    escape_log(&e.to_string())
                ),
            }
        }
        Ok(out)
    }

    /// Move the packets eligible for `uplink` into a claim owned by `session_id`.
    pub fn claim(&self, uplink: Option<&Uplink>, session_id: &str) -> Result<OutboundClaim> {
        let claim_dir = self.dir.join(CLAIMS_DIR).join(session_id);
        fs::create_dir_all(&claim_dir)
            .with_context(|| format!("create claim dir {}", claim_dir.display()))?;
        let mut files = Vec::new();
        for path in self.eligible(uplink)? {
            let Some(name) = path.file_name() else { continue };
            let target = claim_dir.join(name);
            match fs::rename(&path, &target) {
                Ok(()) => files.push(target),
                // Someone else claimed it between the scan and the rename.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("outbound {} vanished before claim", path.display())
                }
                Err(e) => warn!("Failed to claim {}: {}", path.display(), e),
            }
        }
        if !files.is_empty() {
            debug!("session {} claimed {} outbound packet(s)", session_id, files.len());
        }
        Ok(OutboundClaim { queue_dir: self.dir.clone(), claim_dir, files })
    }

    /// Return packets left behind by sessions that died mid-transfer.
    pub fn recover_stale_claims(&self) -> Result<usize> {
        let root = self.dir.join(CLAIMS_DIR);
        let entries = match fs::read_dir(&root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut restored = 0;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let mut claim = OutboundClaim {
                queue_dir: self.dir.clone(),
                claim_dir: entry.path(),
                files: Vec::new(),
            };
            for f in fs::read_dir(entry.path())?.flatten() {
                claim.files.push(f.path());
            }
            restored += claim.release_all();
        }
        if restored > 0 {
            info!("Recovered {} outbound packet(s) from stale claims", restored);
        }
        Ok(restored)
    }
}

/// Files one session owns until it confirms or releases them.
#[derive(Debug)]
pub struct OutboundClaim {
    queue_dir: PathBuf,
    claim_dir: PathBuf,
    files: Vec<PathBuf>,
}

impl OutboundClaim {
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn take(&mut self, name: &str) -> Option<PathBuf> {
        let pos = self
            .files
            .iter()
            .position(|p| p.file_name().and_then(|n| n.to_str()) == Some(name))?;
        Some(self.files.remove(pos))
    }

    /// The peer confirmed `name`: delete it for good.
    pub fn confirm(&mut self, name: &str) -> Result<bool> {
        match self.take(name) {
            Some(path) => {
                fs::remove_file(&path)
                    .with_context(|| format!("remove sent packet {}", path.display()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Put `name` back into the queue (peer skipped it).
    pub fn release(&mut self, name: &str) -> bool {
        match self.take(name) {
            Some(path) => {
                restore(&self.queue_dir, &path);
                true
            }
            None => false,
        }
    }

    /// Put every unconfirmed file back and drop the claim directory.
    pub fn release_all(&mut self) -> usize {
        let count = self.files.len();
        for path in self.files.drain(..) {
            restore(&self.queue_dir, &path);
        }
        let _ = fs::remove_dir(&self.claim_dir);
        count
    }
}

fn restore(queue_dir: &Path, path: &Path) {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return };
    let target = crate::binkp::transfer::unique_destination(queue_dir, name);
    if let Err(e) = fs::rename(path, &target) {
        warn!("Failed to return {} to outbound: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftn::FtnAddress;
    use chrono::Utc;

    fn write_pkt(dir: &Path, name: &str, dest: &str) -> PathBuf {
        let header = PktHeader {
            orig: FtnAddress::parse("1:153/150").unwrap(),
            dest: FtnAddress::parse(dest).unwrap(),
            password: String::new(),
        };
        let path = dir.join(name);
        let mut image = header.encode(Utc::now()).to_vec();
        image.extend_from_slice(&[0, 0]);
        fs::write(&path, image).unwrap();
        path
    }

    fn uplink(address: &str, networks: &[&str]) -> Uplink {
        Uplink {
            address: address.into(),
            hostname: "h".into(),
            port: 24554,
            password: String::new(),
            domain: "fidonet".into(),
            networks: networks.iter().map(|s| s.to_string()).collect(),
            enabled: true,
        }
    }

    #[test]
    fn routing_filter_separates_networks() {
        let dir = tempfile::tempdir().unwrap();
        write_pkt(dir.path(), "a.pkt", "2:5030/1000");
        write_pkt(dir.path(), "b.pkt", "1:153/149");
        let q = OutboundQueue::new(dir.path());
        let a = uplink("1:153/149", &["1:153/*"]);
        let b = uplink("2:5030/1000", &["2:5030/*"]);

        let names = |v: Vec<PathBuf>| -> Vec<String> {
            v.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect()
        };
        assert_eq!(names(q.eligible(Some(&a)).unwrap()), vec!["b.pkt"]);
        assert_eq!(names(q.eligible(Some(&b)).unwrap()), vec!["a.pkt"]);
        assert_eq!(q.eligible(None).unwrap().len(), 2);
    }

    #[test]
    fn unparseable_headers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("junk.pkt"), b"short").unwrap();
        let q = OutboundQueue::new(dir.path());
        assert!(q.eligible(Some(&uplink("1:153/149", &["1:*"]))).unwrap().is_empty());
        assert!(dir.path().join("junk.pkt").exists());
    }

    #[test]
    fn non_packets_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        write_pkt(dir.path(), "c.PKT", "1:153/149");
        let q = OutboundQueue::new(dir.path());
        assert_eq!(q.list().unwrap().len(), 1);
    }

    #[test]
    fn claim_confirm_and_release() {
        let dir = tempfile::tempdir().unwrap();
        write_pkt(dir.path(), "a.pkt", "1:153/149");
        write_pkt(dir.path(), "b.pkt", "1:153/149");
        let q = OutboundQueue::new(dir.path());
        let mut claim = q.claim(None, "s1").unwrap();
        assert_eq!(claim.files().len(), 2);
        assert!(q.list().unwrap().is_empty(), "claimed files leave the queue");

        // A second claimant sees nothing.
        assert!(q.claim(None, "s2").unwrap().files().is_empty());

        assert!(claim.confirm("a.pkt").unwrap());
        assert!(!claim.confirm("a.pkt").unwrap());
        assert_eq!(claim.release_all(), 1);
        let left = q.list().unwrap();
        assert_eq!(left, vec![dir.path().join("b.pkt")]);
        assert!(!dir.path().join(".claims").join("s1").exists());
    }

    #[test]
    fn stale_claims_are_recovered() {
        let dir = tempfile::tempdir().unwrap();
        write_pkt(dir.path(), "a.pkt", "1:153/149");
        let q = OutboundQueue::new(dir.path());
        let claim = q.claim(None, "dead").unwrap();
        std::mem::forget(claim);
        assert!(q.list().unwrap().is_empty());
        assert_eq!(q.recover_stale_claims().unwrap(), 1);
        assert_eq!(q.list().unwrap().len(), 1);
    }
}
