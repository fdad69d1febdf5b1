//! # Crash Delivery
//!
//! Netmail flagged crash skips the hub and is delivered straight to the
//! destination node. The destination's host comes from its nodelist flags
//! only; there is never a fallback to routing via an uplink.
//!
//! Each queued message becomes a [`CrashmailQueueItem`] persisted in
//! `<data>/crashmail_queue.json`. [`CrashDelivery::process_queue`] picks the
//! items that are due, writes a one-message packet, opens a fresh binkp
//! session and counts the attempt as delivered only when the remote confirms
//! the packet with `M_GOT` and ends its batch with `M_EOB`.
//!
//! ```text
//! pending ──attempt──▶ attempting ──confirmed──▶ sent
//!    ▲                     │
//!    └──── retry later ────┤
//!                          └── attempts exhausted / no route ──▶ failed
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::binkp::client::open_stream;
use crate::binkp::session::{SendPlan, Session};
use crate::config::{Config, DEFAULT_BINKP_PORT};
use crate::ftn::{FtnAddress, PacketStore};
use crate::metrics;
use crate::nodelist::{NodeEntry, NodelistManager};
use crate::sessionlog::{NullSessionLog, SessionLog, SessionRecord};
use crate::storage::{read_file_locked, write_file_locked, MessageStore, StoredMessage};

const QUEUE_FILE: &str = "crashmail_queue.json";
const SPOOL_DIR: &str = "crashmail_spool";
const MAX_QUEUE_FILE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashmailStatus {
    Pending,
    Attempting,
    Sent,
    Failed,
}

impl std::fmt::Display for CrashmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CrashmailStatus::Pending => "pending",
            CrashmailStatus::Attempting => "attempting",
            CrashmailStatus::Sent => "sent",
            CrashmailStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashmailQueueItem {
    pub netmail_id: String,
    pub destination_address: String,
    #[serde(default)]
    pub destination_host: Option<String>,
    #[serde(default)]
    pub destination_port: Option<u16>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: CrashmailStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CrashmailQueueItem {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, CrashmailStatus::Pending | CrashmailStatus::Attempting)
            && self.next_attempt_at <= now
            && self.attempts < self.max_attempts
    }
}

/// Where a crash packet for a node can be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashRoute {
    pub hostname: String,
    pub port: u16,
    /// Nodelist flag the host was taken from.
    pub flag: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrashmailStats {
    pub processed: usize,
    pub sent: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

fn plausible_host(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']'))
}

/// Split `host[:port]`; a bare number is a port with no host.
fn split_host_port(value: &str) -> (Option<&str>, Option<u16>) {
    if value.is_empty() {
        return (None, None);
    }
    if let Ok(port) = value.parse::<u16>() {
        return (None, Some(port));
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
            Ok(p) => (Some(host), Some(p)),
            Err(_) => (Some(value), None),
        },
        _ => (Some(value), None),
    }
}

/// Pick a connectable host from nodelist flags: `IBN` (host from its own value
/// or from `INA`), then `INA`, then `IP`, then `ITN`. `ITN` ports are telnet
/// ports and are not reused.
pub fn route_from_entry(entry: &NodeEntry) -> Option<CrashRoute> {
    let ina_host = entry.flag("INA").filter(|h| plausible_host(h));

    if let Some(ibn) = entry.flag("IBN") {
        let (host, port) = split_host_port(ibn);
        if let Some(host) = host.filter(|h| plausible_host(h)).or(ina_host) {
            return Some(CrashRoute {
                hostname: host.to_string(),
                port: port.unwrap_or(DEFAULT_BINKP_PORT),
                flag: "IBN",
            });
        }
    }
    if let Some(host) = ina_host {
        return Some(CrashRoute { hostname: host.to_string(), port: DEFAULT_BINKP_PORT, flag: "INA" });
    }
    for flag in ["IP", "ITN"] {
        if let Some(value) = entry.flag(flag) {
            let (host, _) = split_host_port(value);
            if let Some(host) = host.filter(|h| plausible_host(h)) {
                return Some(CrashRoute { hostname: host.to_string(), port: DEFAULT_BINKP_PORT, flag });
            }
        }
    }
    None
}

pub struct CrashDelivery {
    config: Arc<Config>,
    messages: MessageStore,
    packets: Arc<dyn PacketStore>,
    nodelist: Arc<dyn NodelistManager>,
    session_log: Arc<dyn SessionLog>,
    queue_path: PathBuf,
    spool_dir: PathBuf,
    lock: Mutex<()>,
}

impl CrashDelivery {
    pub fn new(
        config: Arc<Config>,
        messages: MessageStore,
        packets: Arc<dyn PacketStore>,
        nodelist: Arc<dyn NodelistManager>,
    ) -> Self {
        let data = config.data_dir();
        Self {
            queue_path: data.join(QUEUE_FILE),
            spool_dir: data.join(SPOOL_DIR),
            config,
            messages,
            packets,
            nodelist,
            session_log: Arc::new(NullSessionLog),
            lock: Mutex::new(()),
        }
    }

    pub fn with_session_log(mut self, log: Arc<dyn SessionLog>) -> Self {
        self.session_log = log;
        self
    }

    fn load(&self) -> Result<Vec<CrashmailQueueItem>> {
        match read_file_locked(&self.queue_path, MAX_QUEUE_FILE)? {
            Some(text) if !text.trim().is_empty() => serde_json::from_str(&text)
                .with_context(|| format!("parse {}", self.queue_path.display())),
            _ => Ok(Vec::new()),
        }
    }

    fn save(&self, items: &[CrashmailQueueItem]) -> Result<()> {
        let text = serde_json::to_string_pretty(items)?;
        write_file_locked(&self.queue_path, &text)
    }

    fn update(&self, item: &CrashmailQueueItem) -> Result<()> {
        let mut items = self.load()?;
        match items.iter_mut().find(|i| i.netmail_id == item.netmail_id) {
            Some(slot) => *slot = item.clone(),
            None => items.push(item.clone()),
        }
        self.save(&items)
    }

    pub fn list(&self) -> Result<Vec<CrashmailQueueItem>> {
        self.load()
    }

    /// Nodelist route for `address`. `None` means crash delivery is impossible.
    pub fn resolve_destination(&self, address: &FtnAddress) -> Option<CrashRoute> {
        let entry = self.nodelist.crash_route_info(address)?;
        route_from_entry(&entry)
    }

    /// Queue a stored netmail. Returns false if it was already queued.
    pub async fn queue(&self, message: &StoredMessage) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut items = self.load()?;
        if items.iter().any(|i| i.netmail_id == message.id) {
            debug!("Netmail {} already queued for crash delivery", message.id);
            return Ok(false);
        }
        let route = self.resolve_destination(&message.message.dest);
        let now = Utc::now();
        items.push(CrashmailQueueItem {
            netmail_id: message.id.clone(),
            destination_address: message.message.dest.to_string(),
            destination_host: route.as_ref().map(|r| r.hostname.clone()),
            destination_port: route.as_ref().map(|r| r.port),
            attempts: 0,
            max_attempts: self.config.crashmail.max_attempts,
            next_attempt_at: now,
            status: CrashmailStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: None,
        });
        self.save(&items)?;
        info!("Queued netmail {} for crash delivery to {}", message.id, message.message.dest);
        Ok(true)
    }

    /// Attempt up to `limit` due items. Delivery failures are recorded on the
    /// item, never returned; one broken item never holds up the rest.
    pub async fn process_queue(&self, limit: usize) -> Result<CrashmailStats> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let due: Vec<CrashmailQueueItem> = self
            .load()?
            .into_iter()
            .filter(|i| i.is_due(now))
            .take(limit)
            .collect();

        let mut stats = CrashmailStats::default();
        for mut item in due {
            stats.processed += 1;
            if let Err(e) = self.attempt(&mut item).await {
                warn!("Could not record crash delivery of {}: {:#}", item.netmail_id, e);
            }
            match item.status {
                CrashmailStatus::Sent => stats.sent += 1,
                CrashmailStatus::Failed => stats.failed += 1,
                _ => stats.rescheduled += 1,
            }
        }
        if stats.processed > 0 {
            info!(
                "Crashmail: {} processed, {} sent, {} rescheduled, {} failed",
                stats.processed, stats.sent, stats.rescheduled, stats.failed
            );
        }
        Ok(stats)
    }

    async fn attempt(&self, item: &mut CrashmailQueueItem) -> Result<()> {
        let dest = match FtnAddress::parse(&item.destination_address) {
            Ok(a) => a,
            Err(e) => return self.fail(item, format!("bad destination address: {}", e)),
        };
        let Some(route) = self.resolve_destination(&dest) else {
            return self.fail(
                item,
                format!("no IBN/INA/IP/ITN route for {} in the nodelist", dest),
            );
        };
        let stored = match self.messages.get(&item.netmail_id) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                return self.fail(item, format!("netmail {} no longer exists", item.netmail_id))
            }
            Err(e) => return self.reschedule(item, &dest, format!("read netmail: {:#}", e)),
        };

        item.destination_host = Some(route.hostname.clone());
        item.destination_port = Some(route.port);
        item.status = CrashmailStatus::Attempting;
        item.updated_at = Some(Utc::now());
        self.update(item)?;

        info!(
            "Crash delivery of {} to {} via {}:{} ({})",
            item.netmail_id, dest, route.hostname, route.port, route.flag
        );
        match self.deliver(&stored, &dest, &route).await {
            Ok(()) => {
                item.status = CrashmailStatus::Sent;
                item.error_message = None;
                item.updated_at = Some(Utc::now());
                self.update(item)?;
                if let Err(e) = self.messages.mark_sent(&item.netmail_id) {
                    warn!(
                        "Delivered netmail {} but could not mark it sent: {:#}",
                        item.netmail_id, e
                    );
                }
                metrics::inc_crashmail(true);
                info!("Crash delivery of {} to {} confirmed", item.netmail_id, dest);
                Ok(())
            }
            Err(e) => self.reschedule(item, &dest, format!("{:#}", e)),
        }
    }

    /// Count a failed attempt: retry later, or give up once the budget is spent.
    fn reschedule(
        &self,
        item: &mut CrashmailQueueItem,
        dest: &FtnAddress,
        reason: String,
    ) -> Result<()> {
        item.attempts += 1;
        item.updated_at = Some(Utc::now());
        if item.attempts >= item.max_attempts {
            item.status = CrashmailStatus::Failed;
            metrics::inc_crashmail(false);
            warn!(
                "Crash delivery of {} to {} failed permanently after {} attempt(s): {}",
                item.netmail_id, dest, item.attempts, reason
            );
        } else {
            item.status = CrashmailStatus::Pending;
            let interval = self.config.crashmail.retry_interval_minutes as i64;
            item.next_attempt_at = Utc::now() + ChronoDuration::minutes(interval);
            warn!(
                "Crash delivery of {} to {} failed (attempt {}/{}), retry at {}: {}",
                item.netmail_id,
                dest,
                item.attempts,
                item.max_attempts,
                item.next_attempt_at,
                reason
            );
        }
        item.error_message = Some(reason);
        self.update(item)
    }

    fn fail(&self, item: &mut CrashmailQueueItem, reason: String) -> Result<()> {
        warn!("Crash delivery of {} impossible: {}", item.netmail_id, reason);
        item.status = CrashmailStatus::Failed;
        item.error_message = Some(reason);
        item.updated_at = Some(Utc::now());
        metrics::inc_crashmail(false);
        self.update(item)
    }

    async fn deliver(&self, stored: &StoredMessage, dest: &FtnAddress, route: &CrashRoute) -> Result<()> {
        fs::create_dir_all(&self.spool_dir)?;
        let name: String = stored.id.chars().filter(|c| c.is_ascii_hexdigit()).take(8).collect();
        let path = self.spool_dir.join(format!("{:0<8}.pkt", name));
        self.packets
            .write(std::slice::from_ref(&stored.message), dest, Some(&path))
            .context("write crash packet")?;

        let result = self.run_session(&path, route).await;
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Could not remove crash packet {}: {}", path.display(), e);
            }
        }
        result
    }

    async fn run_session(&self, path: &std::path::Path, route: &CrashRoute) -> Result<()> {
        let binkp = &self.config.binkp;
        let stream = open_stream(&route.hostname, route.port, binkp.connect_timeout()).await?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| route.hostname.clone());
        let started_at = Utc::now();
        let mut session = Session::originator(stream, self.config.clone(), None, None)
            .with_peer(peer)
            .with_send_plan(SendPlan::Files(vec![path.to_path_buf()]));
        let confirm = Duration::from_secs(self.config.crashmail.confirm_timeout_secs);
        let result = session.deliver_single(confirm).await;
        metrics::inc_session(result.is_ok());

        let record = SessionRecord::from_summary(
            &session.summary(),
            started_at,
            result.as_ref().err().map(|e| e.to_string()),
        );
        if let Err(e) = self.session_log.record(&record) {
            warn!("Failed to write session log: {:#}", e);
        }
        result.map_err(anyhow::Error::from)
    }

    /// Make a pending or failed item due again with a fresh attempt budget.
    pub async fn retry(&self, netmail_id: &str) -> Result<CrashmailQueueItem> {
        let _guard = self.lock.lock().await;
        let mut items = self.load()?;
        let item = items
            .iter_mut()
            .find(|i| i.netmail_id == netmail_id)
            .ok_or_else(|| anyhow!("no crashmail item for netmail {}", netmail_id))?;
        if item.status == CrashmailStatus::Sent {
            return Err(anyhow!("netmail {} was already delivered", netmail_id));
        }
        item.status = CrashmailStatus::Pending;
        item.attempts = 0;
        item.max_attempts = self.config.crashmail.max_attempts;
        item.next_attempt_at = Utc::now();
        item.error_message = None;
        item.updated_at = Some(Utc::now());
        let item = item.clone();
        self.save(&items)?;
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binkp::BinkpServer;
    use crate::ftn::{FtnMessage, FtsPacketStore};
    use crate::nodelist::StaticNodelist;
    use crate::sessionlog::FileSessionLog;
    use crate::testutil::{node_config, shared};
    use std::path::Path;
    use tokio::net::TcpListener;

    fn entry(address: &str, flags: &[&str]) -> NodeEntry {
        NodeEntry {
            address: address.into(),
            system_name: "Remote".into(),
            sysop: String::new(),
            location: String::new(),
            flags: flags.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn delivery(dir: &Path, nodes: Vec<NodeEntry>, tweak: impl FnOnce(&mut Config)) -> CrashDelivery {
        let mut cfg = node_config(dir, "1:153/150", vec![]);
        cfg.binkp.connect_timeout_secs = 2;
        cfg.crashmail.confirm_timeout_secs = 5;
        tweak(&mut cfg);
        let cfg = shared(cfg);
        let messages = MessageStore::new(cfg.data_dir()).unwrap();
        let packets = FtsPacketStore::new(
            cfg.primary_address().unwrap(),
            cfg.outbound_dir(),
            messages.clone(),
        );
        CrashDelivery::new(cfg, messages, Arc::new(packets), Arc::new(StaticNodelist::new(nodes)))
    }

    fn crash_message(d: &CrashDelivery, dest: &str) -> StoredMessage {
        let msg = FtnMessage::netmail(
            FtnAddress::parse("1:153/150").unwrap(),
            FtnAddress::parse(dest).unwrap(),
            "Sysop",
            "Remote Sysop",
            "crash",
            "urgent",
        );
        d.messages.create_outbound(msg, true).unwrap()
    }

    async fn closed_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        drop(l);
        port
    }

    #[test]
    fn route_priority() {
        let ibn_host = entry("1:1/1", &["INA:a.example", "IBN:b.example:24555"]);
        assert_eq!(
            route_from_entry(&ibn_host),
            Some(CrashRoute { hostname: "b.example".into(), port: 24555, flag: "IBN" })
        );
        let ibn_port = entry("1:1/1", &["IBN:24556", "INA:a.example"]);
        assert_eq!(
            route_from_entry(&ibn_port),
            Some(CrashRoute { hostname: "a.example".into(), port: 24556, flag: "IBN" })
        );
        let ina = entry("1:1/1", &["INA:a.example", "ITN:c.example"]);
        assert_eq!(route_from_entry(&ina).unwrap().flag, "INA");
        let itn = entry("1:1/1", &["ITN:c.example:2323"]);
        let route = route_from_entry(&itn).unwrap();
        assert_eq!((route.hostname.as_str(), route.port), ("c.example", DEFAULT_BINKP_PORT));
        assert_eq!(route_from_entry(&entry("1:1/1", &["IBN", "CM"])), None);
        assert_eq!(route_from_entry(&entry("1:1/1", &["INA:-Unpublished-"])), None);
    }

    #[tokio::test]
    async fn queue_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let d = delivery(dir.path(), vec![], |_| {});
        let m = crash_message(&d, "2:5030/1000");
        assert!(d.queue(&m).await.unwrap());
        assert!(!d.queue(&m).await.unwrap());
        assert_eq!(d.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_route_fails_without_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let d = delivery(dir.path(), vec![entry("2:5030/1000", &["CM", "XA"])], |_| {});
        let m = crash_message(&d, "2:5030/1000");
        d.queue(&m).await.unwrap();

        let stats = d.process_queue(10).await.unwrap();
        assert_eq!(stats, CrashmailStats { processed: 1, sent: 0, rescheduled: 0, failed: 1 });
        let item = d.list().unwrap().remove(0);
        assert_eq!(item.status, CrashmailStatus::Failed);
        assert_eq!(item.attempts, 0);
        assert!(item.error_message.unwrap().contains("route"));
        assert!(item.destination_host.is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_rescheduled() {
        let dir = tempfile::tempdir().unwrap();
        let port = closed_port().await;
        let flag = format!("IBN:127.0.0.1:{}", port);
        let d = delivery(dir.path(), vec![entry("2:5030/1000", &[flag.as_str()])], |c| {
            c.crashmail.retry_interval_minutes = 15;
        });
        let m = crash_message(&d, "2:5030/1000");
        d.queue(&m).await.unwrap();

        let before = Utc::now();
        let stats = d.process_queue(10).await.unwrap();
        assert_eq!(stats.rescheduled, 1);
        let item = d.list().unwrap().remove(0);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.status, CrashmailStatus::Pending);
        assert!(item.next_attempt_at >= before + ChronoDuration::minutes(15));
        assert!(item.error_message.is_some());

        // Not due again yet.
        assert_eq!(d.process_queue(10).await.unwrap().processed, 0);
        assert!(!d.messages.get(&m.id).unwrap().unwrap().sent);
    }

    #[tokio::test]
    async fn unreadable_netmail_does_not_block_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let port = closed_port().await;
        let flag = format!("IBN:127.0.0.1:{}", port);
        let d = delivery(dir.path(), vec![entry("2:5030/1000", &[flag.as_str()])], |_| {});
        let broken = crash_message(&d, "2:5030/1000");
        let good = crash_message(&d, "2:5030/1000");
        d.queue(&broken).await.unwrap();
        d.queue(&good).await.unwrap();
        let netmail = dir.path().join("data").join("netmail").join(format!("{}.json", broken.id));
        fs::write(&netmail, "{not json").unwrap();

        let stats = d.process_queue(10).await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.rescheduled, 2);
        let items = d.list().unwrap();
        let find = |id: &str| items.iter().find(|i| i.netmail_id == id).unwrap().clone();
        let broken_item = find(&broken.id);
        assert_eq!(broken_item.attempts, 1);
        assert_eq!(broken_item.status, CrashmailStatus::Pending);
        assert!(broken_item.error_message.unwrap().contains("read netmail"));
        let good_item = find(&good.id);
        assert_eq!(good_item.attempts, 1);
        assert!(!good_item.error_message.unwrap().contains("read netmail"));
    }

    #[tokio::test]
    async fn fails_permanently_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let port = closed_port().await;
        let flag = format!("IBN:127.0.0.1:{}", port);
        let d = delivery(dir.path(), vec![entry("2:5030/1000", &[flag.as_str()])], |c| {
            c.crashmail.retry_interval_minutes = 0;
            c.crashmail.max_attempts = 2;
        });
        let m = crash_message(&d, "2:5030/1000");
        d.queue(&m).await.unwrap();

        d.process_queue(10).await.unwrap();
        assert_eq!(d.list().unwrap()[0].status, CrashmailStatus::Pending);
        let stats = d.process_queue(10).await.unwrap();
        assert_eq!(stats.failed, 1);
        let item = d.list().unwrap().remove(0);
        assert_eq!(item.status, CrashmailStatus::Failed);
        assert_eq!(item.attempts, 2);
        assert_eq!(d.process_queue(10).await.unwrap().processed, 0);

        let retried = d.retry(&m.id).await.unwrap();
        assert_eq!(retried.status, CrashmailStatus::Pending);
        assert_eq!(retried.attempts, 0);
    }

    #[tokio::test]
    async fn delivers_to_a_live_node() {
        let remote_dir = tempfile::tempdir().unwrap();
        let mut remote_cfg = node_config(remote_dir.path(), "2:5030/1000", vec![]);
        remote_cfg.binkp.bind_address = "127.0.0.1".into();
        remote_cfg.binkp.port = 0;
        let remote_inbound = remote_cfg.inbound_dir();
        let mut server = BinkpServer::new(shared(remote_cfg));
        let addr = server.start().await.unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move { server.run().await });

        let dir = tempfile::tempdir().unwrap();
        let flag = format!("IBN:127.0.0.1:{}", addr.port());
        let log = FileSessionLog::new(dir.path().join("sessions.jsonl"));
        let d = delivery(dir.path(), vec![entry("2:5030/1000", &[flag.as_str()])], |_| {})
            .with_session_log(Arc::new(log.clone()));
        let m = crash_message(&d, "2:5030/1000");
        d.queue(&m).await.unwrap();

        let stats = d.process_queue(10).await.unwrap();
        assert_eq!(stats.sent, 1, "{:?}", d.list().unwrap());
        let records = log.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].role, "originator");
        assert_eq!(records[0].files_sent.len(), 1);
        let item = d.list().unwrap().remove(0);
        assert_eq!(item.status, CrashmailStatus::Sent);
        assert_eq!(item.destination_port, Some(addr.port()));
        assert!(d.messages.get(&m.id).unwrap().unwrap().sent);

        let received: Vec<_> = fs::read_dir(&remote_inbound)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".pkt"))
            .collect();
        assert_eq!(received.len(), 1);
        let spooled = fs::read_dir(dir.path().join("data").join(SPOOL_DIR)).unwrap().count();
        assert_eq!(spooled, 0);

        handle.stop();
        task.await.unwrap().unwrap();
    }
}
