//! Test utilities & fixtures.
//! Builds throwaway nodes rooted in temp dirs with short protocol timeouts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ftnbbs::config::{Config, Uplink};
use ftnbbs::ftn::{FtnAddress, FtnMessage, FtsPacketStore, PacketStore};
use ftnbbs::storage::MessageStore;

pub fn uplink(address: &str, port: u16, password: &str, networks: &[&str]) -> Uplink {
    Uplink {
        address: format!("{}@fidonet", address),
        hostname: "127.0.0.1".to_string(),
        port,
        password: password.to_string(),
        domain: "fidonet".to_string(),
        networks: networks.iter().map(|s| s.to_string()).collect(),
        enabled: true,
    }
}

/// A node with address `local` whose directories live under `root`.
pub fn node(root: &Path, local: &str, uplinks: Vec<Uplink>) -> Config {
    let mut cfg = Config::default();
    cfg.system.name = format!("Node {}", local);
    cfg.system.addresses = vec![format!("{}@fidonet", local)];
    cfg.system.data_dir = root.join("data").to_string_lossy().into_owned();
    cfg.binkp.bind_address = "127.0.0.1".to_string();
    cfg.binkp.port = 0;
    cfg.binkp.inbound_dir = root.join("inbound").to_string_lossy().into_owned();
    cfg.binkp.outbound_dir = root.join("outbound").to_string_lossy().into_owned();
    cfg.binkp.connect_timeout_secs = 2;
    cfg.binkp.handshake_timeout_secs = 5;
    cfg.binkp.read_timeout_secs = 2;
    cfg.binkp.session_timeout_secs = 30;
    cfg.binkp.got_wait_secs = 5;
    cfg.binkp.got_idle_secs = 3;
    cfg.binkp.eob_grace_secs = 0;
    cfg.binkp.eob_grace_after_send_secs = 0;
    cfg.uplinks = uplinks;
    cfg.logging.file = None;
    cfg.logging.security_file = None;
    cfg.logging.session_log = Some(root.join("sessions.jsonl").to_string_lossy().into_owned());
    std::fs::create_dir_all(cfg.inbound_dir()).unwrap();
    std::fs::create_dir_all(cfg.outbound_dir()).unwrap();
    cfg
}

pub fn packet_store(cfg: &Config) -> FtsPacketStore {
    let messages = MessageStore::new(cfg.data_dir()).unwrap();
    FtsPacketStore::new(cfg.primary_address().unwrap(), cfg.outbound_dir(), messages)
}

/// Put a one-message netmail packet for `dest` into the node's outbound.
pub fn queue_netmail(cfg: &Config, dest: &str, subject: &str) -> PathBuf {
    let dest = FtnAddress::parse(dest).unwrap();
    let msg = FtnMessage::netmail(
        cfg.primary_address().unwrap().without_domain(),
        dest.clone(),
        "Sysop",
        "All",
        subject,
        "Test body",
    );
    packet_store(cfg).write(&[msg], &dest, None).unwrap()
}

pub fn packets_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|rd| {
            rd.flatten()
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.ends_with(".pkt"))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[allow(dead_code)] // Not every test binary waits on the remote side.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    check()
}

pub fn shared(cfg: Config) -> Arc<Config> {
    Arc::new(cfg)
}
