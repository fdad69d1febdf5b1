//! Fixtures shared by the unit tests.
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use crate::config::{Config, Uplink};
use crate::ftn::{FtnAddress, PktHeader};

pub fn uplink(address: &str, password: &str, networks: &[&str]) -> Uplink {
    Uplink {
        address: address.to_string(),
        hostname: "127.0.0.1".to_string(),
        port: 24554,
        password: password.to_string(),
        domain: "fidonet".to_string(),
        networks: networks.iter().map(|s| s.to_string()).collect(),
        enabled: true,
    }
}

/// A node at `local` rooted in `dir`, with short timeouts.
pub fn node_config(dir: &Path, local: &str, uplinks: Vec<Uplink>) -> Config {
    let mut cfg = Config::default();
    cfg.system.name = format!("Test {}", local);
    cfg.system.addresses = vec![format!("{}@fidonet", local)];
    cfg.system.data_dir = dir.join("data").to_string_lossy().into_owned();
    cfg.binkp.inbound_dir = dir.join("inbound").to_string_lossy().into_owned();
    cfg.binkp.outbound_dir = dir.join("outbound").to_string_lossy().into_owned();
    cfg.binkp.handshake_timeout_secs = 5;
    cfg.binkp.read_timeout_secs = 2;
    cfg.binkp.session_timeout_secs = 30;
    cfg.binkp.got_wait_secs = 5;
    cfg.binkp.got_idle_secs = 3;
    cfg.binkp.eob_grace_secs = 0;
    cfg.binkp.eob_grace_after_send_secs = 0;
    cfg.uplinks = uplinks;
    std::fs::create_dir_all(cfg.inbound_dir()).unwrap();
    std::fs::create_dir_all(cfg.outbound_dir()).unwrap();
    cfg
}

pub fn shared(cfg: Config) -> Arc<Config> {
    Arc::new(cfg)
}

/// A packet with a valid header addressed to `dest`, padded to `size` bytes.
pub fn write_packet(dir: &Path, name: &str, dest: &str, size: usize) -> std::path::PathBuf {
    let header = PktHeader {
        orig: FtnAddress::parse("1:153/150").unwrap(),
        dest: FtnAddress::parse(dest).unwrap(),
        password: String::new(),
    };
    let mut image = header.encode(Utc::now()).to_vec();
    image.resize(size.max(image.len()), 0);
    let path = dir.join(name);
    std::fs::write(&path, image).unwrap();
    path
}
