//! # Configuration Management Module
//!
//! Everything the mailer needs is loaded once from a TOML file into [`Config`]
//! and handed to the client, server, sessions and crash delivery explicitly
//! (usually wrapped in an `Arc`). There is no global configuration state.
//!
//! ## Configuration Structure
//!
//! - [`SystemConfig`] - Our identity: system name, sysop, location, AKAs
//! - [`BinkpConfig`] - Listener, queue directories and protocol timeouts
//! - [`Uplink`] - One `[[uplinks]]` entry per peer we exchange mail with
//! - [`CrashmailConfig`] - Retry policy for direct deliveries
//! - [`NodelistConfig`] - Where node connection flags come from
//! - [`LoggingConfig`] - Log files and the session audit log
//!
//! ## Configuration File Format
//!
//! ```toml
//! [system]
//! name = "My FTN BBS"
//! sysop = "sysop"
//! location = "Somewhere"
//! addresses = ["1:153/150@fidonet"]
//! data_dir = "./data"
//!
//! [binkp]
//! port = 24554
//! inbound_dir = "./data/inbound"
//! outbound_dir = "./data/outbound"
//!
//! [[uplinks]]
//! address = "1:153/149@fidonet"
//! hostname = "hub.example.org"
//! password = "secret"
//! networks = ["1:*"]
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::ftn::{FtnAddress, NetworkPattern};

pub const DEFAULT_BINKP_PORT: u16 = 24554;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub name: String,
    pub sysop: String,
    pub location: String,
    /// Our AKAs; the first one is the primary address.
    pub addresses: Vec<String>,
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinkpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub inbound_dir: String,
    pub outbound_dir: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum wait for a single read before it counts as stalled.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Hard upper bound on one whole session.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Overall wait for M_GOT confirmations after our batch.
    #[serde(default = "default_got_wait")]
    pub got_wait_secs: u64,
    /// Abort the M_GOT wait after this long without any frame.
    #[serde(default = "default_got_idle")]
    pub got_idle_secs: u64,
    /// Pause before our EOB to let the peer start its own batch.
    #[serde(default = "default_eob_grace")]
    pub eob_grace_secs: u64,
    #[serde(default = "default_eob_grace_after_send")]
    pub eob_grace_after_send_secs: u64,
    /// Minutes between automatic uplink polls when running the server (0 disables).
    #[serde(default)]
    pub poll_interval_minutes: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_BINKP_PORT
}

fn default_max_connections() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_session_timeout() -> u64 {
    1800
}

fn default_handshake_timeout() -> u64 {
    60
}

fn default_got_wait() -> u64 {
    120
}

fn default_got_idle() -> u64 {
    30
}

fn default_eob_grace() -> u64 {
    2
}

fn default_eob_grace_after_send() -> u64 {
    5
}

impl BinkpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn got_wait(&self) -> Duration {
        Duration::from_secs(self.got_wait_secs)
    }

    pub fn got_idle(&self) -> Duration {
        Duration::from_secs(self.got_idle_secs)
    }

    pub fn eob_grace(&self, sent_files: bool) -> Duration {
        if sent_files {
            Duration::from_secs(self.eob_grace_after_send_secs)
        } else {
            Duration::from_secs(self.eob_grace_secs)
        }
    }
}

/// A configured peer system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Uplink {
    pub address: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Network patterns (`1:153/*`, `2:*`) whose mail is routed via this uplink.
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_domain() -> String {
    "fidonet".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Uplink {
    pub fn ftn_address(&self) -> Result<FtnAddress> {
        let mut a = FtnAddress::parse(&self.address)
            .map_err(|e| anyhow!("uplink address '{}': {}", self.address, e))?;
        if a.domain.is_none() && !self.domain.is_empty() {
            a.domain = Some(self.domain.to_ascii_lowercase());
        }
        Ok(a)
    }

    /// Whether mail for `dest` belongs to this uplink's networks. An uplink
    /// without explicit networks covers its own zone.
    pub fn covers(&self, dest: &FtnAddress) -> bool {
        if let Some(d) = &dest.domain {
            if !self.domain.is_empty() && !d.eq_ignore_ascii_case(&self.domain) {
                return false;
            }
        }
        if self.networks.is_empty() {
            return self
                .ftn_address()
                .map(|a| NetworkPattern::zone(a.zone).matches(dest))
                .unwrap_or(false);
        }
        self.networks
            .iter()
            .filter_map(|n| NetworkPattern::parse(n).ok())
            .any(|p| p.matches(dest))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashmailConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub retry_interval_minutes: u64,
    /// Wait for M_GOT/M_EOB after the crash packet was sent.
    pub confirm_timeout_secs: u64,
    /// Items handled per processing pass.
    pub batch_limit: usize,
}

impl Default for CrashmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            retry_interval_minutes: 15,
            confirm_timeout_secs: 30,
            batch_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodelistConfig {
    /// JSON file of node entries (address, system name, flags).
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    #[serde(default)]
    pub security_file: Option<String>,
    /// JSON-lines audit of every binkp session.
    #[serde(default)]
    pub session_log: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    pub binkp: BinkpConfig,
    #[serde(default)]
    pub uplinks: Vec<Uplink>,
    #[serde(default)]
    pub crashmail: CrashmailConfig,
    #[serde(default)]
    pub nodelist: NodelistConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.system.addresses.is_empty() {
            return Err(anyhow!("system.addresses must contain at least one address"));
        }
        for a in &self.system.addresses {
            FtnAddress::parse(a).map_err(|e| anyhow!("system address '{}': {}", a, e))?;
        }
        if self.binkp.port == 0 {
            return Err(anyhow!("binkp.port must be non-zero"));
        }
        if self.binkp.max_connections == 0 {
            return Err(anyhow!("binkp.max_connections must be at least 1"));
        }
        for u in &self.uplinks {
            u.ftn_address()?;
            if u.hostname.trim().is_empty() {
                return Err(anyhow!("uplink {} has no hostname", u.address));
            }
            for n in &u.networks {
                NetworkPattern::parse(n)
                    .map_err(|e| anyhow!("uplink {} network '{}': {}", u.address, n, e))?;
            }
        }
        if self.crashmail.max_attempts == 0 {
            return Err(anyhow!("crashmail.max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Our AKAs, parsed. Unparseable entries are skipped (validated on load).
    pub fn local_addresses(&self) -> Vec<FtnAddress> {
        self.system
            .addresses
            .iter()
            .filter_map(|a| FtnAddress::parse(a).ok())
            .collect()
    }

    pub fn primary_address(&self) -> Option<FtnAddress> {
        self.local_addresses().into_iter().next()
    }

    pub fn uplink_by_address(&self, addr: &FtnAddress) -> Option<&Uplink> {
        self.uplinks.iter().find(|u| {
            u.ftn_address().map(|a| a.same_system(addr)).unwrap_or(false)
        })
    }

    pub fn enabled_uplinks(&self) -> Vec<&Uplink> {
        self.uplinks.iter().filter(|u| u.enabled).collect()
    }

    /// Password configured for a remote system, if it is a known uplink with
    /// a non-empty password.
    pub fn password_for_address(&self, addr: &FtnAddress) -> Option<&str> {
        self.uplink_by_address(addr)
            .map(|u| u.password.as_str())
            .filter(|p| !p.is_empty())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.system.data_dir)
    }

    pub fn inbound_dir(&self) -> PathBuf {
        PathBuf::from(&self.binkp.inbound_dir)
    }

    pub fn outbound_dir(&self) -> PathBuf {
        PathBuf::from(&self.binkp.outbound_dir)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            system: SystemConfig {
                name: "ftnbbs Station".to_string(),
                sysop: "sysop".to_string(),
                location: "Your Location".to_string(),
                addresses: vec!["1:153/150@fidonet".to_string()],
                data_dir: "./data".to_string(),
            },
            binkp: BinkpConfig {
                bind_address: default_bind_address(),
                port: DEFAULT_BINKP_PORT,
                inbound_dir: "./data/inbound".to_string(),
                outbound_dir: "./data/outbound".to_string(),
                max_connections: default_max_connections(),
                connect_timeout_secs: default_connect_timeout(),
                read_timeout_secs: default_read_timeout(),
                session_timeout_secs: default_session_timeout(),
                handshake_timeout_secs: default_handshake_timeout(),
                got_wait_secs: default_got_wait(),
                got_idle_secs: default_got_idle(),
                eob_grace_secs: default_eob_grace(),
                eob_grace_after_send_secs: default_eob_grace_after_send(),
                poll_interval_minutes: 0,
            },
            uplinks: vec![Uplink {
                address: "1:153/149@fidonet".to_string(),
                hostname: "hub.example.org".to_string(),
                port: DEFAULT_BINKP_PORT,
                password: String::new(),
                domain: default_domain(),
                networks: vec!["1:*".to_string()],
                enabled: false,
            }],
            crashmail: CrashmailConfig::default(),
            nodelist: NodelistConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("ftnbbs.log".to_string()),
                security_file: Some("ftnbbs-security.log".to_string()),
                session_log: Some("data/sessions.jsonl".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uplink(address: &str, domain: &str, networks: &[&str]) -> Uplink {
        Uplink {
            address: address.to_string(),
            hostname: "h".to_string(),
            port: DEFAULT_BINKP_PORT,
            password: "secret".to_string(),
            domain: domain.to_string(),
            networks: networks.iter().map(|s| s.to_string()).collect(),
            enabled: true,
        }
    }

    #[test]
    fn default_config_validates_and_roundtrips_toml() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.binkp.port, DEFAULT_BINKP_PORT);
        assert_eq!(back.uplinks.len(), 1);
    }

    #[test]
    fn minimal_toml_fills_defaults() {
        let text = r#"
            [system]
            name = "n"
            sysop = "s"
            location = "l"
            addresses = ["2:5030/999"]
            data_dir = "d"

            [binkp]
            inbound_dir = "in"
            outbound_dir = "out"

            [[uplinks]]
            address = "2:5030/1000"
            hostname = "hub"

            [logging]
            level = "info"
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.binkp.got_wait_secs, 120);
        assert_eq!(cfg.binkp.got_idle_secs, 30);
        assert_eq!(cfg.crashmail.max_attempts, 3);
        assert!(cfg.uplinks[0].enabled);
        assert_eq!(cfg.uplinks[0].port, DEFAULT_BINKP_PORT);
    }

    #[test]
    fn routing_filter_by_networks() {
        let a = uplink("1:153/149", "fidonet", &["1:153/*"]);
        let b = uplink("2:5030/1000", "fidonet", &["2:5030/*"]);
        let dest = FtnAddress::parse("2:5030/1000").unwrap();
        assert!(!a.covers(&dest));
        assert!(b.covers(&dest));
    }

    #[test]
    fn uplink_without_networks_covers_own_zone() {
        let u = uplink("21:1/100", "fsxnet", &[]);
        assert!(u.covers(&FtnAddress::parse("21:3/110").unwrap()));
        assert!(!u.covers(&FtnAddress::parse("1:3/110").unwrap()));
    }

    #[test]
    fn foreign_domain_is_not_covered() {
        let u = uplink("1:153/149", "fidonet", &["1:*"]);
        assert!(!u.covers(&FtnAddress::parse("1:153/1@othernet").unwrap()));
        assert!(u.covers(&FtnAddress::parse("1:153/1@FidoNet").unwrap()));
    }

    #[test]
    fn password_lookup_ignores_domain() {
        let mut cfg = Config::default();
        cfg.uplinks = vec![uplink("1:153/149", "fidonet", &[])];
        let remote = FtnAddress::parse("1:153/149@fidonet").unwrap();
        assert_eq!(cfg.password_for_address(&remote), Some("secret"));
        assert_eq!(cfg.password_for_address(&FtnAddress::parse("1:1/1").unwrap()), None);
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut cfg = Config::default();
        cfg.crashmail.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }
}
