//! Nodelist lookups used by crash delivery.
//!
//! Only the connection flags of a node matter here. A full nodelist compiler
//! is outside this crate; [`StaticNodelist`] reads a JSON array of entries:
//!
//! ```json
//! [
//!   { "address": "2:5030/1000", "system_name": "Example BBS",
//!     "flags": ["CM", "IBN", "INA:bbs.example.org"] }
//! ]
//! ```

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::ftn::FtnAddress;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: String,
    #[serde(default)]
    pub system_name: String,
    #[serde(default)]
    pub sysop: String,
    #[serde(default)]
    pub location: String,
    /// Raw nodelist flags, e.g. `IBN:24555`, `INA:host.example`.
    #[serde(default)]
    pub flags: Vec<String>,
}

impl NodeEntry {
    /// Value of the first `NAME` or `NAME:value` flag. `Some("")` for a bare flag.
    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags.iter().find_map(|f| {
            let (key, value) = f.split_once(':').unwrap_or((f.as_str(), ""));
            key.eq_ignore_ascii_case(name).then_some(value)
        })
    }
}

pub trait NodelistManager: Send + Sync {
    /// Entry for `address` if the node is listed.
    fn crash_route_info(&self, address: &FtnAddress) -> Option<NodeEntry>;
}

/// In-memory nodelist keyed by `zone:net/node[.point]`.
#[derive(Debug, Clone, Default)]
pub struct StaticNodelist {
    entries: HashMap<String, NodeEntry>,
}

impl StaticNodelist {
    pub fn new(entries: Vec<NodeEntry>) -> Self {
        let mut list = Self::default();
        for e in entries {
            list.insert(e);
        }
        list
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read nodelist {}", path.display()))?;
        let entries: Vec<NodeEntry> = serde_json::from_str(&text)
            .with_context(|| format!("parse nodelist {}", path.display()))?;
        let list = Self::new(entries);
        debug!("Loaded {} nodelist entries from {}", list.len(), path.display());
        Ok(list)
    }

    pub fn insert(&mut self, entry: NodeEntry) {
        match FtnAddress::parse(&entry.address) {
            Ok(a) => {
                self.entries.insert(a.without_domain().to_string(), entry);
            }
            Err(e) => warn!("Ignoring nodelist entry '{}': {}", entry.address, e),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl NodelistManager for StaticNodelist {
    fn crash_route_info(&self, address: &FtnAddress) -> Option<NodeEntry> {
        self.entries.get(&address.without_domain().to_string()).cloned()
    }
}
