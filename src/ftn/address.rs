//! FTN addressing: `zone:net/node[.point][@domain]` and the wildcard network
//! patterns used to scope uplinks (`1:153/*`, `2:*`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("address '{0}' is missing the zone (expected zone:net/node)")]
    MissingZone(String),
    #[error("address '{0}' is missing the node (expected zone:net/node)")]
    MissingNode(String),
    #[error("invalid number '{part}' in address '{input}'")]
    InvalidNumber { input: String, part: String },
}

/// A FidoNet technology network address.
///
/// Equality and hashing include the domain; use [`FtnAddress::same_system`]
/// when the domain suffix should be ignored (peers are inconsistent about
/// sending it).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FtnAddress {
    pub zone: u16,
    pub net: u16,
    pub node: u16,
    pub point: u16,
    pub domain: Option<String>,
}

fn parse_part(input: &str, part: &str) -> Result<u16, AddressError> {
    part.trim().parse::<u16>().map_err(|_| AddressError::InvalidNumber {
        input: input.to_string(),
        part: part.to_string(),
    })
}

impl FtnAddress {
    pub fn new(zone: u16, net: u16, node: u16, point: u16) -> Self {
        Self { zone, net, node, point, domain: None }
    }

    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        let (body, domain) = match s.split_once('@') {
            Some((b, d)) if !d.is_empty() => (b, Some(d.to_ascii_lowercase())),
            Some((b, _)) => (b, None),
            None => (s, None),
        };
        let (zone, rest) = body
            .split_once(':')
            .ok_or_else(|| AddressError::MissingZone(input.to_string()))?;
        let (net, rest) = rest
            .split_once('/')
            .ok_or_else(|| AddressError::MissingNode(input.to_string()))?;
        let (node, point) = match rest.split_once('.') {
            Some((n, p)) => (n, Some(p)),
            None => (rest, None),
        };
        Ok(Self {
            zone: parse_part(input, zone)?,
            net: parse_part(input, net)?,
            node: parse_part(input, node)?,
            point: match point {
                Some(p) => parse_part(input, p)?,
                None => 0,
            },
            domain,
        })
    }

    /// Same zone/net/node/point, domain ignored.
    pub fn same_system(&self, other: &FtnAddress) -> bool {
        self.zone == other.zone
            && self.net == other.net
            && self.node == other.node
            && self.point == other.point
    }

    /// 4D representation with `@domain` appended when known.
    pub fn with_domain(&self) -> String {
        match &self.domain {
            Some(d) => format!("{}@{}", self, d),
            None => self.to_string(),
        }
    }

    pub fn without_domain(&self) -> Self {
        Self { domain: None, ..self.clone() }
    }
}

impl fmt::Display for FtnAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.zone, self.net, self.node)?;
        if self.point != 0 {
            write!(f, ".{}", self.point)?;
        }
        Ok(())
    }
}

impl FromStr for FtnAddress {
    type Err = AddressError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FtnAddress {
    type Error = AddressError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FtnAddress> for String {
    fn from(a: FtnAddress) -> Self {
        a.with_domain()
    }
}

/// Wildcard pattern over zone/net/node. `*` (or a missing trailing part)
/// matches anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPattern {
    zone: Option<u16>,
    net: Option<u16>,
    node: Option<u16>,
}

impl NetworkPattern {
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        let body = s.split_once('@').map(|(b, _)| b).unwrap_or(s);
        let wild = |p: &str| -> Result<Option<u16>, AddressError> {
            let p = p.trim();
            if p == "*" || p.is_empty() {
                Ok(None)
            } else {
                parse_part(input, p).map(Some)
            }
        };
        if body == "*" {
            return Ok(Self { zone: None, net: None, node: None });
        }
        let (zone, rest) = body
            .split_once(':')
            .ok_or_else(|| AddressError::MissingZone(input.to_string()))?;
        let (net, node) = match rest.split_once('/') {
            Some((n, f)) => (n, f.split('.').next().unwrap_or(f)),
            None => (rest, "*"),
        };
        Ok(Self { zone: wild(zone)?, net: wild(net)?, node: wild(node)? })
    }

    /// Pattern covering a whole zone.
    pub fn zone(zone: u16) -> Self {
        Self { zone: Some(zone), net: None, node: None }
    }

    pub fn matches(&self, addr: &FtnAddress) -> bool {
        self.zone.map_or(true, |z| z == addr.zone)
            && self.net.map_or(true, |n| n == addr.net)
            && self.node.map_or(true, |n| n == addr.node)
    }
}

/// Parse the space separated address list carried by `M_ADR`. Entries that
/// fail to parse are dropped.
pub fn parse_address_list(line: &str) -> Vec<FtnAddress> {
    line.split_whitespace()
        .filter_map(|a| FtnAddress::parse(a).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_address_with_domain() {
        let a = FtnAddress::parse("2:5030/1000.7@FidoNet").unwrap();
        assert_eq!((a.zone, a.net, a.node, a.point), (2, 5030, 1000, 7));
        assert_eq!(a.domain.as_deref(), Some("fidonet"));
        assert_eq!(a.to_string(), "2:5030/1000.7");
        assert_eq!(a.with_domain(), "2:5030/1000.7@fidonet");
    }

    #[test]
    fn rejects_incomplete_addresses() {
        assert_eq!(FtnAddress::parse(""), Err(AddressError::Empty));
        assert!(matches!(FtnAddress::parse("153/149"), Err(AddressError::MissingZone(_))));
        assert!(matches!(FtnAddress::parse("1:153"), Err(AddressError::MissingNode(_))));
        assert!(matches!(
            FtnAddress::parse("1:15x/2"),
            Err(AddressError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn same_system_ignores_domain() {
        let a = FtnAddress::parse("1:153/149@fidonet").unwrap();
        let b = FtnAddress::parse("1:153/149").unwrap();
        assert_ne!(a, b);
        assert!(a.same_system(&b));
    }

    #[test]
    fn network_patterns() {
        let net = NetworkPattern::parse("1:153/*").unwrap();
        assert!(net.matches(&FtnAddress::new(1, 153, 149, 0)));
        assert!(!net.matches(&FtnAddress::new(1, 154, 149, 0)));
        assert!(!net.matches(&FtnAddress::new(2, 153, 149, 0)));

        let zone = NetworkPattern::parse("2:*").unwrap();
        assert!(zone.matches(&FtnAddress::new(2, 5030, 1000, 0)));
        assert!(!zone.matches(&FtnAddress::new(1, 5030, 1000, 0)));

        let node = NetworkPattern::parse("2:5030/1000").unwrap();
        assert!(node.matches(&FtnAddress::new(2, 5030, 1000, 3)));
        assert!(!node.matches(&FtnAddress::new(2, 5030, 1001, 0)));

        assert!(NetworkPattern::parse("*").unwrap().matches(&FtnAddress::new(9, 9, 9, 0)));
    }

    #[test]
    fn address_list_skips_garbage() {
        let list = parse_address_list("1:153/149@fidonet junk 21:1/100.0@fsxnet");
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].domain.as_deref(), Some("fsxnet"));
    }

    #[test]
    fn serde_as_string() {
        let a = FtnAddress::parse("1:153/149@fidonet").unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"1:153/149@fidonet\"");
        let back: FtnAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}
