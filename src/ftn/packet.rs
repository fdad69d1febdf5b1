//! FTS-0001 type 2 / 2+ packet handling.
//!
//! The binkp engine only needs the 58 byte packet header (to route outbound
//! packets to the right uplink). The packed-message reader and writer below
//! are a deliberately small codec so inbound packets can be stored and a
//! single netmail can be wrapped for crash delivery.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::address::FtnAddress;

pub const PKT_HEADER_LEN: usize = 58;
const PKT_VERSION: u16 = 2;
const PACKED_MSG_TYPE: u16 = 2;
/// Product code for "no registered product".
const PRODUCT_CODE: u8 = 0xFE;
const CAP_WORD: u16 = 0x0001;

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Routing view of a packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PktHeader {
    pub orig: FtnAddress,
    pub dest: FtnAddress,
    pub password: String,
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

impl PktHeader {
    /// Parse the first 58 bytes of a packet.
    ///
    /// Zones come from the FSC-0039 extension (offset 34/36) with the type 2+
    /// copies (46/48) as a fallback; a zone that is still zero defaults to 1.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < PKT_HEADER_LEN {
            return Err(anyhow!("packet header truncated ({} bytes)", buf.len()));
        }
        let version = le16(buf, 18);
        if version != PKT_VERSION {
            return Err(anyhow!("unsupported packet version {}", version));
        }
        let zone_of = |primary: usize, secondary: usize| -> u16 {
            match le16(buf, primary) {
                0 => match le16(buf, secondary) {
                    0 => 1,
                    z => z,
                },
                z => z,
            }
        };
        let cap_valid = le16(buf, 40);
        let cap_word = le16(buf, 44);
        let type2plus = cap_word & 0x0001 != 0 && cap_valid == cap_word.swap_bytes();
        let (orig_point, dest_point) = if type2plus {
            (le16(buf, 50), le16(buf, 52))
        } else {
            (0, 0)
        };
        let password = buf[26..34]
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect();
        Ok(Self {
            orig: FtnAddress::new(zone_of(34, 46), le16(buf, 20), le16(buf, 0), orig_point),
            dest: FtnAddress::new(zone_of(36, 48), le16(buf, 22), le16(buf, 2), dest_point),
            password,
        })
    }

    /// Read and parse only the header of the packet at `path`.
    pub fn read_from(path: &Path) -> Result<Self> {
        use std::io::Read;
        let mut f = std::fs::File::open(path)
            .with_context(|| format!("open packet {}", path.display()))?;
        let mut buf = [0u8; PKT_HEADER_LEN];
        f.read_exact(&mut buf)
            .with_context(|| format!("read packet header {}", path.display()))?;
        Self::parse(&buf)
    }

    pub fn encode(&self, created: DateTime<Utc>) -> [u8; PKT_HEADER_LEN] {
        let mut h = [0u8; PKT_HEADER_LEN];
        let mut put = |off: usize, v: u16| h[off..off + 2].copy_from_slice(&v.to_le_bytes());
        put(0, self.orig.node);
        put(2, self.dest.node);
        put(4, created.year() as u16);
        put(6, created.month0() as u16);
        put(8, created.day() as u16);
        put(10, created.hour() as u16);
        put(12, created.minute() as u16);
        put(14, created.second() as u16);
        put(18, PKT_VERSION);
        put(20, self.orig.net);
        put(22, self.dest.net);
        put(34, self.orig.zone);
        put(36, self.dest.zone);
        put(40, CAP_WORD.swap_bytes());
        put(44, CAP_WORD);
        put(46, self.orig.zone);
        put(48, self.dest.zone);
        put(50, self.orig.point);
        put(52, self.dest.point);
        h[24] = PRODUCT_CODE;
        for (i, b) in self.password.bytes().take(8).enumerate() {
            h[26 + i] = b;
        }
        h
    }
}

/// A netmail or echomail message as carried inside a packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtnMessage {
    pub from_name: String,
    pub to_name: String,
    pub subject: String,
    pub body: String,
    pub orig: FtnAddress,
    pub dest: FtnAddress,
    /// FTS-0001 "DD Mon YY  HH:MM:SS" date field.
    pub date_written: String,
    #[serde(default)]
    pub attributes: u16,
    /// Echo area tag; `None` for netmail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
}

impl FtnMessage {
    pub fn netmail(
        orig: FtnAddress,
        dest: FtnAddress,
        from_name: &str,
        to_name: &str,
        subject: &str,
        body: &str,
    ) -> Self {
        Self {
            from_name: from_name.to_string(),
            to_name: to_name.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            orig,
            dest,
            date_written: fts_date(Utc::now()),
            attributes: ATTR_PRIVATE,
            area: None,
        }
    }
}

pub const ATTR_PRIVATE: u16 = 0x0001;
pub const ATTR_CRASH: u16 = 0x0002;

pub fn fts_date(t: DateTime<Utc>) -> String {
    format!(
        "{:02} {} {:02}  {:02}:{:02}:{:02}",
        t.day(),
        MONTHS[t.month0() as usize],
        t.year() % 100,
        t.hour(),
        t.minute(),
        t.second()
    )
}

fn put_cstr(out: &mut Vec<u8>, s: &str, max: usize) {
    out.extend(s.bytes().filter(|b| *b != 0).take(max));
    out.push(0);
}

fn encode_body(msg: &FtnMessage) -> Vec<u8> {
    let mut text = String::new();
    if let Some(area) = &msg.area {
        text.push_str(&format!("AREA:{}\r", area));
    } else {
        let (d, o) = (&msg.dest, &msg.orig);
        text.push_str(&format!(
            "\u{1}INTL {}:{}/{} {}:{}/{}\r",
            d.zone, d.net, d.node, o.zone, o.net, o.node
        ));
        if msg.orig.point != 0 {
            text.push_str(&format!("\u{1}FMPT {}\r", msg.orig.point));
        }
        if msg.dest.point != 0 {
            text.push_str(&format!("\u{1}TOPT {}\r", msg.dest.point));
        }
    }
    text.push_str(&msg.body.replace("\r\n", "\r").replace('\n', "\r"));
    text.into_bytes()
}

/// Serialise messages into a complete packet image.
pub fn encode_packet(header: &PktHeader, messages: &[FtnMessage], created: DateTime<Utc>) -> Vec<u8> {
    let mut out = Vec::with_capacity(PKT_HEADER_LEN + messages.len() * 256);
    out.extend_from_slice(&header.encode(created));
    for m in messages {
        for v in [
            PACKED_MSG_TYPE,
            m.orig.node,
            m.dest.node,
            m.orig.net,
            m.dest.net,
            m.attributes,
            0,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        let mut date = [0u8; 20];
        for (i, b) in m.date_written.bytes().take(19).enumerate() {
            date[i] = b;
        }
        out.extend_from_slice(&date);
        put_cstr(&mut out, &m.to_name, 35);
        put_cstr(&mut out, &m.from_name, 35);
        put_cstr(&mut out, &m.subject, 71);
        let body = encode_body(m);
        out.extend(body.into_iter().filter(|b| *b != 0));
        out.push(0);
    }
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u16(&mut self) -> Result<u16> {
        if self.pos + 2 > self.buf.len() {
            return Err(anyhow!("packet truncated at offset {}", self.pos));
        }
        let v = le16(self.buf, self.pos);
        self.pos += 2;
        Ok(v)
    }

    fn fixed(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(anyhow!("packet truncated at offset {}", self.pos));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn cstr(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| anyhow!("unterminated string at offset {}", self.pos))?;
        self.pos += end + 1;
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }
}

/// Split kludges out of a raw message text, returning (area, intl, points, body).
fn decode_body(raw: &str) -> (Option<String>, Option<(FtnAddress, FtnAddress)>, (u16, u16), String) {
    let mut area = None;
    let mut intl = None;
    let mut fmpt = 0;
    let mut topt = 0;
    let mut lines = Vec::new();
    for (i, line) in raw.split('\r').enumerate() {
        if i == 0 {
            if let Some(tag) = line.strip_prefix("AREA:") {
                area = Some(tag.trim().to_string());
                continue;
            }
        }
        if let Some(k) = line.strip_prefix('\u{1}') {
            if let Some(v) = k.strip_prefix("INTL ") {
                let mut it = v.split_whitespace();
                if let (Some(d), Some(o)) = (it.next(), it.next()) {
                    if let (Ok(d), Ok(o)) = (FtnAddress::parse(d), FtnAddress::parse(o)) {
                        intl = Some((d, o));
                        continue;
                    }
                }
            } else if let Some(v) = k.strip_prefix("FMPT ") {
                fmpt = v.trim().parse().unwrap_or(0);
                continue;
            } else if let Some(v) = k.strip_prefix("TOPT ") {
                topt = v.trim().parse().unwrap_or(0);
                continue;
            }
        }
        lines.push(line);
    }
    (area, intl, (fmpt, topt), lines.join("\n"))
}

/// Parse a packet image into its header and messages.
pub fn decode_packet(buf: &[u8]) -> Result<(PktHeader, Vec<FtnMessage>)> {
    let header = PktHeader::parse(buf)?;
    let mut cur = Cursor { buf, pos: PKT_HEADER_LEN };
    let mut messages = Vec::new();
    loop {
        let kind = match cur.u16() {
            Ok(k) => k,
            // Some tossers omit the terminating zero word.
            Err(_) if cur.pos >= buf.len() => break,
            Err(e) => return Err(e),
        };
        if kind == 0 {
            break;
        }
        if kind != PACKED_MSG_TYPE {
            return Err(anyhow!("bad packed message type {} at offset {}", kind, cur.pos - 2));
        }
        let orig_node = cur.u16()?;
        let dest_node = cur.u16()?;
        let orig_net = cur.u16()?;
        let dest_net = cur.u16()?;
        let attributes = cur.u16()?;
        let _cost = cur.u16()?;
        let date_raw = cur.fixed(20)?;
        let date_written = String::from_utf8_lossy(
            &date_raw[..date_raw.iter().position(|b| *b == 0).unwrap_or(20)],
        )
        .into_owned();
        let to_name = cur.cstr()?;
        let from_name = cur.cstr()?;
        let subject = cur.cstr()?;
        let text = cur.cstr()?;
        let (area, intl, (fmpt, topt), body) = decode_body(&text);
        let (mut orig, mut dest) = match intl {
            Some((d, o)) => (o, d),
            None => (
                FtnAddress::new(header.orig.zone, orig_net, orig_node, 0),
                FtnAddress::new(header.dest.zone, dest_net, dest_node, 0),
            ),
        };
        orig.point = fmpt;
        dest.point = topt;
        messages.push(FtnMessage {
            from_name,
            to_name,
            subject,
            body,
            orig,
            dest,
            date_written,
            attributes,
            area,
        });
    }
    Ok((header, messages))
}

/// The packet codec boundary consumed by the inbound queue and crash delivery.
pub trait PacketStore: Send + Sync {
    /// Decode every message in a packet file.
    fn parse(&self, path: &Path) -> Result<Vec<FtnMessage>>;
    /// Write `messages` into a packet addressed to `dest`. When `path` is
    /// `None` a fresh name in the store's default directory is chosen.
    fn write(&self, messages: &[FtnMessage], dest: &FtnAddress, path: Option<&Path>) -> Result<PathBuf>;
    /// Hand decoded messages to persistent storage; returns how many were kept.
    fn store(&self, messages: &[FtnMessage]) -> Result<usize>;
}

/// Packet store backed by the on-disk [`crate::storage::MessageStore`].
pub struct FtsPacketStore {
    origin: FtnAddress,
    default_dir: PathBuf,
    messages: crate::storage::MessageStore,
}

impl FtsPacketStore {
    pub fn new(origin: FtnAddress, default_dir: impl Into<PathBuf>, messages: crate::storage::MessageStore) -> Self {
        Self { origin, default_dir: default_dir.into(), messages }
    }

    /// binkd-style 8 hex digit name derived from the clock, bumped until free.
    fn fresh_name(&self) -> PathBuf {
        let mut stamp = (Utc::now().timestamp_millis() as u64 & 0xFFFF_FFFF) as u32;
        loop {
            let candidate = self.default_dir.join(format!("{:08x}.pkt", stamp));
            if !candidate.exists() {
                return candidate;
            }
            stamp = stamp.wrapping_add(1);
        }
    }
}

impl PacketStore for FtsPacketStore {
    fn parse(&self, path: &Path) -> Result<Vec<FtnMessage>> {
        let buf = std::fs::read(path).with_context(|| format!("read packet {}", path.display()))?;
        let (_, messages) = decode_packet(&buf)?;
        Ok(messages)
    }

    fn write(&self, messages: &[FtnMessage], dest: &FtnAddress, path: Option<&Path>) -> Result<PathBuf> {
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => {
                std::fs::create_dir_all(&self.default_dir)?;
                self.fresh_name()
            }
        };
        let header = PktHeader {
            orig: self.origin.without_domain(),
            dest: dest.without_domain(),
            password: String::new(),
        };
        let image = encode_packet(&header, messages, Utc::now());
        // Write under a dot-name first so directory scans never see a half packet.
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let base = target.file_name().and_then(|s| s.to_str()).unwrap_or("out.pkt");
        let tmp = dir.join(format!(".{}.tmp-{}", base, std::process::id()));
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&image)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &target)?;
        Ok(target)
    }

    fn store(&self, messages: &[FtnMessage]) -> Result<usize> {
        let ids = self.messages.import(messages)?;
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn addr(s: &str) -> FtnAddress {
        FtnAddress::parse(s).unwrap()
    }

    #[test]
    fn header_roundtrip_keeps_zone_and_points() {
        let h = PktHeader {
            orig: addr("1:153/150.2"),
            dest: addr("2:5030/1000"),
            password: "secret".into(),
        };
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let parsed = PktHeader::parse(&h.encode(t)).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn missing_zone_defaults_to_one() {
        let mut raw = [0u8; PKT_HEADER_LEN];
        raw[18] = 2;
        raw[2..4].copy_from_slice(&149u16.to_le_bytes());
        raw[22..24].copy_from_slice(&153u16.to_le_bytes());
        let h = PktHeader::parse(&raw).unwrap();
        assert_eq!(h.dest, addr("1:153/149"));
    }

    #[test]
    fn rejects_short_or_foreign_headers() {
        assert!(PktHeader::parse(&[0u8; 20]).is_err());
        let raw = [0u8; PKT_HEADER_LEN];
        assert!(PktHeader::parse(&raw).is_err(), "version 0 is not a type 2 packet");
    }

    #[test]
    fn netmail_survives_packet_encoding() {
        let msg = FtnMessage::netmail(
            addr("1:153/150.1"),
            addr("2:5030/1000"),
            "Sysop",
            "Bob",
            "Hello",
            "line one\nline two",
        );
        let header = PktHeader { orig: addr("1:153/150"), dest: addr("2:5030/1000"), password: String::new() };
        let image = encode_packet(&header, &[msg.clone()], Utc::now());
        let (h, msgs) = decode_packet(&image).unwrap();
        assert_eq!(h.dest, addr("2:5030/1000"));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0], msg);
    }

    #[test]
    fn echomail_area_is_extracted() {
        let mut msg = FtnMessage::netmail(addr("1:153/150"), addr("1:153/149"), "a", "All", "s", "body");
        msg.area = Some("FIDOTEST".into());
        msg.attributes = 0;
        let header = PktHeader { orig: addr("1:153/150"), dest: addr("1:153/149"), password: String::new() };
        let (_, msgs) = decode_packet(&encode_packet(&header, &[msg], Utc::now())).unwrap();
        assert_eq!(msgs[0].area.as_deref(), Some("FIDOTEST"));
        assert_eq!(msgs[0].body, "body");
    }

    #[test]
    fn fts_date_format() {
        let t = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        assert_eq!(fts_date(t), "14 Nov 23  22:13:20");
    }
}
