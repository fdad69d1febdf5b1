//! File transfer bookkeeping for a session: the `M_FILE`/`M_GET` argument
//! line, the file currently being received and the files we offered.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{ProtocolErrorKind, SessionError};

/// `"<name> <size> <unix-time> <offset>"`, the argument of M_FILE and M_GET.
/// Spaces inside the name travel as `\x20`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLine {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub offset: u64,
}

pub(crate) fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            ' ' => out.push_str("\\x20"),
            '\\' => out.push_str("\\x5C"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find("\\x") {
        out.push_str(&rest[..pos]);
        let hex = rest.get(pos + 2..pos + 4);
        match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
            Some(b) => {
                out.push(b as char);
                rest = &rest[pos + 4..];
            }
            None => {
                out.push_str("\\x");
                rest = &rest[pos + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}

impl FileLine {
    pub fn parse(line: &str) -> Result<Self, SessionError> {
        let bad = || SessionError::protocol(ProtocolErrorKind::BadFileLine, format!("bad file line '{}'", line));
        let mut parts = line.split_whitespace();
        let name = parts.next().ok_or_else(bad)?;
        let size = parts.next().and_then(|s| s.parse::<u64>().ok()).ok_or_else(bad)?;
        let mtime = parts.next().and_then(|s| s.parse::<i64>().ok()).ok_or_else(bad)?;
        // binkp/1.0 peers always send the offset; older ones may not.
        let offset = match parts.next() {
            Some(s) => s.parse::<u64>().map_err(|_| bad())?,
            None => 0,
        };
        Ok(Self { name: unescape_name(name), size, mtime, offset })
    }

    pub fn format(&self) -> String {
        format!("{} {} {} {}", escape_name(&self.name), self.size, self.mtime, self.offset)
    }
}

/// First token of an M_GOT / M_SKIP argument, unescaped.
pub fn confirmed_name(args: &str) -> Option<String> {
    args.split_whitespace().next().map(unescape_name)
}

/// Final path component of a confirmation that arrived path-mangled.
pub fn base_name(name: &str) -> &str {
    name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name)
}

pub fn unix_mtime(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
        })
}

/// A file being received into the partial directory.
#[derive(Debug)]
pub struct IncomingFile {
    pub name: String,
    pub declared_size: u64,
    pub timestamp: i64,
    pub offset: u64,
    pub received: u64,
    pub partial_path: PathBuf,
    pub handle: tokio::fs::File,
}

impl IncomingFile {
    pub fn remaining(&self) -> u64 {
        self.declared_size.saturating_sub(self.received)
    }

    pub fn complete(&self) -> bool {
        self.received >= self.declared_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingStatus {
    Queued,
    Sent,
    Confirmed,
    Skipped,
}

/// Where an offered file came from, which decides how confirmation removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingSource {
    /// Claimed from the outbound queue.
    Claimed,
    /// Handed to the session directly (crash delivery temp packet).
    Direct,
}

#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub path: PathBuf,
    pub source: OutgoingSource,
    pub status: OutgoingStatus,
    /// Size announced in the last M_FILE for this file.
    pub size: u64,
}

impl OutgoingFile {
    pub fn new(path: &Path, source: OutgoingSource) -> Self {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        Self { name, path: path.to_path_buf(), source, status: OutgoingStatus::Queued, size: 0 }
    }
}

/// Index of the offered file a confirmation refers to: exact name first, then
/// base name.
pub fn match_outgoing(files: &[OutgoingFile], confirmed: &str) -> Option<usize> {
    let open = |f: &OutgoingFile| matches!(f.status, OutgoingStatus::Sent | OutgoingStatus::Queued);
    files
        .iter()
        .position(|f| open(f) && f.name == confirmed)
        .or_else(|| {
            let base = base_name(confirmed);
            files.iter().position(|f| open(f) && f.name == base)
        })
}

/// Free name for a completed inbound file; collisions get a timestamp suffix
/// that keeps the extension.
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let stamp = chrono::Utc::now().timestamp();
    let mut n = 0u32;
    loop {
        let candidate = if n == 0 {
            dir.join(format!("{}-{}{}", stem, stamp, ext))
        } else {
            dir.join(format!("{}-{}-{}{}", stem, stamp, n, ext))
        };
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_line() {
        let f = FileLine::parse("test.pkt 1024 1700000000 0").unwrap();
        assert_eq!(
            f,
            FileLine { name: "test.pkt".into(), size: 1024, mtime: 1700000000, offset: 0 }
        );
        assert_eq!(f.format(), "test.pkt 1024 1700000000 0");
    }

    #[test]
    fn offset_is_optional() {
        assert_eq!(FileLine::parse("a.pkt 10 5").unwrap().offset, 0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(FileLine::parse("").is_err());
        assert!(FileLine::parse("a.pkt big 5 0").is_err());
        assert!(FileLine::parse("a.pkt 10 5 x").is_err());
    }

    #[test]
    fn names_with_spaces_are_escaped() {
        let f = FileLine { name: "my file.pkt".into(), size: 1, mtime: 2, offset: 0 };
        let line = f.format();
        assert_eq!(line, "my\\x20file.pkt 1 2 0");
        assert_eq!(FileLine::parse(&line).unwrap().name, "my file.pkt");
    }

    #[test]
    fn outgoing_match_prefers_exact_then_base_name() {
        let mut files = vec![
            OutgoingFile::new(Path::new("/q/a.pkt"), OutgoingSource::Claimed),
            OutgoingFile::new(Path::new("/q/b.pkt"), OutgoingSource::Claimed),
        ];
        files[0].status = OutgoingStatus::Sent;
        files[1].status = OutgoingStatus::Sent;
        assert_eq!(match_outgoing(&files, "b.pkt"), Some(1));
        assert_eq!(match_outgoing(&files, "C:\\out\\a.pkt"), Some(0));
        assert_eq!(match_outgoing(&files, "/tmp/x/b.pkt"), Some(1));
        assert_eq!(match_outgoing(&files, "c.pkt"), None);
        files[1].status = OutgoingStatus::Confirmed;
        assert_eq!(match_outgoing(&files, "b.pkt"), None);
    }

    #[test]
    fn unique_destination_keeps_extension() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_destination(dir.path(), "x.pkt");
        assert_eq!(first, dir.path().join("x.pkt"));
        std::fs::write(&first, b"1").unwrap();
        let second = unique_destination(dir.path(), "x.pkt");
        assert_ne!(second, first);
        assert!(second.to_string_lossy().ends_with(".pkt"));
    }
}
