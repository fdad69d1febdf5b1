//! # binkp Session State Machine
//!
//! One [`Session`] drives one TCP connection, as the calling side
//! ([`Role::Originator`]) or the listening side ([`Role::Answerer`]).
//!
//! ```text
//! Init → AddrSent → AddrReceived → PwdSent → Authenticated → FileTransfer
//!                                                              │
//!                                            EobSent / EobReceived → Terminated
//! ```
//!
//! Both roles open with `M_NUL` system lines and `M_ADR`. The originator sends
//! its password once the remote address is known. The answerer sends its own
//! only after the caller's password checked out, then replies `M_OK`.
//! During transfer the originator sends its batch first, waits for `M_GOT`s
//! and then sends `M_EOB`. The answerer receives until the originator's
//! `M_EOB`, sends its own batch for an authenticated uplink and closes with
//! `M_EOB`. A session terminates only after it has both sent and received
//! `M_EOB`.
//!
//! Whatever happens, [`Session::run`] and [`Session::deliver_single`] clean
//! up: a partially received file is deleted, unconfirmed outbound packets go
//! back to the queue and the stream is shut down.

use bytes::Bytes;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use super::error::{ProtocolErrorKind, SessionError};
use super::frame::{write_frame, Command, Frame, FrameReader, DATA_BLOCK_SIZE};
use super::transfer::{
    confirmed_name, escape_name, match_outgoing, unique_destination, unix_mtime, FileLine,
    IncomingFile, OutgoingFile, OutgoingSource, OutgoingStatus,
};
use crate::config::{Config, Uplink};
use crate::ftn::{parse_address_list, FtnAddress};
use crate::logutil::{escape_bytes, escape_log};
use crate::metrics;
use crate::queue::{OutboundClaim, OutboundQueue};
use crate::validation::sanitize_inbound_filename;

macro_rules! sec_log {
    ($($arg:tt)*) => {
        log::warn!(target: "security", $($arg)*);
    };
}

/// Longest single read while polling against a deadline.
const POLL_SLICE: Duration = Duration::from_secs(1);
const MAX_EXTRA_NUL_LINES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Originator,
    Answerer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Originator => write!(f, "originator"),
            Role::Answerer => write!(f, "answerer"),
        }
    }
}

/// Declared in protocol order; a session only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    AddrSent,
    AddrReceived,
    PwdSent,
    Authenticated,
    FileTransfer,
    EobSent,
    EobReceived,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Both sides share a configured password.
    Password,
    /// No password configured for the remote; nothing is sent to it.
    #[serde(rename = "none")]
    Unsecured,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Password => "password",
            AuthMethod::Unsecured => "none",
        }
    }
}

/// What the remote told us about itself in `M_NUL` lines.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteInfo {
    pub system: Option<String>,
    pub sysop: Option<String>,
    pub location: Option<String>,
    pub version: Option<String>,
    pub extra: Vec<String>,
}

impl RemoteInfo {
    fn record(&mut self, line: &str) {
        let line = escape_log(line);
        let (key, value) = match line.split_once(' ') {
            Some((k, v)) => (k, v.trim().to_string()),
            None => (line.as_str(), String::new()),
        };
        match key {
            "SYS" => self.system = Some(value),
            "ZYZ" => self.sysop = Some(value),
            "LOC" => self.location = Some(value),
            "VER" => self.version = Some(value),
            _ if self.extra.len() < MAX_EXTRA_NUL_LINES => self.extra.push(line.clone()),
            _ => {}
        }
    }
}

/// Where the files this session offers come from.
#[derive(Debug)]
pub enum SendPlan {
    /// Claim whatever the outbound queue routes to the session's uplink.
    Outbound(OutboundQueue),
    /// Exactly these files (crash delivery).
    Files(Vec<PathBuf>),
    Nothing,
}

/// Result of a finished session, for callers and the session log.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub role: Role,
    pub peer: String,
    pub remote_address: Option<String>,
    pub authenticated: bool,
    pub auth_method: Option<AuthMethod>,
    pub files_sent: Vec<String>,
    pub files_received: Vec<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub remote_info: RemoteInfo,
}

fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Compare without an early exit so the time taken does not leak the prefix length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

pub struct Session<S> {
    id: String,
    role: Role,
    state: SessionState,
    config: Arc<Config>,
    stream: S,
    reader: FrameReader,
    peer: String,
    local_addresses: Vec<FtnAddress>,
    remote_address: Option<FtnAddress>,
    /// Injected by the client; otherwise looked up per remote address.
    password: Option<String>,
    current_uplink: Option<Uplink>,
    auth: Option<AuthMethod>,
    authenticated: bool,
    remote_info: RemoteInfo,
    inbound_dir: PathBuf,
    send_plan: SendPlan,
    claim: Option<OutboundClaim>,
    outgoing: Vec<OutgoingFile>,
    current_file: Option<IncomingFile>,
    files_sent: Vec<String>,
    files_received: Vec<String>,
    bytes_sent: u64,
    bytes_received: u64,
    eob_sent: bool,
    eob_received: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(stream: S, config: Arc<Config>, role: Role) -> Self {
        let outbound = OutboundQueue::new(config.outbound_dir());
        Self {
            id: new_session_id(),
            role,
            state: SessionState::Init,
            local_addresses: config.local_addresses(),
            inbound_dir: config.inbound_dir(),
            reader: FrameReader::new().with_stall_timeout(config.binkp.read_timeout()),
            config,
            stream,
            peer: "unknown".to_string(),
            remote_address: None,
            password: None,
            current_uplink: None,
            auth: None,
            authenticated: false,
            remote_info: RemoteInfo::default(),
            send_plan: SendPlan::Outbound(outbound),
            claim: None,
            outgoing: Vec::new(),
            current_file: None,
            files_sent: Vec::new(),
            files_received: Vec::new(),
            bytes_sent: 0,
            bytes_received: 0,
            eob_sent: false,
            eob_received: false,
        }
    }

    /// Calling side. `uplink` scopes which outbound packets may be sent.
    pub fn originator(
        stream: S,
        config: Arc<Config>,
        password: Option<String>,
        uplink: Option<Uplink>,
    ) -> Self {
        let mut session = Self::new(stream, config, Role::Originator);
        session.password = password.filter(|p| !p.is_empty());
        session.current_uplink = uplink;
        session
    }

    pub fn answerer(stream: S, config: Arc<Config>) -> Self {
        Self::new(stream, config, Role::Answerer)
    }

    /// Label for log lines, usually the socket address.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn with_send_plan(mut self, plan: SendPlan) -> Self {
        self.send_plan = plan;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_address(&self) -> Option<&FtnAddress> {
        self.remote_address.as_ref()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            role: self.role,
            peer: self.peer.clone(),
            remote_address: self.remote_address.as_ref().map(|a| a.with_domain()),
            authenticated: self.authenticated,
            auth_method: self.auth,
            files_sent: self.files_sent.clone(),
            files_received: self.files_received.clone(),
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            remote_info: self.remote_info.clone(),
        }
    }

    fn remote_label(&self) -> String {
        self.remote_address
            .as_ref()
            .map(|a| a.with_domain())
            .unwrap_or_else(|| self.peer.clone())
    }

    fn advance(&mut self, next: SessionState) {
        if next > self.state {
            debug!("[{}] {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }

    // ---------------------------------------------------------------------
    // Entry points
    // ---------------------------------------------------------------------

    /// Handshake and full transfer, bounded by the configured session timeout.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let limit = self.config.binkp.session_timeout();
        let result = match tokio::time::timeout(limit, self.run_inner()).await {
            Ok(r) => r,
            Err(_) => Err(SessionError::Timeout("session")),
        };
        self.finish(&result).await;
        result
    }

    async fn run_inner(&mut self) -> Result<(), SessionError> {
        self.handshake().await?;
        self.process().await
    }

    /// Crash delivery: handshake, send the session's files, send `M_EOB`, then
    /// wait up to `confirm_wait` for every file to be confirmed and the
    /// remote's `M_EOB`.
    pub async fn deliver_single(&mut self, confirm_wait: Duration) -> Result<(), SessionError> {
        let limit = self.config.binkp.session_timeout();
        let result = match tokio::time::timeout(limit, self.deliver_inner(confirm_wait)).await {
            Ok(r) => r,
            Err(_) => Err(SessionError::Timeout("session")),
        };
        self.finish(&result).await;
        result
    }

    async fn deliver_inner(&mut self, confirm_wait: Duration) -> Result<(), SessionError> {
        self.handshake().await?;
        self.advance(SessionState::FileTransfer);
        if !self.send_batch().await? {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "nothing to deliver",
            )));
        }
        self.send_eob().await?;

        let deadline = Instant::now() + confirm_wait;
        loop {
            let all_confirmed = self
                .outgoing
                .iter()
                .all(|f| f.status == OutgoingStatus::Confirmed);
            if self.state == SessionState::Terminated {
                if all_confirmed {
                    return Ok(());
                }
                return Err(SessionError::protocol(
                    ProtocolErrorKind::UnexpectedCommand,
                    "remote ended the batch without confirming delivery",
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout("delivery confirmation"));
            }
            let wait = POLL_SLICE.min(deadline - now);
            if let Some(frame) = self.reader.read_frame(&mut self.stream, wait, true).await? {
                self.handle_transfer_frame(frame).await?;
            }
        }
    }

    async fn finish(&mut self, result: &Result<(), SessionError>) {
        if let Err(e) = result {
            warn!("[{}] session with {} failed: {}", self.id, self.remote_label(), e);
            if let Some(reason) = e.peer_reason() {
                // The peer may have stopped reading.
                let send = self.send_command(Command::Err, reason);
                let _ = tokio::time::timeout(POLL_SLICE, send).await;
            }
        }
        self.cleanup().await;
    }

    /// Release everything the session holds. Safe to call more than once.
    pub async fn cleanup(&mut self) {
        if let Some(file) = self.current_file.take() {
            discard_partial(&self.id, file).await;
        }
        if let Some(mut claim) = self.claim.take() {
            let returned = claim.release_all();
            if returned > 0 {
                info!(
                    "[{}] {} unconfirmed packet(s) returned to outbound",
                    self.id, returned
                );
            }
        }
        let _ = tokio::time::timeout(POLL_SLICE, self.stream.shutdown()).await;
        self.state = SessionState::Terminated;
    }

    // ---------------------------------------------------------------------
    // Handshake
    // ---------------------------------------------------------------------

    pub async fn handshake(&mut self) -> Result<(), SessionError> {
        self.send_greeting().await?;
        let deadline = Instant::now() + self.config.binkp.handshake_timeout();
        while self.state < SessionState::Authenticated {
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout("handshake"));
            }
            let wait = POLL_SLICE.min(deadline - now);
            if let Some(frame) = self.reader.read_frame(&mut self.stream, wait, true).await? {
                self.handle_handshake_frame(frame).await?;
            }
        }
        info!(
            "[{}] {} session with {} ({}) authenticated ({})",
            self.id,
            self.role,
            self.remote_label(),
            self.peer,
            self.auth.map(|a| a.as_str()).unwrap_or("none")
        );
        Ok(())
    }

    async fn send_greeting(&mut self) -> Result<(), SessionError> {
        let sys = &self.config.system;
        let lines = [
            format!("SYS {}", sys.name),
            format!("ZYZ {}", sys.sysop),
            format!("LOC {}", sys.location),
            format!("VER {}/{} binkp/1.0", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            format!("TIME {}", chrono::Utc::now().to_rfc2822()),
        ];
        for line in lines {
            self.send_command(Command::Nul, line).await?;
        }
        self.send_address().await
    }

    async fn send_address(&mut self) -> Result<(), SessionError> {
        if self.local_addresses.is_empty() {
            return Err(SessionError::protocol(
                ProtocolErrorKind::BadAddress,
                "no local address configured",
            ));
        }
        let list = self
            .local_addresses
            .iter()
            .map(|a| a.with_domain())
            .collect::<Vec<_>>()
            .join(" ");
        self.send_command(Command::Adr, list).await?;
        self.advance(SessionState::AddrSent);
        Ok(())
    }

    fn expected_password(&self) -> Option<String> {
        if let Some(p) = &self.password {
            return Some(p.clone());
        }
        let remote = self.remote_address.as_ref()?;
        self.config.password_for_address(remote).map(str::to_string)
    }

    async fn send_password(&mut self) -> Result<(), SessionError> {
        let password = self.expected_password().unwrap_or_else(|| "-".to_string());
        self.send_command(Command::Pwd, password).await?;
        self.advance(SessionState::PwdSent);
        Ok(())
    }

    fn authenticate(&mut self) {
        self.advance(SessionState::Authenticated);
        self.authenticated = true;
    }

    async fn handle_handshake_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        let text = frame.args_str();
        let command = match frame {
            Frame::Data(data) => {
                debug!("[{}] ignoring {} byte data frame during handshake", self.id, data.len());
                return Ok(());
            }
            Frame::Command { command, .. } => command,
        };
        if command != Command::Pwd {
            debug!("[{}] < {} {}", self.id, command.name(), escape_log(&text));
        }
        match command {
            Command::Nul => self.remote_info.record(&text),
            Command::Adr => self.on_address(&text).await?,
            Command::Pwd => self.on_password(&text).await?,
            Command::Ok if self.role == Role::Originator && self.state >= SessionState::PwdSent => {
                if self.auth.is_none() {
                    let secure = self.expected_password().is_some() && !text.contains("non-secure");
                    self.auth = Some(if secure { AuthMethod::Password } else { AuthMethod::Unsecured });
                }
                self.authenticate();
            }
            Command::Err => {
                return Err(SessionError::Remote { command: "M_ERR", reason: escape_log(&text) })
            }
            Command::Bsy => {
                return Err(SessionError::Remote { command: "M_BSY", reason: escape_log(&text) })
            }
            other => debug!("[{}] ignoring {} during handshake", self.id, other.name()),
        }
        Ok(())
    }

    async fn on_address(&mut self, text: &str) -> Result<(), SessionError> {
        let addresses = parse_address_list(text);
        if self.remote_address.is_some() {
            debug!("[{}] repeated M_ADR ignored", self.id);
            return Ok(());
        }
        let chosen = addresses
            .iter()
            .find(|a| self.config.uplink_by_address(a).is_some())
            .or_else(|| addresses.first())
            .cloned()
            .ok_or_else(|| {
                SessionError::protocol(
                    ProtocolErrorKind::BadAddress,
                    format!("no valid address in M_ADR '{}'", escape_log(text)),
                )
            })?;

        if self.role == Role::Answerer {
            self.current_uplink = self
                .config
                .uplink_by_address(&chosen)
                .filter(|u| u.enabled)
                .cloned();
        }
        debug!("[{}] remote presents {}", self.id, chosen.with_domain());
        self.remote_address = Some(chosen);

        if self.state == SessionState::Init {
            self.send_address().await?;
        }
        // The answerer keeps its password until the caller's has checked out.
        match self.role {
            Role::Originator if self.state == SessionState::AddrSent => self.send_password().await?,
            _ => self.advance(SessionState::AddrReceived),
        }
        Ok(())
    }

    async fn on_password(&mut self, text: &str) -> Result<(), SessionError> {
        let remote = self.remote_address.clone().ok_or_else(|| {
            SessionError::protocol(ProtocolErrorKind::NotAuthenticated, "M_PWD before M_ADR")
        })?;
        let accepted = match self.expected_password() {
            Some(expected) => constant_time_eq(text.as_bytes(), expected.as_bytes())
                .then_some(AuthMethod::Password),
            None => (text.is_empty() || text == "-").then_some(AuthMethod::Unsecured),
        };
        let Some(method) = accepted else {
            sec_log!(
                "binkp password mismatch for {} from {} ({})",
                remote.with_domain(),
                self.peer,
                self.role
            );
            metrics::inc_auth_failure();
            let _ = self.send_command(Command::Err, "Incorrect password").await;
            return Err(SessionError::Auth(format!("incorrect password from {}", remote)));
        };

        if self.state == SessionState::AddrReceived {
            self.send_password().await?;
        }
        self.auth = Some(method);
        if self.role == Role::Answerer {
            let label = match method {
                AuthMethod::Password => "secure",
                AuthMethod::Unsecured => "non-secure",
            };
            self.send_command(Command::Ok, label).await?;
            self.authenticate();
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // File transfer
    // ---------------------------------------------------------------------

    /// Everything after the handshake, up to and including the EOB exchange.
    pub async fn process(&mut self) -> Result<(), SessionError> {
        if self.state < SessionState::Authenticated {
            return Err(SessionError::protocol(
                ProtocolErrorKind::NotAuthenticated,
                "transfer before authentication",
            ));
        }
        self.advance(SessionState::FileTransfer);
        match self.role {
            Role::Originator => {
                let sent_any = self.send_batch().await?;
                if sent_any {
                    self.wait_for_confirmations().await?;
                }
                self.eob_grace(sent_any).await?;
                if !self.eob_sent {
                    self.send_eob().await?;
                }
                self.drain_until_terminated().await
            }
            Role::Answerer => {
                let wait = self.config.binkp.read_timeout();
                while !self.eob_received {
                    if let Some(frame) = self.reader.read_frame(&mut self.stream, wait, false).await? {
                        self.handle_transfer_frame(frame).await?;
                    }
                }
                if self.may_send_files() && self.send_batch().await? {
                    self.wait_for_confirmations().await?;
                }
                if !self.eob_sent {
                    self.send_eob().await?;
                }
                self.drain_until_terminated().await
            }
        }
    }

    /// The answerer only hands mail to uplinks that proved who they are.
    fn may_send_files(&self) -> bool {
        match self.role {
            Role::Originator => true,
            Role::Answerer => {
                self.current_uplink.is_some() && self.auth == Some(AuthMethod::Password)
            }
        }
    }

    fn has_unconfirmed(&self) -> bool {
        self.outgoing.iter().any(|f| f.status == OutgoingStatus::Sent)
    }

    /// Offer every file in the send plan. Returns whether anything went out.
    async fn send_batch(&mut self) -> Result<bool, SessionError> {
        let plan = std::mem::replace(&mut self.send_plan, SendPlan::Nothing);
        let files: Vec<OutgoingFile> = match plan {
            SendPlan::Outbound(queue) => match queue.claim(self.current_uplink.as_ref(), &self.id) {
                Ok(claim) => {
                    let files = claim
                        .files()
                        .iter()
                        .map(|p| OutgoingFile::new(p, OutgoingSource::Claimed))
                        .collect();
                    self.claim = Some(claim);
                    files
                }
                Err(e) => {
                    warn!("[{}] could not claim outbound packets: {:#}", self.id, e);
                    Vec::new()
                }
            },
            SendPlan::Files(paths) => paths
                .iter()
                .map(|p| OutgoingFile::new(p, OutgoingSource::Direct))
                .collect(),
            SendPlan::Nothing => Vec::new(),
        };

        let mut sent_any = false;
        for file in files {
            self.outgoing.push(file);
            let idx = self.outgoing.len() - 1;
            sent_any |= self.send_file(idx, 0).await?;
        }
        Ok(sent_any)
    }

    async fn send_file(&mut self, idx: usize, offset: u64) -> Result<bool, SessionError> {
        let path = self.outgoing[idx].path.clone();
        let name = self.outgoing[idx].name.clone();
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                warn!("[{}] cannot open {}: {}", self.id, path.display(), e);
                self.outgoing[idx].status = OutgoingStatus::Skipped;
                return Ok(false);
            }
        };
        let meta = file.metadata().await?;
        let size = meta.len();
        let offset = offset.min(size);
        let line = FileLine { name: name.clone(), size, mtime: unix_mtime(&meta), offset };
        self.send_command(Command::File, line.format()).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        let mut buf = vec![0u8; DATA_BLOCK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let frame = Frame::data(Bytes::copy_from_slice(&buf[..n]))?;
            write_frame(&mut self.stream, &frame).await?;
            self.bytes_sent += n as u64;
        }

        let entry = &mut self.outgoing[idx];
        entry.status = OutgoingStatus::Sent;
        entry.size = size;
        info!(
            "[{}] Sent {} ({} bytes from offset {}) to {}",
            self.id,
            name,
            size,
            offset,
            self.remote_label()
        );
        Ok(true)
    }

    /// Wait for `M_GOT`s: bounded overall and by inactivity. Files still
    /// unconfirmed afterwards stay claimed and are returned on cleanup.
    async fn wait_for_confirmations(&mut self) -> Result<(), SessionError> {
        let overall = Instant::now() + self.config.binkp.got_wait();
        let idle = self.config.binkp.got_idle();
        let mut last_activity = Instant::now();
        while self.has_unconfirmed() && self.state != SessionState::Terminated {
            let now = Instant::now();
            if now >= overall || now.duration_since(last_activity) >= idle {
                let pending = self
                    .outgoing
                    .iter()
                    .filter(|f| f.status == OutgoingStatus::Sent)
                    .count();
                warn!(
                    "[{}] {} file(s) not confirmed by {}; continuing to EOB",
                    self.id,
                    pending,
                    self.remote_label()
                );
                break;
            }
            let wait = POLL_SLICE.min(overall - now);
            if let Some(frame) = self.reader.read_frame(&mut self.stream, wait, true).await? {
                last_activity = Instant::now();
                self.handle_transfer_frame(frame).await?;
            }
        }
        Ok(())
    }

    /// Short pause before our EOB in case the remote starts sending; a file
    /// that starts arriving is received to the end.
    async fn eob_grace(&mut self, sent_files: bool) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.config.binkp.eob_grace(sent_files);
        let read_timeout = self.config.binkp.read_timeout();
        while self.state != SessionState::Terminated && !self.eob_received {
            let now = Instant::now();
            let receiving = self.current_file.is_some();
            if now >= deadline && !receiving {
                break;
            }
            let wait = if receiving { read_timeout } else { POLL_SLICE.min(deadline - now) };
            match self.reader.read_frame(&mut self.stream, wait, true).await? {
                Some(frame) => self.handle_transfer_frame(frame).await?,
                None if receiving => return Err(SessionError::Timeout("file receive")),
                None => {}
            }
        }
        Ok(())
    }

    async fn drain_until_terminated(&mut self) -> Result<(), SessionError> {
        let wait = self.config.binkp.read_timeout();
        while self.state != SessionState::Terminated {
            if let Some(frame) = self.reader.read_frame(&mut self.stream, wait, false).await? {
                self.handle_transfer_frame(frame).await?;
            }
        }
        Ok(())
    }

    async fn send_eob(&mut self) -> Result<(), SessionError> {
        self.send_command(Command::Eob, Bytes::new()).await?;
        self.eob_sent = true;
        if self.eob_received {
            self.advance(SessionState::Terminated);
        } else {
            self.advance(SessionState::EobSent);
        }
        Ok(())
    }

    async fn on_remote_eob(&mut self) -> Result<(), SessionError> {
        if self.eob_received {
            if !self.eob_sent {
                self.send_eob().await?;
            }
            self.advance(SessionState::Terminated);
            return Ok(());
        }
        self.eob_received = true;
        if self.eob_sent {
            self.advance(SessionState::Terminated);
        } else {
            self.advance(SessionState::EobReceived);
        }
        Ok(())
    }

    async fn handle_transfer_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        let text = frame.args_str();
        let command = match frame {
            Frame::Data(data) => return self.write_data(data).await,
            Frame::Command { command, .. } => command,
        };
        debug!("[{}] < {} {}", self.id, command.name(), escape_log(&text));
        match command {
            Command::File => self.start_receive(&text).await,
            Command::Got => self.on_got(&text).await,
            Command::Skip => {
                self.on_skip(&text);
                Ok(())
            }
            Command::Get => self.on_get(&text).await,
            Command::Eob => self.on_remote_eob().await,
            Command::Nul => {
                self.remote_info.record(&text);
                Ok(())
            }
            Command::Err => Err(SessionError::Remote { command: "M_ERR", reason: escape_log(&text) }),
            Command::Bsy => Err(SessionError::Remote { command: "M_BSY", reason: escape_log(&text) }),
            other => {
                debug!("[{}] ignoring {} during file transfer", self.id, other.name());
                Ok(())
            }
        }
    }

    // Receiving

    async fn start_receive(&mut self, text: &str) -> Result<(), SessionError> {
        if let Some(previous) = self.current_file.take() {
            warn!(
                "[{}] M_FILE while {} was incomplete; dropping it",
                self.id,
                escape_log(&previous.name)
            );
            discard_partial(&self.id, previous).await;
        }
        let line = FileLine::parse(text)?;
        let name = match sanitize_inbound_filename(&line.name) {
            Ok(n) => n,
            Err(e) => {
                sec_log!(
                    "refusing inbound file '{}' from {}: {}",
                    escape_log(&line.name),
                    self.remote_label(),
                    e
                );
                return self.send_skip(&line).await;
            }
        };

        let tmp_dir = self.inbound_dir.join("tmp");
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let partial_path = tmp_dir.join(&name);

        let handle = if line.offset > 0 {
            let existing = match tokio::fs::metadata(&partial_path).await {
                Ok(m) => m.len(),
                Err(_) => 0,
            };
            if existing < line.offset {
                warn!(
                    "[{}] cannot resume {} at {}: only {} bytes held",
                    self.id, name, line.offset, existing
                );
                return self.send_skip(&line).await;
            }
            let mut f = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&partial_path)
                .await?;
            f.set_len(line.offset).await?;
            f.seek(SeekFrom::Start(line.offset)).await?;
            f
        } else {
            tokio::fs::File::create(&partial_path).await?
        };

        info!(
            "[{}] Receiving {} ({} bytes, offset {}) from {}",
            self.id,
            name,
            line.size,
            line.offset,
            self.remote_label()
        );
        self.current_file = Some(IncomingFile {
            name,
            declared_size: line.size,
            timestamp: line.mtime,
            offset: line.offset,
            received: line.offset,
            partial_path,
            handle,
        });
        if line.size <= line.offset {
            self.finish_incoming().await?;
        }
        Ok(())
    }

    async fn send_skip(&mut self, line: &FileLine) -> Result<(), SessionError> {
        let args = format!("{} {} {}", escape_name(&line.name), line.size, line.mtime);
        self.send_command(Command::Skip, args).await
    }

    async fn write_data(&mut self, data: Bytes) -> Result<(), SessionError> {
        let Some(file) = self.current_file.as_mut() else {
            debug!("[{}] data frame with no file open ({} bytes)", self.id, data.len());
            return Ok(());
        };
        let take = (data.len() as u64).min(file.remaining()) as usize;
        if take < data.len() {
            warn!(
                "[{}] {} bytes past the declared size of {} discarded",
                self.id,
                data.len() - take,
                escape_log(&file.name)
            );
        }
        file.handle.write_all(&data[..take]).await?;
        file.received += take as u64;
        self.bytes_received += take as u64;
        if file.complete() {
            self.finish_incoming().await?;
        }
        Ok(())
    }

    async fn finish_incoming(&mut self) -> Result<(), SessionError> {
        let Some(mut file) = self.current_file.take() else {
            return Ok(());
        };
        file.handle.flush().await?;
        file.handle.sync_all().await?;
        let IncomingFile { name, declared_size, timestamp, partial_path, handle, .. } = file;
        drop(handle);

        let dest = unique_destination(&self.inbound_dir, &name);
        tokio::fs::rename(&partial_path, &dest).await?;
        let stored = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&name)
            .to_string();
        info!(
            "[{}] Received {} ({} bytes, stamped {}) from {}",
            self.id,
            stored,
            declared_size,
            timestamp,
            self.remote_label()
        );
        metrics::add_file_received(declared_size);
        self.files_received.push(stored);
        let got = format!(
            "{} {} {}",
            escape_name(&name),
            declared_size,
            chrono::Utc::now().timestamp()
        );
        self.send_command(Command::Got, got).await
    }

    // Sending side replies

    async fn on_got(&mut self, text: &str) -> Result<(), SessionError> {
        let Some(name) = confirmed_name(text) else {
            warn!("[{}] empty M_GOT", self.id);
            return Ok(());
        };
        let Some(idx) = match_outgoing(&self.outgoing, &name) else {
            warn!("[{}] M_GOT for unknown file {}", self.id, escape_log(&name));
            return Ok(());
        };
        let entry = &mut self.outgoing[idx];
        match entry.source {
            OutgoingSource::Claimed => {
                if let Some(claim) = self.claim.as_mut() {
                    if let Err(e) = claim.confirm(&entry.name) {
                        warn!("[{}] {:#}", self.id, e);
                    }
                }
            }
            OutgoingSource::Direct => {
                if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                    warn!("[{}] remove {}: {}", self.id, entry.path.display(), e);
                }
            }
        }
        entry.status = OutgoingStatus::Confirmed;
        let (confirmed, size) = (entry.name.clone(), entry.size);
        metrics::add_file_sent(size);
        info!("[{}] {} confirmed by {}", self.id, confirmed, self.remote_label());
        self.files_sent.push(confirmed);
        Ok(())
    }

    fn on_skip(&mut self, text: &str) {
        let Some(name) = confirmed_name(text) else { return };
        let Some(idx) = match_outgoing(&self.outgoing, &name) else {
            warn!("[{}] M_SKIP for unknown file {}", self.id, escape_log(&name));
            return;
        };
        let entry = &mut self.outgoing[idx];
        if entry.source == OutgoingSource::Claimed {
            if let Some(claim) = self.claim.as_mut() {
                claim.release(&entry.name);
            }
        }
        entry.status = OutgoingStatus::Skipped;
        info!("[{}] {} skipped by remote, kept for later", self.id, entry.name);
    }

    async fn on_get(&mut self, text: &str) -> Result<(), SessionError> {
        let line = FileLine::parse(text)?;
        match match_outgoing(&self.outgoing, &line.name) {
            Some(idx) => {
                info!(
                    "[{}] remote asked for {} from offset {}",
                    self.id,
                    escape_log(&line.name),
                    line.offset
                );
                self.send_file(idx, line.offset).await.map(|_| ())
            }
            None => {
                warn!("[{}] M_GET for unknown file {}", self.id, escape_log(&line.name));
                Ok(())
            }
        }
    }

    async fn send_command(
        &mut self,
        command: Command,
        args: impl Into<Bytes>,
    ) -> Result<(), SessionError> {
        let frame = Frame::command(command, args)?;
        if let Frame::Command { args, .. } = &frame {
            if command == Command::Pwd {
                debug!("[{}] > M_PWD ****", self.id);
            } else {
                debug!("[{}] > {} {}", self.id, command.name(), escape_bytes(args));
            }
        }
        write_frame(&mut self.stream, &frame).await?;
        Ok(())
    }
}

async fn discard_partial(session_id: &str, file: IncomingFile) {
    let IncomingFile { name, declared_size, received, partial_path, handle, .. } = file;
    drop(handle);
    if received >= declared_size {
        return;
    }
    match tokio::fs::remove_file(&partial_path).await {
        Ok(()) => info!(
            "[{}] removed partial {} ({}/{} bytes)",
            session_id,
            escape_log(&name),
            received,
            declared_size
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("[{}] remove partial {}: {}", session_id, partial_path.display(), e),
    }
}
