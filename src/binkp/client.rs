//! Outgoing binkp connections.
//!
//! [`BinkpClient::connect`] dials one system and runs a full originating
//! session; [`BinkpClient::poll_all_uplinks`] does that for every enabled
//! uplink in turn, recording a failure per uplink instead of giving up on the
//! batch.

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::error::{ProtocolErrorKind, SessionError};
use super::session::{AuthMethod, Session, SessionSummary};
use crate::config::{Config, Uplink, DEFAULT_BINKP_PORT};
use crate::ftn::FtnAddress;
use crate::metrics;
use crate::sessionlog::{NullSessionLog, SessionLog, SessionRecord};

#[derive(Debug, Clone, Serialize)]
pub struct ConnectResult {
    pub session_id: String,
    pub remote_address: Option<String>,
    pub files_sent: Vec<String>,
    pub files_received: Vec<String>,
    pub auth_method: Option<AuthMethod>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl From<SessionSummary> for ConnectResult {
    fn from(s: SessionSummary) -> Self {
        Self {
            session_id: s.session_id,
            remote_address: s.remote_address,
            files_sent: s.files_sent,
            files_received: s.files_received,
            auth_method: s.auth_method,
            bytes_sent: s.bytes_sent,
            bytes_received: s.bytes_received,
        }
    }
}

/// Outcome of polling one uplink.
#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    pub uplink: String,
    pub success: bool,
    pub result: Option<ConnectResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTest {
    pub host: String,
    pub port: u16,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

fn socket_target(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// TCP connect bounded by `timeout`.
pub async fn open_stream(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, SessionError> {
    let target = socket_target(host, port);
    match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(SessionError::Connect { addr: target, source: e }),
        Err(_) => Err(SessionError::ConnectTimeout(target)),
    }
}

pub struct BinkpClient {
    config: Arc<Config>,
    session_log: Arc<dyn SessionLog>,
}

impl BinkpClient {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config, session_log: Arc::new(NullSessionLog) }
    }

    pub fn with_session_log(mut self, log: Arc<dyn SessionLog>) -> Self {
        self.session_log = log;
        self
    }

    /// Dial `address` and run an originating session. Hostname, port and
    /// password default to the uplink configured for `address`.
    pub async fn connect(
        &self,
        address: &str,
        hostname: Option<&str>,
        port: Option<u16>,
        password: Option<&str>,
    ) -> Result<ConnectResult, SessionError> {
        let addr = FtnAddress::parse(address)
            .map_err(|e| SessionError::protocol(ProtocolErrorKind::BadAddress, e.to_string()))?;
        let uplink = self.config.uplink_by_address(&addr).cloned();
        let hostname = hostname
            .map(str::to_string)
            .or_else(|| uplink.as_ref().map(|u| u.hostname.clone()))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                SessionError::protocol(
                    ProtocolErrorKind::BadAddress,
                    format!("no hostname known for {}", addr),
                )
            })?;
        let port = port
            .or_else(|| uplink.as_ref().map(|u| u.port))
            .unwrap_or(DEFAULT_BINKP_PORT);
        let password = password
            .map(str::to_string)
            .or_else(|| uplink.as_ref().map(|u| u.password.clone()));

        info!("Polling {} at {}:{}", addr, hostname, port);
        let started_at = Utc::now();
        let stream = match open_stream(&hostname, port, self.config.binkp.connect_timeout()).await {
            Ok(s) => s,
            Err(e) => {
                metrics::inc_session(false);
                return Err(e);
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| socket_target(&hostname, port));

        let mut session = Session::originator(stream, self.config.clone(), password, uplink)
            .with_peer(peer);
        let result = session.run().await;
        let summary = session.summary();
        metrics::inc_session(result.is_ok());

        let record = SessionRecord::from_summary(
            &summary,
            started_at,
            result.as_ref().err().map(|e| e.to_string()),
        );
        if let Err(e) = self.session_log.record(&record) {
            warn!("Failed to write session log: {:#}", e);
        }

        result?;
        info!(
            "Session with {} complete: {} sent, {} received",
            addr,
            summary.files_sent.len(),
            summary.files_received.len()
        );
        Ok(summary.into())
    }

    pub async fn poll_uplink(&self, uplink: &Uplink) -> PollReport {
        let outcome = self
            .connect(
                &uplink.address,
                Some(uplink.hostname.as_str()),
                Some(uplink.port),
                Some(uplink.password.as_str()),
            )
            .await;
        match outcome {
            Ok(result) => PollReport {
                uplink: uplink.address.clone(),
                success: true,
                result: Some(result),
                error: None,
            },
            Err(e) => {
                warn!("Poll of {} failed: {}", uplink.address, e);
                PollReport {
                    uplink: uplink.address.clone(),
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Poll every enabled uplink, one after the other.
    pub async fn poll_all_uplinks(&self) -> Vec<PollReport> {
        let uplinks = self.config.enabled_uplinks();
        if uplinks.is_empty() {
            debug!("No enabled uplinks to poll");
        }
        let mut reports = Vec::with_capacity(uplinks.len());
        for uplink in uplinks {
            reports.push(self.poll_uplink(uplink).await);
        }
        let ok = reports.iter().filter(|r| r.success).count();
        info!("Polled {} uplink(s): {} ok, {} failed", reports.len(), ok, reports.len() - ok);
        reports
    }

    /// Bare TCP connect for health checks; no protocol is spoken.
    pub async fn test_connection(host: &str, port: u16, timeout: Duration) -> ConnectionTest {
        let started = Instant::now();
        match open_stream(host, port, timeout).await {
            Ok(stream) => {
                drop(stream);
                ConnectionTest {
                    host: host.to_string(),
                    port,
                    reachable: true,
                    latency_ms: Some(started.elapsed().as_millis() as u64),
                    error: None,
                }
            }
            Err(e) => ConnectionTest {
                host: host.to_string(),
                port,
                reachable: false,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}
