//! binkp listener.
//!
//! The accept loop hands each connection to its own task running an
//! answering [`Session`]. Finished tasks report a [`SessionOutcome`] back over
//! an mpsc channel; the loop logs it, bumps the counters and writes the
//! session log. Connections over `max_connections` get `M_BSY` and are closed.
//! [`ServerHandle::stop`] ends accepting; sessions already running finish on
//! their own timeouts before [`BinkpServer::run`] returns.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::frame::{write_frame, Command, Frame};
use super::session::{Session, SessionSummary};
use crate::config::Config;
use crate::metrics;
use crate::queue::OutboundQueue;
use crate::sessionlog::{NullSessionLog, SessionLog, SessionRecord};

const BUSY_MESSAGE: &str = "Too many connections, try again later";

/// Report sent by a finished connection task.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub summary: SessionSummary,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Cloneable control surface for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    stop_tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl ServerHandle {
    /// Stop accepting connections.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Decrements the live connection count when a session task ends, even by panic.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct BinkpServer {
    config: Arc<Config>,
    session_log: Arc<dyn SessionLog>,
    handle: ServerHandle,
    listener: Option<TcpListener>,
}

impl BinkpServer {
    pub fn new(config: Arc<Config>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            session_log: Arc::new(NullSessionLog),
            handle: ServerHandle {
                stop_tx: Arc::new(stop_tx),
                active: Arc::new(AtomicUsize::new(0)),
            },
            listener: None,
        }
    }

    pub fn with_session_log(mut self, log: Arc<dyn SessionLog>) -> Self {
        self.session_log = log;
        self
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Bind the listener and return packets stranded by a previous crash.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let outbound = OutboundQueue::new(self.config.outbound_dir());
        if let Err(e) = outbound.recover_stale_claims() {
            warn!("Could not recover stale outbound claims: {:#}", e);
        }
        let bind = format!("{}:{}", self.config.binkp.bind_address, self.config.binkp.port);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("bind binkp listener on {}", bind))?;
        let addr = listener.local_addr()?;
        info!("binkp server listening on {}", addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Accept until stopped, then wait for in-flight sessions to report.
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.start().await?;
        }
        let listener = self
            .listener
            .take()
            .context("binkp listener not bound")?;
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionOutcome>();
        let mut stop_rx = self.handle.stop_tx.subscribe();

        while !*stop_rx.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer, tx.clone()),
                    Err(e) => warn!("binkp accept error: {}", e),
                },
                Some(outcome) = rx.recv() => self.record(outcome),
                _ = stop_rx.changed() => {}
            }
        }

        drop(listener);
        drop(tx);
        let in_flight = self.connection_count();
        if in_flight > 0 {
            info!("binkp server stopping; waiting for {} session(s)", in_flight);
        }
        while let Some(outcome) = rx.recv().await {
            self.record(outcome);
        }
        info!("binkp server stopped");
        Ok(())
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr, tx: mpsc::UnboundedSender<SessionOutcome>) {
        let max = self.config.binkp.max_connections;
        let active = self.handle.active.clone();
        let current = active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(active);
        if current >= max {
            drop(guard);
            metrics::inc_busy_rejection();
            warn!("Rejecting {}: {} of {} connections in use", peer, current, max);
            tokio::spawn(reject_busy(stream));
            return;
        }

        debug!("Accepted binkp connection from {} ({} active)", peer, current + 1);
        let config = self.config.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let started_at = Utc::now();
            let _ = stream.set_nodelay(true);
            let mut session = Session::answerer(stream, config).with_peer(peer.to_string());
            let result = session.run().await;
            let outcome = SessionOutcome {
                summary: session.summary(),
                started_at,
                error: result.err().map(|e| e.to_string()),
            };
            let _ = tx.send(outcome);
        });
    }

    fn record(&self, outcome: SessionOutcome) {
        let s = &outcome.summary;
        let remote = s.remote_address.as_deref().unwrap_or("unknown");
        match &outcome.error {
            None => info!(
                "[{}] session with {} ({}) done: {} received, {} sent",
                s.session_id,
                remote,
                s.peer,
                s.files_received.len(),
                s.files_sent.len()
            ),
            Some(e) => warn!("[{}] session with {} ({}) failed: {}", s.session_id, remote, s.peer, e),
        }
        metrics::inc_session(outcome.error.is_none());
        let record = SessionRecord::from_summary(s, outcome.started_at, outcome.error.clone());
        if let Err(e) = self.session_log.record(&record) {
            warn!("Failed to write session log: {:#}", e);
        }
    }
}

async fn reject_busy(mut stream: TcpStream) {
    if let Ok(frame) = Frame::command(Command::Bsy, BUSY_MESSAGE) {
        let _ = write_frame(&mut stream, &frame).await;
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binkp::frame::FrameReader;
    use crate::testutil::{node_config, shared};
    use std::time::Duration;

    fn server_config(dir: &std::path::Path, max_connections: usize) -> Arc<Config> {
        let mut cfg = node_config(dir, "1:153/149", vec![]);
        cfg.binkp.bind_address = "127.0.0.1".into();
        cfg.binkp.port = 0;
        cfg.binkp.max_connections = max_connections;
        shared(cfg)
    }

    #[tokio::test]
    async fn over_capacity_gets_busy() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = BinkpServer::new(server_config(dir.path(), 0));
        let addr = server.start().await.unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move { server.run().await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = FrameReader::new();
        let frame = reader
            .read_frame(&mut stream, Duration::from_secs(2), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::command(Command::Bsy, BUSY_MESSAGE).unwrap());
        assert_eq!(handle.connection_count(), 0);

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn answers_with_greeting_and_counts_connections() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = BinkpServer::new(server_config(dir.path(), 4));
        let addr = server.start().await.unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move { server.run().await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = FrameReader::new();
        let first = reader
            .read_frame(&mut stream, Duration::from_secs(2), false)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, Frame::Command { command: Command::Nul, .. }));
        assert!(first.args_str().starts_with("SYS "));
        assert_eq!(handle.connection_count(), 1);

        drop(stream);
        for _ in 0..50 {
            if handle.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.connection_count(), 0);
        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_before_any_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = BinkpServer::new(server_config(dir.path(), 4));
        server.start().await.unwrap();
        server.stop();
        tokio::time::timeout(Duration::from_secs(2), server.run())
            .await
            .unwrap()
            .unwrap();
    }
}
