//! # ftnbbs - FidoNet Technology Backend for a BBS
//!
//! ftnbbs moves FidoNet mail for a BBS: it speaks binkp to uplinks and
//! other nodes, keeps packet queues on disk, and delivers crash netmail
//! directly to the destination node.
//!
//! ## Features
//!
//! - **binkp mailer**: Originating and answering sessions over TCP with password
//!   or unsecured authentication, resume via `M_FILE` offsets and `M_GET`, and
//!   delete-on-`M_GOT` outbound semantics.
//! - **Concurrent listener**: One task per connection with a connection cap
//!   answered by `M_BSY`.
//! - **Packet queues**: Outbound packets are claimed per session by atomic rename;
//!   inbound packets are received into `tmp/` and ingested with failures parked in
//!   `error/`.
//! - **Crash delivery**: Persisted retry queue routed from nodelist flags.
//! - **Audit**: JSON-lines session log and process-wide counters.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ftnbbs::config::Config;
//! use ftnbbs::binkp::BinkpClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::load("config.toml").await?);
//!     let client = BinkpClient::new(config);
//!     for report in client.poll_all_uplinks().await {
//!         println!("{}: {}", report.uplink, if report.success { "ok" } else { "failed" });
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`binkp`] - Frame codec, session state machine, client and server
//! - [`queue`] - Outbound and inbound packet directories
//! - [`crashmail`] - Direct delivery of crash netmail with retries
//! - [`ftn`] - Addresses, packet headers and the packet store boundary
//! - [`storage`] - Netmail persistence and locked atomic file writes
//! - [`nodelist`] - Node connection flags for crash routing
//! - [`sessionlog`] - Session audit log
//! - [`config`] - Configuration management and validation
//! - [`validation`] - Filename sanitization for received files
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ BinkpServer  │   │ BinkpClient  │   │ CrashDelivery│
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        └────────────┬─────┴──────────────────┘
//!              ┌──────▼───────┐
//!              │   Session    │ ← binkp state machine over FrameReader
//!              └──────┬───────┘
//!        ┌────────────┴────────────┐
//! ┌──────▼───────┐          ┌──────▼───────┐
//! │OutboundQueue │          │ inbound dir  │──▶ InboundQueue ──▶ PacketStore
//! └──────────────┘          └──────────────┘
//! ```

pub mod binkp;
pub mod config;
pub mod crashmail;
pub mod ftn;
pub mod logutil;
pub mod metrics;
pub mod nodelist;
pub mod queue;
pub mod sessionlog;
pub mod storage;
pub mod validation;

#[cfg(test)]
mod testutil;
