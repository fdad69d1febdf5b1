//! # binkp Mailer
//!
//! The binkp (FTS-1026) engine: frame codec, the per-connection session state
//! machine and the two ways a session gets a socket.
//!
//! - [`frame`] - 2 byte header framing and the async [`frame::FrameReader`]
//! - [`session`] - handshake, authentication, file transfer, EOB exchange
//! - [`client`] - outgoing polls to configured uplinks
//! - [`server`] - listener spawning one answering session per connection
//! - [`transfer`] - bookkeeping for files in flight
//!
//! ```text
//! OutboundQueue → Client → Session(Originator) → peer
//! peer → Session(Answerer) → Server → InboundQueue → PacketStore
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod server;
pub mod session;
pub mod transfer;

pub use client::{BinkpClient, ConnectResult, PollReport};
pub use error::{ProtocolErrorKind, SessionError};
pub use frame::{Command, Frame, FrameError, FrameReader};
pub use server::{BinkpServer, SessionOutcome};
pub use session::{AuthMethod, Role, SendPlan, Session, SessionState, SessionSummary};
