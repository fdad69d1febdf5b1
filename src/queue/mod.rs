//! Filesystem packet queues feeding and draining the binkp engine.
//!
//! - [`outbound`] - packets waiting to be sent, claimed per session
//! - [`inbound`] - received packets waiting for the packet store

pub mod inbound;
pub mod outbound;

pub use inbound::{ErrorFile, InboundFailure, InboundQueue, InboundReport};
pub use outbound::{OutboundClaim, OutboundQueue};
