use super::frame::FrameError;

/// What kind of protocol violation ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    UnexpectedCommand,
    BadAddress,
    BadFileLine,
    OversizeFrame,
    NotAuthenticated,
}

/// Errors that end a binkp session. Transport problems, protocol violations,
/// authentication failures and peer-reported errors are kept apart so the
/// caller can decide what to log and whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("protocol error ({kind:?}): {detail}")]
    Protocol {
        kind: ProtocolErrorKind,
        detail: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("remote sent {command}: {reason}")]
    Remote {
        command: &'static str,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl SessionError {
    pub fn protocol(kind: ProtocolErrorKind, detail: impl Into<String>) -> Self {
        SessionError::Protocol { kind, detail: detail.into() }
    }

    /// Transport-level failures: worth retrying on the next poll.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::Connect { .. }
                | SessionError::ConnectTimeout(_)
                | SessionError::Io(_)
                | SessionError::Timeout(_)
                | SessionError::Frame(FrameError::Timeout)
                | SessionError::Frame(FrameError::ConnectionClosed)
                | SessionError::Frame(FrameError::Io(_))
        )
    }

    /// Text worth reporting to the peer in an `M_ERR` before hanging up.
    pub(crate) fn peer_reason(&self) -> Option<String> {
        match self {
            SessionError::Protocol { detail, .. } => Some(detail.clone()),
            SessionError::Frame(FrameError::Oversize(_)) | SessionError::Frame(FrameError::EmptyCommand) => {
                Some("malformed frame".to_string())
            }
            SessionError::Timeout(what) => Some(format!("{} timeout", what)),
            SessionError::Frame(FrameError::Timeout) => Some("timeout".to_string()),
            _ => None,
        }
    }
}
