use std::time::Duration;
use thiserror::Error;

/// Errors produced by the tunnel layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("protocol already in use: {0}")]
    ProtocolInUse(String),

    #[error("listener not found: {0}")]
    ListenerNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(u64),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("stream open failed: {0}")]
    StreamOpen(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether this error is raised while constructing a listener, as opposed
    /// to while establishing or running a single tunnelled connection.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            TunnelError::InvalidAddress(_)
                | TunnelError::UnsupportedTransport(_)
                | TunnelError::ProtocolInUse(_)
                | TunnelError::Io(_)
        )
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_class() {
        assert!(TunnelError::UnsupportedTransport("udp".into()).is_construction());
        assert!(TunnelError::InvalidAddress("x".into()).is_construction());
        assert!(!TunnelError::PeerUnreachable("p".into()).is_construction());
        assert!(!TunnelError::Timeout(Duration::from_secs(1)).is_construction());
    }

    #[test]
    fn test_display() {
        let err = TunnelError::ProtocolInUse("/x/echo".into());
        assert_eq!(err.to_string(), "protocol already in use: /x/echo");
    }
}
