use std::fmt;

/// Errors surfaced to the caller of the listener API.
///
/// Packet- and session-level failures (malformed packets, unsupported
/// versions, session teardown, security verification failures) are never
/// represented here — they are confined to a single datagram or session and
/// only visible through logging and [`crate::stats::ListenerStats`].
#[derive(Debug)]
pub enum ListenError {
    /// The multiaddress passed to `listen` is not a well-formed QUIC
    /// endpoint address.
    InvalidAddress(String),
    /// `listen` was called while the listener was already listening.
    AlreadyListening,
    /// The UDP socket could not be created or bound.
    BindFailed(std::io::Error),
    /// The listener was constructed with no protocol configurations; there
    /// is nothing to match an incoming version against.
    NoProtocolsConfigured,
}

impl fmt::Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenError::InvalidAddress(addr) => {
                write!(f, "not a well-formed QUIC multiaddress: {addr}")
            }
            ListenError::AlreadyListening => write!(f, "listener is already listening"),
            ListenError::BindFailed(err) => write!(f, "failed to bind UDP socket: {err}"),
            ListenError::NoProtocolsConfigured => {
                write!(f, "at least one protocol configuration is required")
            }
        }
    }
}

impl std::error::Error for ListenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenError::BindFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ListenError {
    fn from(err: std::io::Error) -> Self {
        ListenError::BindFailed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_invalid_address() {
        let err = ListenError::InvalidAddress("/ip4/bad".to_string());
        assert!(err.to_string().contains("/ip4/bad"));
    }

    #[test]
    fn already_listening_has_stable_message() {
        assert_eq!(
            ListenError::AlreadyListening.to_string(),
            "listener is already listening"
        );
    }
}
