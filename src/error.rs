//! Error taxonomy for the transport layer.
//!
//! Every failure surfaced by this crate is a [`TransportError`]. Socket
//! failures are classified from the raw OS error code so the connection
//! layer can tell a refused connection from a lost one without inspecting
//! errno values itself.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = TransportError> = std::result::Result<T, E>;

/// Errors raised by endpoints, connectors, transceivers, the resolver and
/// the selector.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An endpoint string could not be parsed. The message names the
    /// offending option and the full endpoint string.
    #[error("endpoint parse error: {message}")]
    EndpointParse { message: String },

    /// The peer actively refused the connection.
    #[error("connection refused: {source}")]
    ConnectionRefused {
        #[source]
        source: io::Error,
    },

    /// Establishing the connection failed for another network reason.
    #[error("connect failed: {reason}")]
    ConnectFailed { reason: String },

    /// An established connection was lost. `source` is `None` when the
    /// peer closed the connection gracefully.
    #[error("connection lost{}", lost_suffix(.source))]
    ConnectionLost {
        #[source]
        source: Option<io::Error>,
    },

    /// Host name resolution failed.
    #[error("cannot resolve host `{host}': {reason}")]
    DnsFailure { host: String, reason: String },

    /// Any other socket-level failure.
    #[error("socket error: {source}")]
    Socket {
        #[source]
        source: io::Error,
    },

    /// A datagram exceeds the maximum size the socket can send.
    #[error("datagram of {size} bytes exceeds the limit of {limit} bytes")]
    DatagramLimit { size: usize, limit: usize },

    /// The runtime instance was destroyed before the operation completed.
    #[error("transport runtime destroyed")]
    Destroyed,

    /// The peer violated a framing or handshake protocol.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// A binary endpoint encoding is malformed.
    #[error("marshal error: {reason}")]
    Marshal { reason: String },

    /// The requested operation is not supported by this transport.
    #[error("feature not supported: {feature}")]
    FeatureNotSupported { feature: String },

    /// The object is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The configuration is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl TransportError {
    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Self::EndpointParse {
            message: message.into(),
        }
    }

    pub(crate) fn marshal(reason: impl Into<String>) -> Self {
        Self::Marshal {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Returns true for the errors the connection layer treats as a
    /// transient network condition rather than a local bug.
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. }
                | Self::ConnectFailed { .. }
                | Self::ConnectionLost { .. }
                | Self::DnsFailure { .. }
                | Self::Socket { .. }
        )
    }
}

fn lost_suffix(source: &Option<io::Error>) -> String {
    match source {
        Some(error) => format!(": {error}"),
        None => String::new(),
    }
}

pub(crate) fn interrupted(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::Interrupted
}

pub(crate) fn would_block(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    matches!(error.raw_os_error(), Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK)
}

pub(crate) fn connect_in_progress(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(code) if code == libc::EINPROGRESS || code == libc::EALREADY)
        || would_block(error)
}

pub(crate) fn no_buffers(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::ENOBUFS)
}

pub(crate) fn connection_refused(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::ECONNREFUSED)
}

pub(crate) fn connect_failed(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(code) if code == libc::ECONNREFUSED
            || code == libc::ETIMEDOUT
            || code == libc::ENETUNREACH
            || code == libc::EHOSTUNREACH
            || code == libc::ECONNRESET
            || code == libc::ESHUTDOWN
            || code == libc::ECONNABORTED
            || code == libc::ENETDOWN
    )
}

pub(crate) fn connection_lost(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(code) if code == libc::ECONNRESET
            || code == libc::ENOTCONN
            || code == libc::ESHUTDOWN
            || code == libc::ECONNABORTED
            || code == libc::EPIPE
    )
}

pub(crate) fn recv_truncated(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::EMSGSIZE)
}

/// Maps a failure of `connect(2)` or of the deferred connect check.
pub(crate) fn classify_connect_error(error: io::Error) -> TransportError {
    if connection_refused(&error) {
        TransportError::ConnectionRefused { source: error }
    } else if connect_failed(&error) {
        TransportError::ConnectFailed {
            reason: error.to_string(),
        }
    } else {
        TransportError::Socket { source: error }
    }
}

/// Maps a failure of `send(2)` or `recv(2)` on an established connection.
pub(crate) fn classify_io_error(error: io::Error) -> TransportError {
    if connection_lost(&error) {
        TransportError::ConnectionLost {
            source: Some(error),
        }
    } else {
        TransportError::Socket { source: error }
    }
}

pub(crate) fn socket_error(error: io::Error) -> TransportError {
    TransportError::Socket { source: error }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_is_classified_before_generic_connect_failures() {
        let error = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert!(matches!(
            classify_connect_error(error),
            TransportError::ConnectionRefused { .. }
        ));

        let error = io::Error::from_raw_os_error(libc::EHOSTUNREACH);
        assert!(matches!(
            classify_connect_error(error),
            TransportError::ConnectFailed { .. }
        ));

        let error = io::Error::from_raw_os_error(libc::EACCES);
        assert!(matches!(
            classify_connect_error(error),
            TransportError::Socket { .. }
        ));
    }

    #[test]
    fn reset_is_a_lost_connection() {
        let error = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert!(matches!(
            classify_io_error(error),
            TransportError::ConnectionLost { source: Some(_) }
        ));
    }

    #[test]
    fn graceful_loss_has_no_source_in_message() {
        let error = TransportError::ConnectionLost { source: None };
        assert_eq!(error.to_string(), "connection lost");
    }
}
