//! Error codes and error types.

use core::fmt;

/// Local error codes carried by [`RpcError::Status`].
///
/// These never travel on the wire; the protocol's error field is a plain
/// string. They classify failures raised by this side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// The caller passed something the engine cannot send.
    InvalidArgument = 3,
    /// Too many calls outstanding.
    ResourceExhausted = 7,
    /// The session is not in a state that allows the operation.
    FailedPrecondition = 8,
    /// No handler registered for an incoming request.
    Unimplemented = 11,
    /// Handler panicked or an invariant broke.
    Internal = 12,
    /// The session detached (explicitly, or after a transport failure).
    SessionClosed = 101,
    /// The peer sent bytes that are not a valid protocol message.
    ProtocolViolation = 102,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            3 => Some(Self::InvalidArgument),
            7 => Some(Self::ResourceExhausted),
            8 => Some(Self::FailedPrecondition),
            11 => Some(Self::Unimplemented),
            12 => Some(Self::Internal),
            101 => Some(Self::SessionClosed),
            102 => Some(Self::ProtocolViolation),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::Unimplemented => write!(f, "unimplemented"),
            Self::Internal => write!(f, "internal error"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::ProtocolViolation => write!(f, "protocol violation"),
        }
    }
}

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    Closed,
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Encoding errors.
#[derive(Debug)]
pub enum EncodeError {
    EncodeFailed(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeFailed(msg) => write!(f, "encode failed: {msg}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes are not valid MessagePack.
    InvalidData(String),
    /// Valid MessagePack, but not one of the three message shapes.
    InvalidMessage(String),
    /// A value could not be converted into the requested Rust type.
    InvalidValue(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Self::InvalidMessage(msg) => write!(f, "invalid message: {msg}"),
            Self::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// High-level RPC errors.
#[derive(Debug)]
pub enum RpcError {
    Transport(TransportError),
    Status {
        code: ErrorCode,
        message: String,
    },
    /// The peer answered the call with a non-nil error field.
    Remote(String),
    Encode(EncodeError),
    Decode(DecodeError),
}

impl RpcError {
    pub fn status(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    pub fn session_closed(reason: impl Into<String>) -> Self {
        Self::status(ErrorCode::SessionClosed, reason)
    }

    /// True if this error means the connection is gone, as opposed to a
    /// failure contained to one call.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Status {
                    code: ErrorCode::SessionClosed,
                    ..
                }
        )
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            Self::Decode(DecodeError::InvalidData(_) | DecodeError::InvalidMessage(_)) => {
                Some(ErrorCode::ProtocolViolation)
            }
            _ => None,
        }
    }

    /// The string placed in a Response's error field when a request
    /// handler fails with this error.
    pub fn to_response_message(&self) -> String {
        match self {
            Self::Remote(message) => message.clone(),
            Self::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Status { code, message } => write!(f, "{code}: {message}"),
            Self::Remote(message) => write!(f, "remote error: {message}"),
            Self::Encode(e) => write!(f, "serialize error: {e}"),
            Self::Decode(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<EncodeError> for RpcError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<DecodeError> for RpcError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trips_through_u32() {
        for code in [
            ErrorCode::InvalidArgument,
            ErrorCode::ResourceExhausted,
            ErrorCode::FailedPrecondition,
            ErrorCode::Unimplemented,
            ErrorCode::Internal,
            ErrorCode::SessionClosed,
            ErrorCode::ProtocolViolation,
        ] {
            assert_eq!(ErrorCode::from_u32(code as u32), Some(code));
        }
        assert_eq!(ErrorCode::from_u32(0), None);
    }

    #[test]
    fn connection_errors_are_classified() {
        assert!(RpcError::session_closed("gone").is_connection_error());
        assert!(RpcError::Transport(TransportError::Closed).is_connection_error());
        assert!(!RpcError::Remote("nope".into()).is_connection_error());
        assert!(!RpcError::status(ErrorCode::Internal, "boom").is_connection_error());
    }

    #[test]
    fn malformed_input_is_a_protocol_violation() {
        let err = RpcError::from(DecodeError::InvalidData("0xc1".into()));
        assert_eq!(err.code(), Some(ErrorCode::ProtocolViolation));
        let err = RpcError::from(DecodeError::InvalidValue("not a map".into()));
        assert_eq!(err.code(), None);
    }

    #[test]
    fn response_message_strips_local_prefix() {
        assert_eq!(
            RpcError::status(ErrorCode::Internal, "boom").to_response_message(),
            "boom"
        );
        assert_eq!(RpcError::Remote("nope".into()).to_response_message(), "nope");
        assert_eq!(
            RpcError::Transport(TransportError::Closed).to_response_message(),
            "transport error: transport closed"
        );
    }
}
