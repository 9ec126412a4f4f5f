//! The three MessagePack-RPC message shapes and their value form.
//!
//! Every message is a fixed-arity array tagged by a leading integer:
//!
//! | kind | shape |
//! |---|---|
//! | 0 request | `[0, id, method, args]` |
//! | 1 response | `[1, id, error \| nil, result]` |
//! | 2 notification | `[2, method, args]` |

use rmpv::Value;

use crate::DecodeError;

/// Leading discriminant of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    Notification = 2,
}

impl MessageKind {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Notification),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::Request | Self::Response => 4,
            Self::Notification => 3,
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        id: u32,
        method: String,
        args: Vec<Value>,
    },
    Response {
        id: u32,
        /// `Some` means the call failed; `result` is then nil.
        error: Option<String>,
        result: Value,
    },
    Notification {
        method: String,
        args: Vec<Value>,
    },
}

impl RpcMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request { .. } => MessageKind::Request,
            Self::Response { .. } => MessageKind::Response,
            Self::Notification { .. } => MessageKind::Notification,
        }
    }

    /// Successful response.
    pub fn ok(id: u32, result: Value) -> Self {
        Self::Response {
            id,
            error: None,
            result,
        }
    }

    /// Failed response; the result slot is nil.
    pub fn err(id: u32, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            error: Some(message.into()),
            result: Value::Nil,
        }
    }

    /// Convert into the array value written on the wire.
    pub fn into_value(self) -> Value {
        let kind = Value::from(self.kind() as u8);
        match self {
            Self::Request { id, method, args } => Value::Array(vec![
                kind,
                Value::from(id),
                Value::from(method),
                Value::Array(args),
            ]),
            Self::Response { id, error, result } => Value::Array(vec![
                kind,
                Value::from(id),
                error.map(Value::from).unwrap_or(Value::Nil),
                result,
            ]),
            Self::Notification { method, args } => {
                Value::Array(vec![kind, Value::from(method), Value::Array(args)])
            }
        }
    }

    /// Parse a decoded value into a message.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(DecodeError::InvalidMessage(format!(
                    "expected array, got {other}"
                )));
            }
        };

        let kind = items
            .first()
            .and_then(Value::as_u64)
            .and_then(MessageKind::from_u64)
            .ok_or_else(|| {
                DecodeError::InvalidMessage(format!(
                    "missing or unknown message kind in {}",
                    Value::Array(items.clone())
                ))
            })?;

        if items.len() != kind.arity() {
            return Err(DecodeError::InvalidMessage(format!(
                "{kind:?} expects {} elements, got {}",
                kind.arity(),
                items.len()
            )));
        }

        let mut fields = items.into_iter().skip(1);
        // Arity was checked above, so each `next()` below yields a value.
        let mut next = || fields.next().unwrap_or(Value::Nil);

        match kind {
            MessageKind::Request => {
                let id = parse_id(next())?;
                let method = parse_method(next())?;
                let args = parse_args(next())?;
                Ok(Self::Request { id, method, args })
            }
            MessageKind::Response => {
                let id = parse_id(next())?;
                let error = parse_error(next());
                let result = next();
                Ok(Self::Response { id, error, result })
            }
            MessageKind::Notification => {
                let method = parse_method(next())?;
                let args = parse_args(next())?;
                Ok(Self::Notification { method, args })
            }
        }
    }
}

fn parse_id(value: Value) -> Result<u32, DecodeError> {
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| DecodeError::InvalidMessage(format!("invalid message id {value}")))
}

fn parse_method(value: Value) -> Result<String, DecodeError> {
    match value {
        Value::String(s) => s
            .into_str()
            .ok_or_else(|| DecodeError::InvalidMessage("method name is not UTF-8".into())),
        other => Err(DecodeError::InvalidMessage(format!(
            "method name must be a string, got {other}"
        ))),
    }
}

fn parse_args(value: Value) -> Result<Vec<Value>, DecodeError> {
    match value {
        Value::Array(args) => Ok(args),
        other => Err(DecodeError::InvalidMessage(format!(
            "arguments must be an array, got {other}"
        ))),
    }
}

/// Reduce a response error field to its message.
///
/// Peers commonly send `[code, message]` instead of a bare string.
fn parse_error(value: Value) -> Option<String> {
    match value {
        Value::Nil => None,
        Value::String(s) => Some(s.into_str().unwrap_or_else(|| "invalid UTF-8 error".into())),
        Value::Array(items) => {
            if let [_, message] = items.as_slice() {
                if let Some(message) = message.as_str() {
                    return Some(message.to_owned());
                }
            }
            Some(Value::Array(items).to_string())
        }
        other => Some(other.to_string()),
    }
}
