use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// A message handed over by the queue transport.
///
/// The transport runs in receive-and-delete mode: by the time a consumer
/// sees a `QueueMessage` it is already gone from the server, whatever the
/// consumer does with it afterwards.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// The subject (queue name) the message was received on
    pub subject: String,
    /// Producer supplied message id, or a generated one when absent
    pub message_id: String,
    /// The raw message payload
    pub payload: Bytes,
}

impl QueueMessage {
    pub fn new(subject: impl Into<String>, message_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            message_id: message_id.into(),
            payload,
        }
    }

    /// Payload as text for logging; invalid UTF-8 is replaced, never rejected
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Category of a connection level fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Disconnected,
    SlowConsumer,
    Server,
    Client,
    LameDuck,
    Other,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::SlowConsumer => "slow_consumer",
            Self::Server => "server_error",
            Self::Client => "client_error",
            Self::LameDuck => "lame_duck_mode",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault in the queue connection or subscription, unrelated to any one message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
