use std::fmt;

use shared::domain::UserId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    FetchContacts,
    FetchDirectory,
    FetchHistory,
    SendMessage,
    Channel,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::FetchContacts => "fetch_contacts",
            Operation::FetchDirectory => "fetch_directory",
            Operation::FetchHistory => "fetch_history",
            Operation::SendMessage => "send_message",
            Operation::Channel => "channel",
        };
        f.write_str(name)
    }
}

/// Failure captured into a per-operation error slot instead of being
/// propagated to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub operation: Operation,
    pub message: String,
}

impl OperationError {
    pub fn new(operation: Operation, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }

    pub(crate) fn from_anyhow(operation: Operation, err: &anyhow::Error) -> Self {
        Self::new(operation, format!("{err:#}"))
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no contact or directory user with identity {0}")]
    UnknownContact(UserId),
    #[error("failed to send message to {partner}: {source:#}")]
    Send {
        partner: UserId,
        source: anyhow::Error,
    },
}
