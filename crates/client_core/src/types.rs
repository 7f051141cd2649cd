use chrono::{DateTime, Utc};
use shared::{
    domain::{DeliveryState, MessageId, Role, UserId},
    protocol::{AttachmentRef, MessageRecord},
};

use crate::error::OperationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub identity: UserId,
    pub display_name: String,
    pub handle: Option<String>,
    pub avatar_ref: Option<String>,
    pub role: Role,
    pub has_unread: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub text: Option<String>,
    pub attachments: Vec<AttachmentRef>,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl Message {
    /// Builds a message from a wire record whose sender has already been
    /// resolved to a canonical identity.
    pub(crate) fn from_record(
        record: MessageRecord,
        sender: UserId,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: record.id,
            sender,
            text: record.text.filter(|text| !text.is_empty()),
            attachments: record.attachments,
            created_at: record.created_at.unwrap_or(received_at),
            delivery: record.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    pub fn local_ref(&self) -> AttachmentRef {
        AttachmentRef {
            url: None,
            name: Some(self.filename.clone()),
            mime_type: self.mime_type.clone(),
        }
    }
}

/// Content submitted through the dispatcher: optional text plus an ordered
/// list of attachments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: Option<String>,
    pub attachments: Vec<AttachmentUpload>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentUpload) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Text worth sending; whitespace-only text counts as no text.
    pub fn sendable_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.sendable_text().is_none() && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// No session identity; the core is inert.
    AwaitingIdentity,
    /// Identity present but no live channel (connecting, failed or closed).
    Pending,
    Live,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadingFlags {
    pub contacts: bool,
    pub directory: bool,
    pub history: bool,
    pub send: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorSlots {
    pub contacts: Option<OperationError>,
    pub directory: Option<OperationError>,
    pub history: Option<OperationError>,
    pub send: Option<OperationError>,
    pub channel: Option<OperationError>,
}

/// Point-in-time copy of everything the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub identity: Option<UserId>,
    pub connectivity: Connectivity,
    pub contacts: Vec<Contact>,
    pub directory: Vec<Contact>,
    pub selected: Option<Contact>,
    pub messages: Vec<Message>,
    pub loading: LoadingFlags,
    pub errors: ErrorSlots,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectivityChanged(Connectivity),
    ContactsUpdated { count: usize },
    DirectoryUpdated { count: usize },
    ConversationSelected { partner: UserId },
    HistoryLoaded { partner: UserId, count: usize },
    MessageAppended { message: Message },
    UnreadChanged { identity: UserId, has_unread: bool },
    Error(OperationError),
}
