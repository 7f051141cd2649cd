//! Realtime chat client core.
//!
//! [`ChatSession`] coordinates a contact directory, the message history of
//! the selected conversation, unread tracking and outbound sends on top of
//! two seams: [`ChatApi`] for request/response calls and
//! [`ChannelTransport`] for the server-push event channel.

pub mod api;
pub mod connection;
pub mod contacts;
pub mod conversation;
pub mod dispatcher;
pub mod error;
mod session;
pub mod transport;
pub mod types;
pub mod unread;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

pub use api::{ChatApi, HttpChatApi};
pub use connection::{ChannelEvent, ChannelPresence, ConnectionManager, Subscription};
pub use error::{ClientError, Operation, OperationError};
pub use session::ChatSession;
pub use transport::{ChannelError, ChannelStream, ChannelTransport, WebSocketTransport};
pub use types::{
    AttachmentUpload, ChatSnapshot, Connectivity, Contact, ErrorSlots, LoadingFlags, Message,
    OutgoingMessage, SessionEvent,
};
