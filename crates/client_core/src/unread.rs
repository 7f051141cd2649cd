//! Unread tracking. Purely local state; nothing is acknowledged upstream.

use shared::domain::UserId;

use crate::contacts::ContactDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRoute {
    /// Sender is the selected conversation partner.
    Conversation,
    /// Sender is anyone else; only their unread flag changes.
    Unread,
}

pub fn route_inbound(sender: &UserId, selected: Option<&UserId>) -> InboundRoute {
    if selected == Some(sender) {
        InboundRoute::Conversation
    } else {
        InboundRoute::Unread
    }
}

/// Returns whether the flag changed. Unknown senders are ignored.
pub fn mark_unread(directory: &mut ContactDirectory, sender: &UserId) -> bool {
    set_unread(directory, sender, true)
}

pub fn clear_unread(directory: &mut ContactDirectory, identity: &UserId) -> bool {
    set_unread(directory, identity, false)
}

fn set_unread(directory: &mut ContactDirectory, identity: &UserId, has_unread: bool) -> bool {
    match directory.contact_mut(identity) {
        Some(contact) if contact.has_unread != has_unread => {
            contact.has_unread = has_unread;
            true
        }
        _ => false,
    }
}
