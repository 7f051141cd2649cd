use chrono::{DateTime, Utc};
use shared::{domain::UserId, protocol::MessageRecord};

use crate::types::{Message, OutgoingMessage};

/// Send-in-flight bookkeeping. Sends are not queued; the flag stays raised
/// while any of them is outstanding.
#[derive(Debug, Default)]
pub struct Dispatcher {
    inflight: usize,
}

impl Dispatcher {
    pub fn begin(&mut self) {
        self.inflight += 1;
    }

    pub fn finish(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
    }

    pub fn is_sending(&self) -> bool {
        self.inflight > 0
    }
}

/// Turns the server's confirmation into the message shown locally. Sender and
/// timestamp come from this client; text and attachments fall back to what
/// was submitted when the server omits them.
pub fn confirmed_message(
    record: MessageRecord,
    sender: UserId,
    submitted_at: DateTime<Utc>,
    content: &OutgoingMessage,
) -> Message {
    let text = record
        .text
        .filter(|text| !text.is_empty())
        .or_else(|| content.sendable_text().map(str::to_string));
    let attachments = if record.attachments.is_empty() {
        content
            .attachments
            .iter()
            .map(|attachment| attachment.local_ref())
            .collect()
    } else {
        record.attachments
    };

    Message {
        id: record.id,
        sender,
        text,
        attachments,
        created_at: submitted_at,
        delivery: record.status,
    }
}
