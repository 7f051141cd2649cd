use shared::domain::UserId;
use tracing::debug;

use crate::{
    error::OperationError,
    types::{Contact, Message},
};

/// Identifies the selection a history fetch or send was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionTicket {
    pub partner: UserId,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    Loaded(usize),
    Failed,
    /// The selection changed while the fetch was in flight.
    Stale,
}

/// Message history of the selected conversation, oldest first.
///
/// Contents are only ever valid for the current selection: selecting clears
/// the sequence immediately, and results tagged with an older selection are
/// discarded.
#[derive(Debug, Default)]
pub struct ConversationStore {
    selected: Option<Contact>,
    messages: Vec<Message>,
    generation: u64,
    inflight: usize,
    error: Option<OperationError>,
}

impl ConversationStore {
    pub fn selected(&self) -> Option<&Contact> {
        self.selected.as_ref()
    }

    pub fn selected_identity(&self) -> Option<&UserId> {
        self.selected.as_ref().map(|contact| &contact.identity)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_loading(&self) -> bool {
        self.inflight > 0
    }

    pub fn error(&self) -> Option<&OperationError> {
        self.error.as_ref()
    }

    pub fn select(&mut self, contact: Contact) -> SelectionTicket {
        self.generation += 1;
        self.messages.clear();
        self.inflight = 0;
        self.error = None;
        let ticket = SelectionTicket {
            partner: contact.identity.clone(),
            generation: self.generation,
        };
        self.selected = Some(contact);
        ticket
    }

    pub fn clear(&mut self) {
        self.generation += 1;
        self.selected = None;
        self.messages.clear();
        self.inflight = 0;
        self.error = None;
    }

    pub fn current_ticket(&self) -> Option<SelectionTicket> {
        self.selected.as_ref().map(|contact| SelectionTicket {
            partner: contact.identity.clone(),
            generation: self.generation,
        })
    }

    pub fn is_current(&self, ticket: &SelectionTicket) -> bool {
        ticket.generation == self.generation && self.selected_identity() == Some(&ticket.partner)
    }

    /// Starts a history fetch for the current selection, if any.
    pub fn begin_load(&mut self) -> Option<SelectionTicket> {
        let ticket = self.current_ticket()?;
        self.inflight += 1;
        Some(ticket)
    }

    pub fn finish_load(
        &mut self,
        ticket: &SelectionTicket,
        result: Result<Vec<Message>, OperationError>,
    ) -> HistoryOutcome {
        if !self.is_current(ticket) {
            debug!(partner = %ticket.partner, "chat: discarding history for superseded selection");
            return HistoryOutcome::Stale;
        }
        self.inflight = self.inflight.saturating_sub(1);
        match result {
            Ok(messages) => {
                let count = messages.len();
                self.messages = messages;
                self.error = None;
                HistoryOutcome::Loaded(count)
            }
            Err(error) => {
                self.error = Some(error);
                HistoryOutcome::Failed
            }
        }
    }

    /// Appends to the end of the sequence. A message whose id is already
    /// present is skipped.
    pub fn append(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|existing| existing.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
