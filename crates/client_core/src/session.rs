use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use chrono::Utc;
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{EventKind, MessageRecord, ServerEvent},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    connection::{ChannelEvent, ChannelPresence, ConnectionManager, Subscription},
    contacts::ContactDirectory,
    conversation::{ConversationStore, HistoryOutcome},
    dispatcher::{confirmed_message, Dispatcher},
    error::{ClientError, Operation, OperationError},
    transport::ChannelTransport,
    types::{
        ChatSnapshot, Connectivity, Contact, ErrorSlots, LoadingFlags, Message, OutgoingMessage,
        SessionEvent,
    },
    unread::{self, InboundRoute},
};

const SESSION_EVENT_BUFFER: usize = 256;

#[derive(Default)]
struct ChatState {
    identity: Option<UserId>,
    /// Bumped on every identity change; responses tagged with an older epoch
    /// are discarded.
    epoch: u64,
    directory: ContactDirectory,
    conversation: ConversationStore,
    dispatcher: Dispatcher,
    send_error: Option<OperationError>,
    channel_error: Option<OperationError>,
}

/// Top-level chat coordinator for one signed-in user.
///
/// Owns the contact directory, the conversation store and the realtime
/// channel, and keeps them consistent across identity changes, selection
/// changes and out-of-order completions of remote calls. State is guarded by
/// a single mutex that is never held across a remote call.
pub struct ChatSession {
    api: Arc<dyn ChatApi>,
    connection: ConnectionManager,
    inner: Mutex<ChatState>,
    lifecycle: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
    push_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(api: Arc<dyn ChatApi>, transport: Arc<dyn ChannelTransport>) -> Arc<Self> {
        let (events, _) = broadcast::channel(SESSION_EVENT_BUFFER);
        Arc::new(Self {
            api,
            connection: ConnectionManager::new(transport),
            inner: Mutex::new(ChatState::default()),
            lifecycle: Mutex::new(()),
            events,
            push_task: StdMutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub async fn identity(&self) -> Option<UserId> {
        self.inner.lock().await.identity.clone()
    }

    pub async fn connectivity(&self) -> Connectivity {
        let has_identity = self.inner.lock().await.identity.is_some();
        self.connectivity_for(has_identity)
    }

    fn connectivity_for(&self, has_identity: bool) -> Connectivity {
        if !has_identity {
            return Connectivity::AwaitingIdentity;
        }
        match self.connection.presence() {
            ChannelPresence::Live(_) => Connectivity::Live,
            ChannelPresence::Absent => Connectivity::Pending,
        }
    }

    /// Switches the session to `identity`. All per-identity state is dropped,
    /// the channel is re-established and, when an identity is present, the
    /// contact list and directory are fetched once.
    pub async fn set_identity(self: &Arc<Self>, identity: Option<UserId>) {
        self.ensure_push_task();

        let epoch = {
            let _lifecycle = self.lifecycle.lock().await;
            let epoch = {
                let mut guard = self.inner.lock().await;
                if guard.identity == identity {
                    debug!("chat: identity unchanged");
                    return;
                }
                let epoch = guard.epoch + 1;
                *guard = ChatState {
                    identity: identity.clone(),
                    epoch,
                    ..ChatState::default()
                };
                epoch
            };
            match &identity {
                Some(identity) => info!(identity = %identity, "chat: session identity set"),
                None => info!("chat: session identity cleared"),
            }

            let connected = match &identity {
                Some(identity) => self.connection.connect(Some(identity)).await,
                None => {
                    self.connection.disconnect().await;
                    Ok(())
                }
            };
            if let Err(err) = connected {
                warn!("channel: connect failed: {err:#}");
                let error = OperationError::from_anyhow(Operation::Channel, &err);
                {
                    let mut guard = self.inner.lock().await;
                    if guard.epoch == epoch {
                        guard.channel_error = Some(error.clone());
                    }
                }
                self.emit(SessionEvent::Error(error));
            }
            epoch
        };

        if identity.is_some() {
            debug!(epoch, "chat: initial contact and directory refresh");
            tokio::join!(self.refresh_contacts(), self.refresh_directory());
        }
    }

    pub async fn logout(self: &Arc<Self>) {
        self.set_identity(None).await;
    }

    fn ensure_push_task(self: &Arc<Self>) {
        let mut slot = self
            .push_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let messages = self.connection.subscribe(EventKind::MessageReceived);
        let errors = self.connection.subscribe(EventKind::Error);
        let presence = self.connection.watch_presence();
        *slot = Some(tokio::spawn(run_push_loop(
            Arc::downgrade(self),
            messages,
            errors,
            presence,
        )));
    }

    pub async fn refresh_contacts(&self) {
        let (identity, epoch) = {
            let mut guard = self.inner.lock().await;
            let Some(identity) = guard.identity.clone() else {
                debug!("contacts: refresh skipped without identity");
                return;
            };
            guard.directory.begin_contacts_refresh();
            (identity, guard.epoch)
        };

        let result = self.api.fetch_contacts(&identity).await;

        let event = {
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                debug!(identity = %identity, "contacts: discarding response for previous identity");
                return;
            }
            match result {
                Ok(response) => {
                    let count = guard.directory.replace_contacts(&response);
                    info!(identity = %identity, count, "contacts: refreshed");
                    SessionEvent::ContactsUpdated { count }
                }
                Err(err) => {
                    warn!(identity = %identity, "contacts: refresh failed: {err:#}");
                    let error = OperationError::from_anyhow(Operation::FetchContacts, &err);
                    guard.directory.fail_contacts(error.clone());
                    SessionEvent::Error(error)
                }
            }
        };
        self.emit(event);
    }

    pub async fn refresh_directory(&self) {
        let (identity, epoch) = {
            let mut guard = self.inner.lock().await;
            let Some(identity) = guard.identity.clone() else {
                debug!("directory: refresh skipped without identity");
                return;
            };
            guard.directory.begin_directory_refresh();
            (identity, guard.epoch)
        };

        let result = self.api.fetch_directory(&identity).await;

        let event = {
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                debug!(identity = %identity, "directory: discarding response for previous identity");
                return;
            }
            match result {
                Ok(response) => {
                    let count = guard.directory.replace_directory(&response);
                    info!(identity = %identity, count, "directory: refreshed");
                    SessionEvent::DirectoryUpdated { count }
                }
                Err(err) => {
                    warn!(identity = %identity, "directory: refresh failed: {err:#}");
                    let error = OperationError::from_anyhow(Operation::FetchDirectory, &err);
                    guard.directory.fail_directory(error.clone());
                    SessionEvent::Error(error)
                }
            }
        };
        self.emit(event);
    }

    pub async fn search_directory(&self, query: &str) -> Vec<Contact> {
        self.inner.lock().await.directory.search(query)
    }

    /// Selects the conversation with `partner`, who may be a contact or any
    /// directory user, and loads its history. The previous conversation is
    /// cleared before anything is awaited.
    pub async fn select_conversation(&self, partner: &UserId) -> Result<(), ClientError> {
        let (partner, unread_cleared) = {
            let mut guard = self.inner.lock().await;
            if guard.identity.is_none() {
                debug!(partner = %partner, "chat: selection ignored without identity");
                return Ok(());
            }
            let contact = guard
                .directory
                .resolve(partner)
                .ok_or_else(|| ClientError::UnknownContact(partner.clone()))?;
            let partner = contact.identity.clone();
            guard.conversation.select(contact);
            let unread_cleared = unread::clear_unread(&mut guard.directory, &partner);
            (partner, unread_cleared)
        };

        info!(partner = %partner, "chat: conversation selected");
        self.emit(SessionEvent::ConversationSelected {
            partner: partner.clone(),
        });
        if unread_cleared {
            self.emit(SessionEvent::UnreadChanged {
                identity: partner,
                has_unread: false,
            });
        }

        self.load_history().await;
        Ok(())
    }

    /// Fetches history for the current selection and replaces the visible
    /// sequence, unless the selection changed meanwhile. No-op without a
    /// selection.
    pub async fn load_history(&self) {
        let (caller, ticket) = {
            let mut guard = self.inner.lock().await;
            let Some(caller) = guard.identity.clone() else {
                return;
            };
            let Some(ticket) = guard.conversation.begin_load() else {
                debug!("chat: history load skipped without selection");
                return;
            };
            (caller, ticket)
        };

        let result = self.api.fetch_history(&caller, &ticket.partner).await;

        let mut events = Vec::new();
        {
            let mut guard = self.inner.lock().await;
            let result = match result {
                Ok(response) => Ok(history_messages(
                    &guard.directory,
                    &ticket.partner,
                    response.messages,
                )),
                Err(err) => {
                    warn!(partner = %ticket.partner, "chat: history load failed: {err:#}");
                    Err(OperationError::from_anyhow(Operation::FetchHistory, &err))
                }
            };
            let error = result.as_ref().err().cloned();
            match guard.conversation.finish_load(&ticket, result) {
                HistoryOutcome::Loaded(count) => {
                    info!(partner = %ticket.partner, count, "chat: history loaded");
                    events.push(SessionEvent::HistoryLoaded {
                        partner: ticket.partner.clone(),
                        count,
                    });
                    if unread::clear_unread(&mut guard.directory, &ticket.partner) {
                        events.push(SessionEvent::UnreadChanged {
                            identity: ticket.partner.clone(),
                            has_unread: false,
                        });
                    }
                }
                HistoryOutcome::Failed => {
                    if let Some(error) = error {
                        events.push(SessionEvent::Error(error));
                    }
                }
                HistoryOutcome::Stale => {}
            }
        }

        for event in events {
            self.emit(event);
        }
    }

    /// Sends `content` to the selected partner and appends the confirmed
    /// record. Returns `Ok(None)` without touching the network when there is
    /// nothing to send, no selection or no identity.
    pub async fn send(&self, content: OutgoingMessage) -> Result<Option<Message>, ClientError> {
        if content.is_empty() {
            debug!("chat: ignoring empty message");
            return Ok(None);
        }

        let (caller, ticket, epoch) = {
            let mut guard = self.inner.lock().await;
            let Some(caller) = guard.identity.clone() else {
                debug!("chat: send ignored without identity");
                return Ok(None);
            };
            let Some(ticket) = guard.conversation.current_ticket() else {
                debug!("chat: send ignored without selection");
                return Ok(None);
            };
            guard.dispatcher.begin();
            (caller, ticket, guard.epoch)
        };

        let submitted_at = Utc::now();
        let result = self
            .api
            .send_message(&caller, &ticket.partner, &content)
            .await;

        let mut guard = self.inner.lock().await;
        let same_session = guard.epoch == epoch;
        if same_session {
            guard.dispatcher.finish();
        }

        let response = match result {
            Ok(response) => {
                if same_session {
                    guard.send_error = None;
                }
                response
            }
            Err(err) => {
                warn!(partner = %ticket.partner, "chat: send failed: {err:#}");
                if same_session {
                    let error = OperationError::from_anyhow(Operation::SendMessage, &err);
                    guard.send_error = Some(error.clone());
                    drop(guard);
                    self.emit(SessionEvent::Error(error));
                }
                return Err(ClientError::Send {
                    partner: ticket.partner,
                    source: err,
                });
            }
        };

        let message = confirmed_message(response.message, caller, submitted_at, &content);
        if same_session && guard.conversation.is_current(&ticket) {
            if guard.conversation.append(message.clone()) {
                drop(guard);
                info!(partner = %ticket.partner, message_id = %message.id, "chat: message sent");
                self.emit(SessionEvent::MessageAppended {
                    message: message.clone(),
                });
            }
        } else {
            info!(
                partner = %ticket.partner,
                message_id = %message.id,
                "chat: message sent after selection changed; not appended"
            );
        }
        Ok(Some(message))
    }

    /// Routes a message pushed on the channel opened for `channel_identity`.
    /// Frames left over from a previous identity's channel are dropped.
    async fn handle_pushed_message(&self, channel_identity: &UserId, record: MessageRecord) {
        let event = {
            let mut guard = self.inner.lock().await;
            if guard.identity.as_ref() != Some(channel_identity) {
                debug!(
                    channel = %channel_identity,
                    message_id = %record.id,
                    "chat: dropping push for previous identity"
                );
                return;
            }
            let Some(raw_sender) = record.sender.clone() else {
                warn!(message_id = %record.id, "chat: dropping pushed message without sender");
                return;
            };
            let sender = guard.directory.canonical_identity(&raw_sender);
            match unread::route_inbound(&sender, guard.conversation.selected_identity()) {
                InboundRoute::Conversation => {
                    let message = Message::from_record(record, sender, Utc::now());
                    if !guard.conversation.append(message.clone()) {
                        debug!(message_id = %message.id, "chat: duplicate pushed message");
                        return;
                    }
                    SessionEvent::MessageAppended { message }
                }
                InboundRoute::Unread => {
                    if !unread::mark_unread(&mut guard.directory, &sender) {
                        return;
                    }
                    debug!(sender = %sender, "chat: marked unread");
                    SessionEvent::UnreadChanged {
                        identity: sender,
                        has_unread: true,
                    }
                }
            }
        };
        self.emit(event);
    }

    async fn record_channel_error(&self, channel_identity: &UserId, error: ApiError) {
        let error = {
            let mut guard = self.inner.lock().await;
            if guard.identity.as_ref() != Some(channel_identity) {
                debug!(channel = %channel_identity, "channel: dropping error for previous identity");
                return;
            }
            warn!(code = ?error.code, "channel: server reported error: {}", error.message);
            let error = OperationError::new(Operation::Channel, error.message);
            guard.channel_error = Some(error.clone());
            error
        };
        self.emit(SessionEvent::Error(error));
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        let guard = self.inner.lock().await;
        let selected = guard.conversation.selected().map(|selected| {
            guard
                .directory
                .contact(&selected.identity)
                .cloned()
                .unwrap_or_else(|| selected.clone())
        });
        ChatSnapshot {
            identity: guard.identity.clone(),
            connectivity: self.connectivity_for(guard.identity.is_some()),
            contacts: guard.directory.contacts().to_vec(),
            directory: guard.directory.users().to_vec(),
            selected,
            messages: guard.conversation.messages().to_vec(),
            loading: LoadingFlags {
                contacts: guard.directory.contacts_loading(),
                directory: guard.directory.directory_loading(),
                history: guard.conversation.is_loading(),
                send: guard.dispatcher.is_sending(),
            },
            errors: ErrorSlots {
                contacts: guard.directory.contacts_error().cloned(),
                directory: guard.directory.directory_error().cloned(),
                history: guard.conversation.error().cloned(),
                send: guard.send_error.clone(),
                channel: guard.channel_error.clone(),
            },
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        let slot = self
            .push_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

fn history_messages(
    directory: &ContactDirectory,
    partner: &UserId,
    records: Vec<MessageRecord>,
) -> Vec<Message> {
    let received_at = Utc::now();
    records
        .into_iter()
        .filter_map(|record| {
            let Some(sender) = record
                .sender
                .as_ref()
                .map(|sender| directory.canonical_identity(sender))
            else {
                warn!(partner = %partner, message_id = %record.id, "chat: dropping history record without sender");
                return None;
            };
            Some(Message::from_record(record, sender, received_at))
        })
        .collect()
}

async fn run_push_loop(
    session: Weak<ChatSession>,
    mut messages: Subscription,
    mut errors: Subscription,
    mut presence: watch::Receiver<ChannelPresence>,
) {
    let mut last_connectivity = None;
    loop {
        tokio::select! {
            event = messages.recv() => match event {
                Some(ChannelEvent { identity, event: ServerEvent::MessageReceived { message } }) => {
                    let Some(session) = session.upgrade() else { break };
                    session.handle_pushed_message(&identity, message).await;
                }
                Some(_) => {}
                None => break,
            },
            event = errors.recv() => match event {
                Some(ChannelEvent { identity, event: ServerEvent::Error(error) }) => {
                    let Some(session) = session.upgrade() else { break };
                    session.record_channel_error(&identity, error).await;
                }
                Some(_) => {}
                None => break,
            },
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(session) = session.upgrade() else { break };
                let connectivity = session.connectivity().await;
                if last_connectivity != Some(connectivity) {
                    last_connectivity = Some(connectivity);
                    session.emit(SessionEvent::ConnectivityChanged(connectivity));
                }
            }
        }
    }
    debug!("chat: push loop stopped");
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
