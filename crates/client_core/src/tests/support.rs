use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use shared::{
    domain::{DeliveryState, MessageId, Role, UserId},
    protocol::{
        ContactEntry, ContactsResponse, DirectoryResponse, HistoryResponse, MessageRecord,
        SendMessageResponse, ServerEvent, UserRecord,
    },
};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::{
    api::ChatApi,
    transport::{ChannelError, ChannelStream, ChannelTransport},
    types::{OutgoingMessage, SessionEvent},
};

pub fn user(id: &str, name: &str) -> UserRecord {
    UserRecord {
        id: Some(UserId::from(id)),
        name: Some(name.to_string()),
        username: Some(name.to_lowercase()),
        ..UserRecord::default()
    }
}

pub fn contact_entry(user: UserRecord) -> ContactEntry {
    ContactEntry {
        user,
        role: Some(Role::Student),
    }
}

pub fn message(id: &str, sender: &str, text: &str) -> MessageRecord {
    MessageRecord {
        id: MessageId::from(id),
        sender: Some(UserId::from(sender)),
        text: Some(text.to_string()),
        attachments: Vec::new(),
        created_at: None,
        status: DeliveryState::Delivered,
    }
}

pub fn pushed(record: MessageRecord) -> ServerEvent {
    ServerEvent::MessageReceived { message: record }
}

#[derive(Default)]
pub struct FakeChatApi {
    pub contacts: Mutex<Vec<ContactEntry>>,
    pub users: Mutex<Vec<UserRecord>>,
    pub histories: Mutex<HashMap<UserId, Vec<MessageRecord>>>,
    pub send_reply: Mutex<Option<MessageRecord>>,
    history_gates: Mutex<HashMap<UserId, oneshot::Receiver<()>>>,
    send_gate: Mutex<Option<oneshot::Receiver<()>>>,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<String>>,
}

impl FakeChatApi {
    pub async fn with_contacts(contacts: Vec<UserRecord>) -> Self {
        let api = Self::default();
        *api.contacts.lock().await = contacts.into_iter().map(contact_entry).collect();
        api
    }

    pub async fn set_history(&self, partner: &str, messages: Vec<MessageRecord>) {
        self.histories
            .lock()
            .await
            .insert(UserId::from(partner), messages);
    }

    /// Holds the next history fetch for `partner` until the returned sender
    /// fires or is dropped.
    pub async fn gate_history(&self, partner: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.history_gates
            .lock()
            .await
            .insert(UserId::from(partner), rx);
        tx
    }

    /// Holds the next send until the returned sender fires or is dropped.
    pub async fn gate_send(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.send_gate.lock().await = Some(rx);
        tx
    }

    pub async fn fail(&self, operation: &'static str) {
        self.failing.lock().await.insert(operation);
    }

    pub async fn recover(&self, operation: &'static str) {
        self.failing.lock().await.remove(operation);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    async fn record(&self, call: String, operation: &'static str) -> Result<()> {
        self.calls.lock().await.push(call);
        if self.failing.lock().await.contains(operation) {
            return Err(anyhow!("{operation} unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn fetch_contacts(&self, _caller: &UserId) -> Result<ContactsResponse> {
        self.record("contacts".to_string(), "contacts").await?;
        Ok(ContactsResponse {
            contacts: self.contacts.lock().await.clone(),
        })
    }

    async fn fetch_directory(&self, _caller: &UserId) -> Result<DirectoryResponse> {
        self.record("directory".to_string(), "directory").await?;
        Ok(DirectoryResponse {
            users: self.users.lock().await.clone(),
        })
    }

    async fn fetch_history(&self, _caller: &UserId, partner: &UserId) -> Result<HistoryResponse> {
        self.calls.lock().await.push(format!("history:{partner}"));
        let gate = self.history_gates.lock().await.remove(partner);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.failing.lock().await.contains("history") {
            return Err(anyhow!("history unavailable"));
        }
        Ok(HistoryResponse {
            messages: self
                .histories
                .lock()
                .await
                .get(partner)
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn send_message(
        &self,
        _caller: &UserId,
        partner: &UserId,
        _content: &OutgoingMessage,
    ) -> Result<SendMessageResponse> {
        self.calls.lock().await.push(format!("send:{partner}"));
        let gate = self.send_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.failing.lock().await.contains("send") {
            return Err(anyhow!("send unavailable"));
        }
        let message = self.send_reply.lock().await.clone().unwrap_or(MessageRecord {
            id: MessageId::from("sent-1"),
            sender: None,
            text: None,
            attachments: Vec::new(),
            created_at: None,
            status: DeliveryState::Sent,
        });
        Ok(SendMessageResponse { message })
    }
}

type Feed = mpsc::UnboundedSender<std::result::Result<ServerEvent, ChannelError>>;

#[derive(Default)]
pub struct FakeTransport {
    pub opened: Mutex<Vec<UserId>>,
    feeds: Mutex<Vec<Feed>>,
    refuse: AtomicBool,
}

impl FakeTransport {
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub async fn feed(&self, index: usize) -> Feed {
        self.feeds.lock().await[index].clone()
    }

    pub async fn push(&self, event: ServerEvent) {
        self.push_frame(Ok(event)).await;
    }

    pub async fn push_frame(&self, frame: std::result::Result<ServerEvent, ChannelError>) {
        let feeds = self.feeds.lock().await;
        let feed = feeds.last().expect("no channel opened");
        feed.unbounded_send(frame).expect("channel closed");
    }

    /// Ends every open stream as if the server closed the connection.
    pub async fn close_all(&self) {
        self.feeds.lock().await.clear();
    }
}

#[async_trait]
impl ChannelTransport for FakeTransport {
    async fn open(&self, identity: &UserId) -> Result<ChannelStream> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        self.opened.lock().await.push(identity.clone());
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().await.push(tx);
        Ok(rx.boxed())
    }
}

pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut predicate: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("session event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

pub async fn wait_for_call(api: &FakeChatApi, call: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !api.calls().await.iter().any(|made| made == call) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("remote call was not made in time");
}

pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
