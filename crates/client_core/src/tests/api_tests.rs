use super::*;
use crate::types::AttachmentUpload;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use shared::{
    domain::{DeliveryState, Role},
    error::ErrorCode,
};
use std::{collections::HashMap, sync::Arc};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReceivedField {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    body: Vec<u8>,
}

#[derive(Clone, Default)]
struct ServerState {
    callers: Arc<Mutex<Vec<String>>>,
    authorization: Arc<Mutex<Vec<String>>>,
    fields: Arc<Mutex<Vec<ReceivedField>>>,
}

impl ServerState {
    async fn record(&self, query: &HashMap<String, String>, headers: &HeaderMap) {
        if let Some(user_id) = query.get("user_id") {
            self.callers.lock().await.push(user_id.clone());
        }
        if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            self.authorization.lock().await.push(value.to_string());
        }
    }
}

async fn handle_contacts(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    state.record(&query, &headers).await;
    Json(json!({
        "contacts": [
            { "user": { "_id": "u1", "name": "Ada Lovelace", "username": "ada" }, "role": "teacher" },
            { "user": { "uid": "u2", "username": "bob" } }
        ]
    }))
}

async fn handle_directory(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.record(&query, &headers).await;
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "code": "forbidden", "message": "directory restricted" })),
    )
}

async fn handle_history(
    State(state): State<ServerState>,
    Path(partner): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    state.record(&query, &headers).await;
    Json(json!({
        "messages": [
            {
                "_id": "m1",
                "sender": partner,
                "text": "see attached",
                "files": [{ "url": "/files/notes.pdf", "filename": "notes.pdf", "mimeType": "application/pdf" }],
                "createdAt": "2024-03-01T10:00:00Z",
                "status": "seen"
            },
            { "_id": "m2", "senderId": "me" }
        ]
    }))
}

async fn handle_send(
    State(state): State<ServerState>,
    Path(_partner): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Json<serde_json::Value> {
    state.record(&query, &headers).await;
    let mut text = None;
    while let Some(field) = multipart.next_field().await.expect("multipart field") {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let body = field.bytes().await.expect("field body").to_vec();
        if name == "text" {
            text = Some(String::from_utf8_lossy(&body).to_string());
        }
        state.fields.lock().await.push(ReceivedField {
            name,
            file_name,
            content_type,
            body,
        });
    }
    Json(json!({ "message": { "_id": "99", "text": text } }))
}

async fn spawn_chat_server() -> anyhow::Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route("/api/chat/contacts", get(handle_contacts))
        .route("/api/users", get(handle_directory))
        .route(
            "/api/chat/:partner/messages",
            get(handle_history).post(handle_send),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api"), state))
}

#[tokio::test]
async fn fetch_contacts_sends_caller_and_bearer_token() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let api = HttpChatApi::new(&server_url)
        .expect("api")
        .with_bearer_token("session-token");

    let response = api
        .fetch_contacts(&UserId::from("me"))
        .await
        .expect("contacts");

    assert_eq!(response.contacts.len(), 2);
    assert_eq!(response.contacts[0].user.id, Some(UserId::from("u1")));
    assert_eq!(response.contacts[0].role, Some(Role::Teacher));
    assert_eq!(response.contacts[1].user.uid, Some(UserId::from("u2")));
    assert_eq!(*state.callers.lock().await, vec!["me".to_string()]);
    assert_eq!(
        *state.authorization.lock().await,
        vec!["Bearer session-token".to_string()]
    );
}

#[tokio::test]
async fn fetch_directory_surfaces_structured_api_error() {
    let (server_url, _state) = spawn_chat_server().await.expect("spawn server");
    let api = HttpChatApi::new(&server_url).expect("api");

    let err = api
        .fetch_directory(&UserId::from("me"))
        .await
        .expect_err("directory should be rejected");

    let api_error = err
        .downcast_ref::<ApiException>()
        .expect("structured api error");
    assert_eq!(api_error.status, 403);
    assert_eq!(api_error.code, ErrorCode::Forbidden);
    assert_eq!(api_error.message, "directory restricted");
}

#[tokio::test]
async fn fetch_history_accepts_legacy_field_names() {
    let (server_url, _state) = spawn_chat_server().await.expect("spawn server");
    let api = HttpChatApi::new(&server_url).expect("api");

    let response = api
        .fetch_history(&UserId::from("me"), &UserId::from("u1"))
        .await
        .expect("history");

    assert_eq!(response.messages.len(), 2);
    let first = &response.messages[0];
    assert_eq!(first.sender, Some(UserId::from("u1")));
    assert_eq!(first.status, DeliveryState::Seen);
    assert_eq!(first.attachments.len(), 1);
    assert_eq!(first.attachments[0].name.as_deref(), Some("notes.pdf"));
    assert_eq!(
        first.created_at.map(|at| at.to_rfc3339()),
        Some("2024-03-01T10:00:00+00:00".to_string())
    );
    let second = &response.messages[1];
    assert_eq!(second.sender, Some(UserId::from("me")));
    assert_eq!(second.text, None);
    assert_eq!(second.status, DeliveryState::Sent);
}

#[tokio::test]
async fn send_message_posts_text_and_ordered_attachments() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let api = HttpChatApi::new(&server_url).expect("api");
    let content = OutgoingMessage::text("hi")
        .with_attachment(AttachmentUpload {
            filename: "a.txt".to_string(),
            mime_type: Some("text/plain".to_string()),
            bytes: b"first".to_vec(),
        })
        .with_attachment(AttachmentUpload {
            filename: "b.png".to_string(),
            mime_type: None,
            bytes: vec![0x89, 0x50],
        });

    let response = api
        .send_message(&UserId::from("me"), &UserId::from("u1"), &content)
        .await
        .expect("send");

    assert_eq!(response.message.id.as_str(), "99");
    assert_eq!(response.message.text.as_deref(), Some("hi"));
    let fields = state.fields.lock().await.clone();
    let names: Vec<_> = fields.iter().map(|field| field.name.as_str()).collect();
    assert_eq!(names, vec!["text", "files", "files"]);
    assert_eq!(fields[1].file_name.as_deref(), Some("a.txt"));
    assert_eq!(fields[1].content_type.as_deref(), Some("text/plain"));
    assert_eq!(fields[1].body, b"first".to_vec());
    assert_eq!(fields[2].file_name.as_deref(), Some("b.png"));
    assert_eq!(fields[2].body, vec![0x89, 0x50]);
}

#[tokio::test]
async fn send_message_omits_blank_text_field() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let api = HttpChatApi::new(&server_url).expect("api");
    let content = OutgoingMessage {
        text: Some("   ".to_string()),
        attachments: vec![AttachmentUpload {
            filename: "only.txt".to_string(),
            mime_type: None,
            bytes: b"x".to_vec(),
        }],
    };

    api.send_message(&UserId::from("me"), &UserId::from("u1"), &content)
        .await
        .expect("send");

    let fields = state.fields.lock().await.clone();
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].name, "files");
}

#[test]
fn endpoint_keeps_base_path_and_escapes_segments() {
    let api = HttpChatApi::new("https://school.example.edu/api/").expect("api");
    let url = api
        .endpoint(&["chat", "a/b", "messages"])
        .expect("endpoint");
    assert_eq!(
        url.as_str(),
        "https://school.example.edu/api/chat/a%2Fb/messages"
    );
}

#[test]
fn rejects_non_base_server_url() {
    assert!(HttpChatApi::new("mailto:admin@example.edu").is_err());
}
