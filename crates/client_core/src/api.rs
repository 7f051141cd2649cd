use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, RequestBuilder, Response,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::UserId,
    error::{ApiError, ApiException},
    protocol::{ContactsResponse, DirectoryResponse, HistoryResponse, SendMessageResponse},
};
use url::Url;

use crate::types::OutgoingMessage;

/// Remote calls consumed by the chat core. Every call is made on behalf of
/// `caller`, the current session identity.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_contacts(&self, caller: &UserId) -> Result<ContactsResponse>;
    async fn fetch_directory(&self, caller: &UserId) -> Result<DirectoryResponse>;
    async fn fetch_history(&self, caller: &UserId, partner: &UserId) -> Result<HistoryResponse>;
    async fn send_message(
        &self,
        caller: &UserId,
        partner: &UserId,
        content: &OutgoingMessage,
    ) -> Result<SendMessageResponse>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpChatApi {
    pub fn new(server_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("server url cannot be used as a base: {server_url}"));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot be used as a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder, caller: &UserId) -> RequestBuilder {
        let request = request.query(&[("user_id", caller.as_str())]);
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn decode_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .with_context(|| format!("malformed response body from {}", status));
    }

    let body = response.bytes().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_slice::<ApiError>(&body) {
        return Err(ApiException::from_body(status.as_u16(), api_error).into());
    }
    Err(anyhow!("remote call failed with status {status}"))
}

fn build_form(content: &OutgoingMessage) -> Result<Form> {
    let mut form = Form::new();
    if let Some(text) = content.sendable_text() {
        form = form.text("text", text.to_string());
    }
    for attachment in &content.attachments {
        let mut part =
            Part::bytes(attachment.bytes.clone()).file_name(attachment.filename.clone());
        if let Some(mime_type) = &attachment.mime_type {
            part = part
                .mime_str(mime_type)
                .with_context(|| format!("invalid mime type for {}", attachment.filename))?;
        }
        form = form.part("files", part);
    }
    Ok(form)
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_contacts(&self, caller: &UserId) -> Result<ContactsResponse> {
        let url = self.endpoint(&["chat", "contacts"])?;
        let response = self
            .authorized(self.http.get(url), caller)
            .send()
            .await
            .context("contacts request failed")?;
        decode_response(response).await
    }

    async fn fetch_directory(&self, caller: &UserId) -> Result<DirectoryResponse> {
        let url = self.endpoint(&["users"])?;
        let response = self
            .authorized(self.http.get(url), caller)
            .send()
            .await
            .context("directory request failed")?;
        decode_response(response).await
    }

    async fn fetch_history(&self, caller: &UserId, partner: &UserId) -> Result<HistoryResponse> {
        let url = self.endpoint(&["chat", partner.as_str(), "messages"])?;
        let response = self
            .authorized(self.http.get(url), caller)
            .send()
            .await
            .with_context(|| format!("history request for {partner} failed"))?;
        decode_response(response).await
    }

    async fn send_message(
        &self,
        caller: &UserId,
        partner: &UserId,
        content: &OutgoingMessage,
    ) -> Result<SendMessageResponse> {
        let url = self.endpoint(&["chat", partner.as_str(), "messages"])?;
        let form = build_form(content)?;
        let response = self
            .authorized(self.http.post(url), caller)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("send request to {partner} failed"))?;
        decode_response(response).await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
