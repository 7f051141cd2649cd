use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{future, stream::BoxStream, StreamExt};
use shared::{domain::UserId, protocol::ServerEvent};
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::info;
use url::Url;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("server url must use http, https, ws or wss: {0}")]
    UnsupportedScheme(String),
    #[error("invalid server event: {0}")]
    InvalidEvent(#[from] serde_json::Error),
    #[error("websocket receive failed: {0}")]
    Receive(#[from] tungstenite::Error),
}

/// Inbound side of an open channel. The stream ends when the remote closes.
pub type ChannelStream = BoxStream<'static, std::result::Result<ServerEvent, ChannelError>>;

/// Opens the realtime event channel for a session identity.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn open(&self, identity: &UserId) -> Result<ChannelStream>;
}

pub struct WebSocketTransport {
    base_url: Url,
}

impl WebSocketTransport {
    pub fn new(server_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        Ok(Self { base_url })
    }

    pub fn channel_url(&self, identity: &UserId) -> std::result::Result<Url, ChannelError> {
        let mut url = self.base_url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ChannelError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| ChannelError::UnsupportedScheme(scheme.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ChannelError::UnsupportedScheme(self.base_url.to_string()))?
            .pop_if_empty()
            .push("ws");
        url.query_pairs_mut()
            .clear()
            .append_pair("user_id", identity.as_str());
        Ok(url)
    }
}

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn open(&self, identity: &UserId) -> Result<ChannelStream> {
        let url = self.channel_url(identity)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        info!(identity = %identity, "channel: websocket connected");

        let events = ws_stream
            .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => {
                        Some(serde_json::from_str::<ServerEvent>(&text).map_err(ChannelError::from))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(ChannelError::from(err))),
                })
            })
            .boxed();
        Ok(events)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
