use std::{io::ErrorKind, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;
use shared::domain::UserId;

#[derive(Debug, Deserialize)]
struct StoredSession {
    user_id: Option<UserId>,
    #[serde(rename = "_id")]
    id: Option<UserId>,
    uid: Option<UserId>,
}

impl StoredSession {
    /// `user_id` wins over the backend's `_id`, which wins over `uid`.
    fn identity(self) -> Option<UserId> {
        [self.user_id, self.id, self.uid]
            .into_iter()
            .flatten()
            .find(|id| !id.as_str().is_empty())
    }
}

/// Reads the signed-in identity left behind by the login flow. A missing
/// file means nobody is signed in.
pub async fn read_identity(path: &Path) -> Result<Option<UserId>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read session file {}", path.display()))
        }
    };
    parse_identity(&raw).with_context(|| format!("malformed session file {}", path.display()))
}

fn parse_identity(raw: &str) -> Result<Option<UserId>> {
    let stored: StoredSession = serde_json::from_str(raw)?;
    Ok(stored.identity())
}
