use std::{collections::HashMap, fs, path::PathBuf};

const CONFIG_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Base of the request/response API, e.g. `https://chat.example.edu/api`.
    pub server_url: String,
    /// Base the realtime channel is derived from. Falls back to `server_url`.
    pub channel_url: Option<String>,
    pub session_file: PathBuf,
    pub bearer_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080/api".into(),
            channel_url: None,
            session_file: PathBuf::from("session.json"),
            bearer_token: None,
        }
    }
}

impl Settings {
    pub fn channel_base(&self) -> &str {
        self.channel_url.as_deref().unwrap_or(&self.server_url)
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string(CONFIG_FILE).ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Layers `raw_file` (TOML, string values) and then environment variables
/// over the defaults. `APP__*` names win over the legacy `CHAT_*` names.
pub fn load_settings_from<F>(raw_file: Option<&str>, env: F) -> Settings
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = Settings::default();

    if let Some(raw) = raw_file {
        match toml::from_str::<HashMap<String, String>>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("server_url") {
                    settings.server_url = v.clone();
                }
                if let Some(v) = file_cfg.get("channel_url") {
                    settings.channel_url = Some(v.clone());
                }
                if let Some(v) = file_cfg.get("session_file") {
                    settings.session_file = PathBuf::from(v);
                }
                if let Some(v) = file_cfg.get("bearer_token") {
                    settings.bearer_token = Some(v.clone());
                }
            }
            Err(err) => tracing::warn!("config: ignoring unreadable {CONFIG_FILE}: {err}"),
        }
    }

    if let Some(v) = env("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = env("CHAT_CHANNEL_URL") {
        settings.channel_url = Some(v);
    }
    if let Some(v) = env("APP__CHANNEL_URL") {
        settings.channel_url = Some(v);
    }

    if let Some(v) = env("CHAT_SESSION_FILE") {
        settings.session_file = PathBuf::from(v);
    }
    if let Some(v) = env("APP__SESSION_FILE") {
        settings.session_file = PathBuf::from(v);
    }

    if let Some(v) = env("CHAT_TOKEN") {
        settings.bearer_token = Some(v);
    }
    if let Some(v) = env("APP__BEARER_TOKEN") {
        settings.bearer_token = Some(v);
    }

    settings
}
