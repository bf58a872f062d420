use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_SCROLL_TOP_THRESHOLD: f32 = 50.0;
pub const DEFAULT_TYPING_QUIET_MS: u64 = 1200;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub pusher_key: String,
    pub pusher_cluster: String,
    /// Overrides the websocket URL derived from key and cluster.
    pub push_ws_url: Option<String>,
    pub auth_endpoint: String,
    pub presence_channel: String,
    pub signal_channel: String,
    pub user_channel_prefix: String,
    pub page_size: usize,
    pub scroll_top_threshold: f32,
    pub typing_quiet_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://globe-chat-api.vercel.app/api/v1".into(),
            pusher_key: "f154a4e3ab24faa32519".into(),
            pusher_cluster: "ap2".into(),
            push_ws_url: None,
            auth_endpoint: "https://globe-chat-api.vercel.app/api/v1/users/pusher/auth".into(),
            presence_channel: "presence-global".into(),
            signal_channel: "presence-globchat".into(),
            user_channel_prefix: "private-chat-".into(),
            page_size: DEFAULT_PAGE_SIZE,
            scroll_top_threshold: DEFAULT_SCROLL_TOP_THRESHOLD,
            typing_quiet_ms: DEFAULT_TYPING_QUIET_MS,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

impl ClientSettings {
    pub fn push_ws_url(&self) -> String {
        self.push_ws_url.clone().unwrap_or_else(|| {
            format!(
                "wss://ws-{}.pusher.com/app/{}?protocol=7&client=rust-client_core&version={}",
                self.pusher_cluster,
                self.pusher_key,
                env!("CARGO_PKG_VERSION")
            )
        })
    }

    pub fn typing_quiet_period(&self) -> Duration {
        Duration::from_millis(self.typing_quiet_ms)
    }

    pub fn reconnect_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
        )
    }
}

/// Defaults, then `path` if it exists, then environment overrides.
pub fn load_settings(path: impl AsRef<Path>) -> anyhow::Result<ClientSettings> {
    let path = path.as_ref();
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => parse_settings(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))
        }
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub fn parse_settings(raw: &str) -> anyhow::Result<ClientSettings> {
    let settings = toml::from_str::<ClientSettings>(raw)?;
    if settings.page_size == 0 {
        anyhow::bail!("page_size must be greater than zero");
    }
    Ok(settings)
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = var("CHAT_PUSHER_KEY") {
        settings.pusher_key = v;
    }
    if let Some(v) = var("CHAT_PUSHER_CLUSTER") {
        settings.pusher_cluster = v;
    }
    if let Some(v) = var("CHAT_PUSH_WS_URL") {
        settings.push_ws_url = Some(v);
    }

    if let Some(v) = var("CHAT_AUTH_ENDPOINT") {
        settings.auth_endpoint = v;
    }
    if let Some(v) = var("APP__AUTH_ENDPOINT") {
        settings.auth_endpoint = v;
    }

    if let Some(v) = var("CHAT_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<usize>() {
            if parsed > 0 {
                settings.page_size = parsed;
            }
        }
    }

    if let Some(v) = var("CHAT_TYPING_QUIET_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.typing_quiet_ms = parsed;
        }
    }
}
