use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use tracing::warn;
use url::Url;

const ENV_PREFIX: &str = "CHAT__";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub api_base_url: String,
    pub ws_base_url: Option<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub token_refresh_leeway_secs: i64,
    pub event_buffer: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api/".into(),
            ws_base_url: None,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            token_refresh_leeway_secs: 30,
            event_buffer: 256,
        }
    }
}

impl ChatSettings {
    /// REST base, normalized to end in `/` so relative endpoint joins keep its path.
    pub fn api_base(&self) -> anyhow::Result<Url> {
        let mut raw = self.api_base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).with_context(|| format!("invalid api_base_url '{raw}'"))
    }

    /// Push channel base. Falls back to the API host with `ws`/`wss` scheme.
    pub fn ws_base(&self) -> anyhow::Result<Url> {
        if let Some(raw) = &self.ws_base_url {
            return Url::parse(raw.trim()).with_context(|| format!("invalid ws_base_url '{raw}'"));
        }

        let api = self.api_base_url.trim();
        let derived = if api.starts_with("https://") {
            api.replacen("https://", "wss://", 1)
        } else if api.starts_with("http://") {
            api.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("api_base_url must start with http:// or https://"));
        };
        let mut url =
            Url::parse(&derived).with_context(|| format!("invalid derived ws url '{derived}'"))?;
        url.set_path("/");
        url.set_query(None);
        Ok(url)
    }

    pub fn connection_settings(&self) -> anyhow::Result<ConnectionSettings> {
        Ok(ConnectionSettings {
            ws_base_url: self.ws_base()?,
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            event_buffer: self.event_buffer.max(1),
        })
    }

    pub fn token_refresh_leeway(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_leeway_secs.max(0))
    }
}

/// Reconnect policy and channel location used by the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub ws_base_url: Url,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub event_buffer: usize,
}

impl ConnectionSettings {
    /// `min(base * 2^attempt, cap)` for a zero-based attempt number.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.reconnect_max_delay)
    }

    /// Default reconnect policy against the given channel base.
    pub fn new(ws_base_url: Url) -> Self {
        let defaults = ChatSettings::default();
        Self {
            ws_base_url,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(defaults.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(defaults.reconnect_max_delay_ms),
            event_buffer: defaults.event_buffer,
        }
    }
}

/// Defaults, then the optional TOML file, then `CHAT__*` environment overrides.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ChatSettings> {
    let mut settings = match path {
        Some(path) if path.exists() => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
            toml::from_str::<ChatSettings>(&raw)
                .with_context(|| format!("failed to parse settings file '{}'", path.display()))?
        }
        _ => ChatSettings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_env_overrides(settings: &mut ChatSettings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("WS_BASE_URL") {
        settings.ws_base_url = Some(v);
    }
    if let Some(v) = var("MAX_RECONNECT_ATTEMPTS") {
        override_parsed(&mut settings.max_reconnect_attempts, "MAX_RECONNECT_ATTEMPTS", &v);
    }
    if let Some(v) = var("RECONNECT_BASE_DELAY_MS") {
        override_parsed(&mut settings.reconnect_base_delay_ms, "RECONNECT_BASE_DELAY_MS", &v);
    }
    if let Some(v) = var("RECONNECT_MAX_DELAY_MS") {
        override_parsed(&mut settings.reconnect_max_delay_ms, "RECONNECT_MAX_DELAY_MS", &v);
    }
    if let Some(v) = var("TOKEN_REFRESH_LEEWAY_SECS") {
        override_parsed(
            &mut settings.token_refresh_leeway_secs,
            "TOKEN_REFRESH_LEEWAY_SECS",
            &v,
        );
    }
    if let Some(v) = var("EVENT_BUFFER") {
        override_parsed(&mut settings.event_buffer, "EVENT_BUFFER", &v);
    }
}

fn override_parsed<T: std::str::FromStr>(slot: &mut T, name: &str, raw: &str) {
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(
            variable = %format!("{ENV_PREFIX}{name}"),
            value = raw,
            "ignoring unparsable settings override"
        ),
    }
}
