use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "chat_sync.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    /// Transport-level reconnect attempts after a drop before giving up.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub history_page_size: u32,
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".into(),
            auth_token: None,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            history_page_size: 50,
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    base_url: Option<String>,
    auth_token: Option<String>,
    reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    history_page_size: Option<u32>,
    event_buffer: Option<usize>,
}

impl SyncConfig {
    pub fn page_size(&self) -> u32 {
        self.history_page_size.clamp(1, 100)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.base_url {
            self.base_url = v;
        }
        if let Some(v) = file.auth_token {
            self.auth_token = Some(v);
        }
        if let Some(v) = file.reconnect_attempts {
            self.reconnect_attempts = v;
        }
        if let Some(v) = file.reconnect_delay_ms {
            self.reconnect_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.history_page_size {
            self.history_page_size = v;
        }
        if let Some(v) = file.event_buffer {
            self.event_buffer = v;
        }
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("APP__BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("APP__AUTH_TOKEN") {
            self.auth_token = Some(v);
        }
        if let Some(v) = lookup("APP__RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.reconnect_attempts = v;
        }
        if let Some(v) = lookup("APP__RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.reconnect_delay = Duration::from_millis(v);
        }
        if let Some(v) = lookup("APP__HISTORY_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.history_page_size = v;
        }
        if let Some(v) = lookup("APP__EVENT_BUFFER").and_then(|v| v.parse().ok()) {
            self.event_buffer = v;
        }
    }
}

/// Defaults, then `chat_sync.toml` in the working directory, then `APP__*` variables.
pub fn load_config() -> anyhow::Result<SyncConfig> {
    load_config_from(Path::new(DEFAULT_CONFIG_FILE), |key| std::env::var(key).ok())
}

pub fn load_config_from<F>(path: &Path, lookup: F) -> anyhow::Result<SyncConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = SyncConfig::default();

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let file: FileConfig = toml::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.apply_file(file);
    }

    config.apply_env(lookup);
    config.base_url = config.base_url.trim_end_matches('/').to_string();
    Ok(config)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
