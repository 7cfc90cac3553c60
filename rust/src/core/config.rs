use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

pub(crate) const CONFIG_FILE_NAME: &str = "supachat_config.json";

/// Optional overrides read from `supachat_config.json` in the data dir.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    /// Run against the in-process backend instead of the hosted service.
    pub disable_network: Option<bool>,
    pub log_filter: Option<String>,
    pub realtime_heartbeat_secs: Option<u64>,
    pub persist_session: Option<bool>,
    pub request_timeout_secs: Option<u64>,
}

impl AppConfig {
    pub fn network_disabled(&self) -> bool {
        self.disable_network == Some(true)
    }

    pub fn persist_session(&self) -> bool {
        self.persist_session != Some(false)
    }

    pub fn log_filter(&self) -> Option<&str> {
        self.log_filter
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn realtime_heartbeat(&self) -> Option<Duration> {
        self.realtime_heartbeat_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Missing file means defaults; an unreadable one is an error the caller logs.
pub(crate) fn load_app_config(data_dir: &str) -> anyhow::Result<AppConfig> {
    let path = Path::new(data_dir).join(CONFIG_FILE_NAME);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AppConfig::default()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}
