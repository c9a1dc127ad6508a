// Конфигурация приложения
// Уровень логирования по умолчанию зависит от режима сборки

use crate::error::{CallError, Result};
use crate::peer::types::ServerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "arcall=debug,arcall_lib=debug,info"; // В режиме отладки подробный лог

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "info"; // В продакшене только info и выше

/// Переменные окружения, перекрывающие значения из файла
pub const ENV_SERVER_URL: &str = "ARCALL_SERVER_URL";
pub const ENV_LOG_FILTER: &str = "ARCALL_LOG";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub signaling: SignalingSettings,
    pub media: MediaSettings,
    pub identity: LocalIdentity,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Базовый URL сервера Nextcloud, например `https://cloud.example.org/`
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Интервалы опроса сервера сигнализации
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingSettings {
    pub poll_interval_ms: u64,
    pub backoff_interval_ms: u64,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            backoff_interval_ms: 5000,
        }
    }
}

impl SignalingSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_interval(&self) -> Duration {
        Duration::from_millis(self.backoff_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    pub data_channel_label: String,
    /// Пустой список означает дефолтные STUN серверы
    pub ice_servers: Vec<ServerConfig>,
    pub grace_period_secs: u64,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            data_channel_label: crate::peer::DATA_CHANNEL_LABEL.to_string(),
            ice_servers: Vec::new(),
            grace_period_secs: crate::peer::GRACE_PERIOD.as_secs(),
        }
    }
}

impl MediaSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Локальный пользователь: отправитель сообщений и файлов
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LocalIdentity {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub filter: String,
    /// Каталог журнала звонков (JSON lines)
    pub sink_dir: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            sink_dir: PathBuf::from("call-logs"),
        }
    }
}

impl Config {
    /// Читает TOML файл (если задан) и применяет переменные окружения
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    CallError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| CallError::Config(e.to_string()))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_SERVER_URL) {
            self.server.base_url = url;
        }
        if let Some(filter) = lookup(ENV_LOG_FILTER) {
            self.log.filter = filter;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.base_url.is_empty() {
            return Err(CallError::Config(format!(
                "server.base_url is empty (set it in the config file or {})",
                ENV_SERVER_URL
            )));
        }
        if self.signaling.poll_interval_ms == 0 || self.signaling.backoff_interval_ms == 0 {
            return Err(CallError::Config("poll intervals must be non-zero".into()));
        }
        if self.media.data_channel_label.is_empty() {
            return Err(CallError::Config("media.data_channel_label is empty".into()));
        }

        // Валидация серверов
        for server in &self.media.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::Config("ICE server URL cannot be empty".into()));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::Config(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}
