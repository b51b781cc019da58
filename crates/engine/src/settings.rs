use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_transport::{ChatTransportConfig, StaticToken, StreamFraming};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::coordinator::DEFAULT_CANCELED_MESSAGE;

pub const DEFAULT_CHAT_ENDPOINT: &str = "http://127.0.0.1:8000/api/chat";
pub const DEFAULT_HISTORY_ENDPOINT: &str = "http://127.0.0.1:8000/api/chats";
pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_chat_endpoint")]
    pub chat_endpoint: String,
    #[serde(default = "default_history_endpoint")]
    pub history_endpoint: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub framing: StreamFraming,
    #[serde(default = "default_canceled_message")]
    pub canceled_message: String,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            chat_endpoint: default_chat_endpoint(),
            history_endpoint: default_history_endpoint(),
            api_token: String::new(),
            framing: StreamFraming::default(),
            canceled_message: default_canceled_message(),
            request_timeout_secs: None,
            read_timeout_secs: None,
        }
    }
}

impl EngineSettings {
    pub fn normalized(mut self) -> Self {
        self.chat_endpoint = non_blank_or(self.chat_endpoint, default_chat_endpoint);
        self.history_endpoint = non_blank_or(self.history_endpoint, default_history_endpoint);
        self.api_token = self.api_token.trim().to_string();
        self.canceled_message = non_blank_or(self.canceled_message, default_canceled_message);
        self.request_timeout_secs = self.request_timeout_secs.filter(|secs| *secs > 0);
        self.read_timeout_secs = self.read_timeout_secs.filter(|secs| *secs > 0);
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }

    pub fn chat_transport_config(&self) -> ChatTransportConfig {
        let mut config = ChatTransportConfig::new(&self.chat_endpoint).with_framing(self.framing);
        if let Some(timeout) = self.request_timeout() {
            config = config.with_request_timeout(timeout);
        }
        if let Some(timeout) = self.read_timeout() {
            config = config.with_read_timeout(timeout);
        }
        config
    }

    pub fn auth(&self) -> StaticToken {
        StaticToken::new(&self.api_token)
    }

    /// Assigns one field from its textual form, as typed in the shell.
    /// Timeouts accept `none` to clear them.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let value = value.trim();
        match key {
            "chat_endpoint" => self.chat_endpoint = value.to_string(),
            "history_endpoint" => self.history_endpoint = value.to_string(),
            "api_token" => self.api_token = value.to_string(),
            "canceled_message" => self.canceled_message = value.to_string(),
            "framing" => {
                let raw = serde_json::Value::String(value.to_string());
                self.framing = serde_json::from_value::<StreamFraming>(raw).ok().context(InvalidValueSnafu {
                    stage: "set-settings-field",
                    key,
                    value,
                })?;
            }
            "request_timeout_secs" => self.request_timeout_secs = parse_timeout(key, value)?,
            "read_timeout_secs" => self.read_timeout_secs = parse_timeout(key, value)?,
            _ => {
                return UnknownKeySnafu {
                    stage: "set-settings-field",
                    key,
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Lines for display with the token masked.
    pub fn describe(&self) -> Vec<String> {
        let token = if self.api_token.is_empty() {
            "(none)"
        } else {
            "(set)"
        };
        let timeout = |secs: Option<u64>| {
            secs.map_or_else(|| "none".to_string(), |secs| secs.to_string())
        };
        vec![
            format!("chat_endpoint = {}", self.chat_endpoint),
            format!("history_endpoint = {}", self.history_endpoint),
            format!("api_token = {token}"),
            format!("framing = {}", framing_name(self.framing)),
            format!("canceled_message = {}", self.canceled_message),
            format!("request_timeout_secs = {}", timeout(self.request_timeout_secs)),
            format!("read_timeout_secs = {}", timeout(self.read_timeout_secs)),
        ]
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<EngineSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<EngineSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: EngineSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Changes one field, persists, and returns the stored result.
    pub fn set_value(&self, key: &str, value: &str) -> Result<Arc<EngineSettings>, SettingsError> {
        let mut settings = EngineSettings::clone(&self.settings());
        settings.set_field(key, value)?;
        self.update(settings)?;
        tracing::info!(key, "updated setting");
        Ok(self.settings())
    }

    fn load_from_disk(path: &Path) -> EngineSettings {
        let mut figment = Figment::from(Serialized::defaults(EngineSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<EngineSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                EngineSettings::default()
            }
        }
    }

    fn persist(&self, settings: &EngineSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("unknown setting '{key}' on `{stage}`"))]
    UnknownKey { stage: &'static str, key: String },
    #[snafu(display("invalid value '{value}' for setting '{key}' on `{stage}`"))]
    InvalidValue {
        stage: &'static str,
        key: String,
        value: String,
    },
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn parse_timeout(key: &str, value: &str) -> Result<Option<u64>, SettingsError> {
    if value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    value.parse::<u64>().map(Some).ok().context(InvalidValueSnafu {
        stage: "parse-timeout-setting",
        key,
        value,
    })
}

fn framing_name(framing: StreamFraming) -> &'static str {
    match framing {
        StreamFraming::EventLines => "event_lines",
        StreamFraming::PlainText => "plain_text",
    }
}

fn non_blank_or(value: String, default: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default()
    } else {
        trimmed.to_string()
    }
}

fn default_chat_endpoint() -> String {
    DEFAULT_CHAT_ENDPOINT.to_string()
}

fn default_history_endpoint() -> String {
    DEFAULT_HISTORY_ENDPOINT.to_string()
}

fn default_canceled_message() -> String {
    DEFAULT_CANCELED_MESSAGE.to_string()
}
