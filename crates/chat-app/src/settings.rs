use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use pairchat_storage::SqliteOptions;
use pairchat_storage::sqlite::{DEFAULT_CHANGE_FEED_CAPACITY, DEFAULT_MAX_CONNECTIONS};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat_list::{ChatListLabels, DEFAULT_EMPTY_PREVIEW_LABEL, DEFAULT_UNKNOWN_USER_LABEL};

pub const SETTINGS_DIRECTORY_NAME: &str = "pairchat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "pairchat.db";
pub const ENV_PREFIX: &str = "PAIRCHAT_";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// How a send writes the conversation summary and the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    /// Summary first, then the message, as two independent writes.
    #[default]
    Sequential,
    /// Both writes in one transaction.
    Transactional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_database_location")]
    pub database_location: String,
    #[serde(default)]
    pub send_mode: SendMode,
    #[serde(default = "default_unknown_user_label")]
    pub unknown_user_label: String,
    #[serde(default = "default_empty_preview_label")]
    pub empty_preview_label: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_change_feed_capacity")]
    pub change_feed_capacity: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            database_location: default_database_location(),
            send_mode: SendMode::default(),
            unknown_user_label: default_unknown_user_label(),
            empty_preview_label: default_empty_preview_label(),
            log_filter: default_log_filter(),
            max_connections: default_max_connections(),
            change_feed_capacity: default_change_feed_capacity(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.database_location = non_blank_or(self.database_location, default_database_location);
        self.unknown_user_label =
            non_blank_or(self.unknown_user_label, default_unknown_user_label);
        self.empty_preview_label =
            non_blank_or(self.empty_preview_label, default_empty_preview_label);
        self.log_filter = non_blank_or(self.log_filter, default_log_filter);
        self.max_connections = self.max_connections.max(1);
        self.change_feed_capacity = self.change_feed_capacity.max(1);
        self
    }

    pub fn chat_list_labels(&self) -> ChatListLabels {
        ChatListLabels {
            unknown_user: self.unknown_user_label.clone(),
            empty_preview: self.empty_preview_label.clone(),
        }
    }

    pub fn sqlite_options(&self) -> SqliteOptions {
        SqliteOptions {
            max_connections: self.max_connections,
            change_feed_capacity: self.change_feed_capacity,
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".pairchat"))
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

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// File values override defaults; `PAIRCHAT_*` variables override both.
    fn load_from_disk(path: &Path) -> ChatSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        let figment = Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
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

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_database_location() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".pairchat"))
        .join(DATABASE_FILE_NAME)
        .display()
        .to_string()
}

fn default_unknown_user_label() -> String {
    DEFAULT_UNKNOWN_USER_LABEL.to_string()
}

fn default_empty_preview_label() -> String {
    DEFAULT_EMPTY_PREVIEW_LABEL.to_string()
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_change_feed_capacity() -> usize {
    DEFAULT_CHANGE_FEED_CAPACITY
}
