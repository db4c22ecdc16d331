use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use ragchat_stream::{
    ChatMode, DEFAULT_BASE_URL, DEFAULT_MAX_RECORD_BYTES, StreamOptions, TransportConfig,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tempfile::NamedTempFile;

pub const SETTINGS_DIRECTORY_NAME: &str = "ragchat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "RAGCHAT_";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_GREETING: &str =
    "Hello! I'm a RAG bot. You can ask me questions about the documents you upload.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub default_mode: ChatMode,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: Option<u64>,
    /// Longest silence tolerated between two body chunks; unset waits forever.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
    #[serde(default = "default_greeting")]
    pub greeting: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_id: None,
            default_mode: ChatMode::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: None,
            max_record_bytes: default_max_record_bytes(),
            greeting: default_greeting(),
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        let base_url = self.base_url.trim().trim_end_matches('/');
        self.base_url = if base_url.is_empty() {
            default_base_url()
        } else {
            base_url.to_string()
        };
        self.user_id = non_blank(self.user_id);
        self.greeting = non_blank(self.greeting);
        self.connect_timeout_secs = self.connect_timeout_secs.filter(|secs| *secs > 0);
        self.idle_timeout_secs = self.idle_timeout_secs.filter(|secs| *secs > 0);
        if self.max_record_bytes == 0 {
            self.max_record_bytes = default_max_record_bytes();
        }

        self
    }

    pub fn transport_config(&self) -> TransportConfig {
        let config = TransportConfig::new(&self.base_url);
        match self.connect_timeout_secs {
            Some(secs) => config.with_connect_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            max_record_bytes: self.max_record_bytes,
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".ragchat"))
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

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    /// Applies `edit` to the current settings, writes them to disk and swaps
    /// them in. The in-memory value is left alone when the write fails.
    pub fn update<F>(&self, edit: F) -> Result<Arc<ClientSettings>, SettingsError>
    where
        F: FnOnce(&mut ClientSettings),
    {
        let mut next = (*self.settings()).clone();
        edit(&mut next);
        let next = Arc::new(next.normalized());

        self.save(&next)?;
        self.settings.store(Arc::clone(&next));
        Ok(next)
    }

    /// Defaults, then the JSON file, then `RAGCHAT_*` environment variables.
    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    fn load_from_disk(path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        match Self::figment(path).extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ClientSettings::default()
            }
        }
    }

    // The temp file lives next to the target so `persist` is a same-volume rename.
    fn save(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        let directory = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(directory).context(PrepareDirectorySnafu {
            stage: "save-settings",
            path: directory.to_path_buf(),
        })?;

        let json = serde_json::to_vec_pretty(settings).context(EncodeSnafu {
            stage: "save-settings",
        })?;

        let mut staged = NamedTempFile::new_in(directory).context(StageSnafu {
            stage: "save-settings",
            path: directory.to_path_buf(),
        })?;
        staged.write_all(&json).context(StageSnafu {
            stage: "save-settings",
            path: staged.path().to_path_buf(),
        })?;
        staged
            .persist(&self.config_path)
            .map_err(|error| error.error)
            .context(ReplaceSnafu {
                stage: "save-settings",
                path: self.config_path.clone(),
            })?;

        tracing::info!(path = ?self.config_path, mode = settings.default_mode.as_str(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create settings directory {path:?} on `{stage}`: {source}"))]
    PrepareDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot stage settings in {path:?} on `{stage}`: {source}"))]
    Stage {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot replace settings file {path:?} on `{stage}`: {source}"))]
    Replace {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_connect_timeout_secs() -> Option<u64> {
    Some(DEFAULT_CONNECT_TIMEOUT_SECS)
}

fn default_max_record_bytes() -> usize {
    DEFAULT_MAX_RECORD_BYTES
}

fn default_greeting() -> Option<String> {
    Some(DEFAULT_GREETING.to_string())
}
