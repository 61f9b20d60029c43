use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_llm::{DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_VISION_MAX_TOKENS, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::{ChatPrompts, DEFAULT_SYSTEM_PROMPT, DEFAULT_VISION_PROMPT};

pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "murmur.db";
pub const ENV_PREFIX: &str = "MURMUR_";
pub const DEFAULT_USER_ID: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub vision_max_tokens: u64,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: String::new(),
            vision_max_tokens: DEFAULT_VISION_MAX_TOKENS,
            idle_timeout_secs: None,
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.endpoint, &self.model)
            .with_api_key(&self.api_key)
            .with_vision_max_tokens(self.vision_max_tokens)
            .with_idle_timeout(
                self.idle_timeout_secs
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    pub system_prompt: String,
    pub vision_prompt: String,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            vision_prompt: DEFAULT_VISION_PROMPT.to_string(),
        }
    }
}

impl PromptSettings {
    pub fn to_chat_prompts(&self) -> ChatPrompts {
        ChatPrompts {
            system_prompt: self.system_prompt.clone(),
            vision_prompt: self.vision_prompt.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Keep chats in memory only; nothing is written to disk.
    pub in_memory: bool,
    pub database_path: Option<PathBuf>,
}

impl StorageSettings {
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join(DATABASE_FILE_NAME))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub user_id: String,
    pub provider: ProviderSettings,
    pub prompts: PromptSettings,
    pub storage: StorageSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_id: DEFAULT_USER_ID.to_string(),
            provider: ProviderSettings::default(),
            prompts: PromptSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.user_id = self.user_id.trim().to_string();
        if self.user_id.is_empty() {
            self.user_id = DEFAULT_USER_ID.to_string();
        }

        self.provider.endpoint = self.provider.endpoint.trim().to_string();
        if self.provider.endpoint.is_empty() {
            self.provider.endpoint = DEFAULT_ENDPOINT.to_string();
        }
        self.provider.model = self.provider.model.trim().to_string();
        if self.provider.model.is_empty() {
            self.provider.model = DEFAULT_MODEL.to_string();
        }
        self.provider.api_key = self.provider.api_key.trim().to_string();

        if self.prompts.system_prompt.trim().is_empty() {
            self.prompts.system_prompt = DEFAULT_SYSTEM_PROMPT.to_string();
        }
        if self.prompts.vision_prompt.trim().is_empty() {
            self.prompts.vision_prompt = DEFAULT_VISION_PROMPT.to_string();
        }
        self
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".murmur"))
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
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

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Applies `change` to a copy of the current settings and persists the result.
    pub fn update_with(
        &self,
        change: impl FnOnce(&mut Settings),
    ) -> Result<Arc<Settings>, SettingsError> {
        let mut next = Settings::clone(&self.settings());
        change(&mut next);
        self.update(next)?;
        Ok(self.settings())
    }

    fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        // Missing files contribute nothing; the environment still applies.
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        let encoded = serde_json::to_vec_pretty(settings).context(EncodeSettingsSnafu {
            stage: "encode-settings",
        })?;
        write_atomically(&self.config_path, &encoded)?;
        tracing::info!(path = ?self.config_path, "settings saved");
        Ok(())
    }
}

/// Replaces `path` through a sibling temp file and a rename.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), SettingsError> {
    if let Some(directory) = path.parent() {
        std::fs::create_dir_all(directory).context(CreateSettingsDirSnafu {
            stage: "create-settings-dir",
            path: directory.to_path_buf(),
        })?;
    }

    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, contents).context(WriteSettingsSnafu {
        stage: "write-staged-settings",
        path: staging.clone(),
    })?;
    std::fs::rename(&staging, path).context(ReplaceSettingsSnafu {
        stage: "replace-settings-file",
        staging,
        target: path.to_path_buf(),
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create settings directory {path:?} on `{stage}`: {source}"))]
    CreateSettingsDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings on `{stage}`: {source}"))]
    EncodeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write settings to {path:?} on `{stage}`: {source}"))]
    WriteSettings {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot move {staging:?} over {target:?} on `{stage}`: {source}"))]
    ReplaceSettings {
        stage: &'static str,
        staging: PathBuf,
        target: PathBuf,
        source: std::io::Error,
    },
}
