pub mod state;

pub use state::{
    PromptSettings, ProviderSettings, Settings, SettingsError, SettingsStore, StorageSettings,
};
