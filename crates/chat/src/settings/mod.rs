pub mod state;

pub use state::{ClientSettings, DEFAULT_GREETING, SettingsError, SettingsStore};
