//! Layered configuration
//!
//! Defaults, user and repository TOML files, environment and CLI overrides
//! are merged as JSON values and deserialized into [`Settings`].

mod defaults;
mod merge;
mod settings;

pub use defaults::{BuiltinDefaults, DEFAULT_IGNORE_FILE, DEFAULT_POLL_INTERVAL_MS};
pub use merge::{deep_merge, merge_layers};
pub use settings::{
    ArchiveSettings, BuildSettings, ConfigError, ConfigOrigin, ConfigPaths, ConfigSource,
    HttpSettings, Settings, WatchSettings, ENV_API_HOST, ENV_API_TOKEN, REPO_CONFIG_FILE,
};
