//! Built-in defaults (layer 1)

use serde_json::{json, Value};

/// Default poll interval for build and run polling, in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default name of the per-root ignore file
pub const DEFAULT_IGNORE_FILE: &str = ".taskpilotignore";

/// Built-in default configuration values
#[derive(Debug, Clone)]
pub struct BuiltinDefaults {
    pub api_host: String,
    pub build_local: bool,
    pub build_push: bool,
    pub build_poll_interval_ms: u64,
    pub watch_poll_interval_ms: u64,
    pub ignore_file: String,
    pub connect_timeout_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            api_host: taskpilot_api::DEFAULT_HOST.to_string(),
            build_local: false,
            build_push: true,
            build_poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            watch_poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            connect_timeout_seconds: 30,
            timeout_seconds: 120,
        }
    }
}

impl BuiltinDefaults {
    /// Layer value in the same shape as the config files
    pub fn to_value(&self) -> Value {
        json!({
            "api_host": self.api_host,
            "build": {
                "local": self.build_local,
                "push": self.build_push,
                "poll_interval_ms": self.build_poll_interval_ms,
            },
            "watch": {
                "poll_interval_ms": self.watch_poll_interval_ms,
            },
            "archive": {
                "ignore_file": self.ignore_file,
            },
            "http": {
                "connect_timeout_seconds": self.connect_timeout_seconds,
                "timeout_seconds": self.timeout_seconds,
            },
        })
    }
}
