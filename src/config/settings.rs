//! Typed settings resolved from all configuration layers
//!
//! Layers, lowest precedence first:
//! 1. Built-in defaults
//! 2. User config (`~/.config/taskpilot/config.toml`)
//! 3. Repository config (`.taskpilot.toml` in the working directory)
//! 4. Environment (`TASKPILOT_API_HOST`, `TASKPILOT_API_TOKEN`)
//! 5. CLI overrides

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use taskpilot_api::HttpClientConfig;

use super::defaults::BuiltinDefaults;
use super::merge::{merge_layers, toml_to_json};

pub const ENV_API_HOST: &str = "TASKPILOT_API_HOST";
pub const ENV_API_TOKEN: &str = "TASKPILOT_API_TOKEN";

/// Repository config file name
pub const REPO_CONFIG_FILE: &str = ".taskpilot.toml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Origin of a configuration layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    User,
    Repo,
    Env,
    Cli,
}

/// A contributing layer, with the digest of its file when there is one
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildSettings {
    /// Build with the local docker daemon instead of the remote builder
    pub local: bool,
    /// Push locally built images
    pub push: bool,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSettings {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveSettings {
    pub ignore_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    pub connect_timeout_seconds: u64,
    pub timeout_seconds: u64,
}

/// Resolved settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub api_host: String,
    #[serde(default)]
    pub api_token: Option<String>,
    pub build: BuildSettings,
    pub watch: WatchSettings,
    pub archive: ArchiveSettings,
    pub http: HttpSettings,
    #[serde(skip)]
    pub sources: Vec<ConfigSource>,
}

/// Where the file layers are read from
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    pub user: Option<PathBuf>,
    pub repo: Option<PathBuf>,
}

impl ConfigPaths {
    /// Standard locations for the current user and working directory
    pub fn discover(cwd: &Path) -> Self {
        let user = std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".config").join("taskpilot").join("config.toml"));
        Self {
            user,
            repo: Some(cwd.join(REPO_CONFIG_FILE)),
        }
    }
}

impl Settings {
    /// Resolve settings from every layer.
    ///
    /// `env` looks up environment variables; the binary passes
    /// `std::env::var(..).ok()`.
    pub fn load(
        paths: &ConfigPaths,
        env: &dyn Fn(&str) -> Option<String>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        for (origin, path) in [
            (ConfigOrigin::User, paths.user.as_deref()),
            (ConfigOrigin::Repo, paths.repo.as_deref()),
        ] {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            let (value, digest) = load_toml_file(path)?;
            tracing::debug!(path = %path.display(), %digest, "loaded config layer");
            layers.push(value);
            sources.push(ConfigSource {
                origin,
                path: Some(path.to_path_buf()),
                digest: Some(digest),
            });
        }

        let env_layer = env_layer(env);
        if env_layer.as_object().is_some_and(|m| !m.is_empty()) {
            layers.push(env_layer);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Env,
                path: None,
                digest: None,
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let mut settings: Settings = serde_json::from_value(merged)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        settings.sources = sources;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.build.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "build.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watch.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.api_host.trim().is_empty() {
            return Err(ConfigError::Invalid("api_host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Contributing layers, lowest precedence first, as
    /// `builtin, repo .taskpilot.toml@1a2b3c4d, cli`
    pub fn describe_sources(&self) -> String {
        self.sources
            .iter()
            .map(|source| {
                let origin = match source.origin {
                    ConfigOrigin::Builtin => "builtin",
                    ConfigOrigin::User => "user",
                    ConfigOrigin::Repo => "repo",
                    ConfigOrigin::Env => "env",
                    ConfigOrigin::Cli => "cli",
                };
                match (&source.path, &source.digest) {
                    (Some(path), Some(digest)) => format!(
                        "{origin} {}@{}",
                        path.display(),
                        digest.get(..8).unwrap_or(digest)
                    ),
                    (Some(path), None) => format!("{origin} {}", path.display()),
                    _ => origin.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn build_poll_interval(&self) -> Duration {
        Duration::from_millis(self.build.poll_interval_ms)
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch.poll_interval_ms)
    }

    /// HTTP client configuration for the API
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            host: self.api_host.clone(),
            token: self.api_token.clone(),
            connect_timeout: Duration::from_secs(self.http.connect_timeout_seconds),
            timeout: Duration::from_secs(self.http.timeout_seconds),
        }
    }
}

fn env_layer(env: &dyn Fn(&str) -> Option<String>) -> Value {
    let mut layer = serde_json::Map::new();
    if let Some(host) = env(ENV_API_HOST).filter(|v| !v.is_empty()) {
        layer.insert("api_host".to_string(), json!(host));
    }
    if let Some(token) = env(ENV_API_TOKEN).filter(|v| !v.is_empty()) {
        layer.insert("api_token".to_string(), json!(token));
    }
    Value::Object(layer)
}

/// Read a TOML layer, returning it as JSON plus the SHA-256 of the raw bytes
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let digest = hex::encode(Sha256::digest(&bytes));
    let text = String::from_utf8(bytes).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: format!("invalid UTF-8: {e}"),
    })?;
    let doc: toml::Value = toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok((toml_to_json(doc), digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_only() {
        let settings = Settings::load(&ConfigPaths::default(), &no_env, None).unwrap();
        assert_eq!(settings.api_host, taskpilot_api::DEFAULT_HOST);
        assert!(settings.api_token.is_none());
        assert!(!settings.build.local);
        assert_eq!(settings.build_poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.archive.ignore_file, ".taskpilotignore");
        assert_eq!(settings.sources.len(), 1);
    }

    #[test]
    fn test_layer_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.toml");
        let repo = dir.path().join("repo.toml");
        fs::write(&user, "api_host = \"user.example\"\n[build]\nlocal = true\n").unwrap();
        fs::write(&repo, "api_host = \"repo.example\"\n[watch]\npoll_interval_ms = 50\n").unwrap();

        let vars: HashMap<&str, &str> = [(ENV_API_TOKEN, "tok")].into_iter().collect();
        let env = |k: &str| vars.get(k).map(|v| v.to_string());
        let paths = ConfigPaths {
            user: Some(user),
            repo: Some(repo),
        };
        let settings = Settings::load(
            &paths,
            &env,
            Some(json!({"build": {"push": false}})),
        )
        .unwrap();

        assert_eq!(settings.api_host, "repo.example");
        assert_eq!(settings.api_token.as_deref(), Some("tok"));
        assert!(settings.build.local);
        assert!(!settings.build.push);
        assert_eq!(settings.watch.poll_interval_ms, 50);
        let origins: Vec<_> = settings.sources.iter().map(|s| s.origin).collect();
        assert_eq!(
            origins,
            vec![
                ConfigOrigin::Builtin,
                ConfigOrigin::User,
                ConfigOrigin::Repo,
                ConfigOrigin::Env,
                ConfigOrigin::Cli
            ]
        );
        assert!(settings.sources[1].digest.is_some());
    }

    #[test]
    fn test_describe_sources_names_files_and_digests() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join(REPO_CONFIG_FILE);
        fs::write(&repo, "api_host = \"repo.example\"\n").unwrap();
        let paths = ConfigPaths {
            user: None,
            repo: Some(repo.clone()),
        };
        let settings =
            Settings::load(&paths, &no_env, Some(json!({"build": {"local": true}}))).unwrap();

        let digest = &settings.sources[1].digest.clone().unwrap();
        assert_eq!(
            settings.describe_sources(),
            format!("builtin, repo {}@{}, cli", repo.display(), &digest[..8])
        );
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let err = Settings::load(
            &ConfigPaths::default(),
            &no_env,
            Some(json!({"watch": {"poll_interval_ms": 0}})),
        )
        .unwrap_err();
        assert!(err.to_string().contains("watch.poll_interval_ms"));
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join(REPO_CONFIG_FILE);
        fs::write(&repo, "api_host = [").unwrap();
        let paths = ConfigPaths {
            user: None,
            repo: Some(repo),
        };
        let err = Settings::load(&paths, &no_env, None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(REPO_CONFIG_FILE));
    }
}
