//! API request and response shapes
//!
//! Only the fields the deploy and watch pipelines read or write are modelled;
//! everything else on a task record is carried through as opaque JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Builder/runtime identifier of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Go,
    Node,
    Python,
    Deno,
    Shell,
    Dockerfile,
    Image,
}

impl TaskKind {
    /// All kinds, in registration order
    pub const ALL: [TaskKind; 7] = [
        TaskKind::Go,
        TaskKind::Node,
        TaskKind::Python,
        TaskKind::Deno,
        TaskKind::Shell,
        TaskKind::Dockerfile,
        TaskKind::Image,
    ];

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Go => "go",
            TaskKind::Node => "node",
            TaskKind::Python => "python",
            TaskKind::Deno => "deno",
            TaskKind::Shell => "shell",
            TaskKind::Dockerfile => "dockerfile",
            TaskKind::Image => "image",
        }
    }

    /// Whether deploying a task of this kind produces a container image.
    ///
    /// Image tasks reference a prebuilt image and are never built.
    pub fn needs_building(&self) -> bool {
        !matches!(self, TaskKind::Image)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown task kind: {s}"))
    }
}

/// Kind-specific options (entrypoint, nodeVersion, dockerfile, ...)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KindOptions(pub BTreeMap<String, Value>);

impl KindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// String value of an option, if present and a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

/// A task environment variable: either a literal value or a config reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

impl EnvVar {
    pub fn value(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            config: None,
        }
    }
}

/// Per-task environment variables
pub type TaskEnv = BTreeMap<String, EnvVar>;

/// A remotely registered task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<Value>,
    #[serde(default)]
    pub env: TaskEnv,
    pub kind: TaskKind,
    #[serde(default)]
    pub kind_options: KindOptions,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub interpolation_mode: String,
    #[serde(default)]
    pub require_explicit_permissions: bool,
    #[serde(default)]
    pub permissions: Vec<Value>,
}

impl Task {
    /// Minimal task record, mostly useful for tests and fixtures
    pub fn new(id: impl Into<String>, slug: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            slug: slug.into(),
            name: String::new(),
            description: String::new(),
            image: None,
            command: Vec::new(),
            arguments: Vec::new(),
            parameters: Vec::new(),
            env: TaskEnv::new(),
            kind,
            kind_options: KindOptions::new(),
            timeout: 0,
            interpolation_mode: String::new(),
            require_explicit_permissions: false,
            permissions: Vec::new(),
        }
    }
}

/// Full replacement of a task's mutable fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    pub slug: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub command: Vec<String>,
    pub arguments: Vec<String>,
    pub parameters: Vec<Value>,
    pub env: TaskEnv,
    pub kind: TaskKind,
    pub kind_options: KindOptions,
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpolation_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    pub require_explicit_permissions: bool,
    pub permissions: Vec<Value>,
}

impl From<&Task> for UpdateTaskRequest {
    /// Request that leaves every field of `task` unchanged
    fn from(task: &Task) -> Self {
        Self {
            slug: task.slug.clone(),
            name: task.name.clone(),
            description: task.description.clone(),
            image: task.image.clone(),
            command: task.command.clone(),
            arguments: task.arguments.clone(),
            parameters: task.parameters.clone(),
            env: task.env.clone(),
            kind: task.kind,
            kind_options: task.kind_options.clone(),
            timeout: task.timeout,
            interpolation_mode: None,
            build_id: None,
            require_explicit_permissions: task.require_explicit_permissions,
            permissions: task.permissions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub slug: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub command: Vec<String>,
    pub arguments: Vec<String>,
    pub parameters: Vec<Value>,
    pub env: TaskEnv,
    pub kind: TaskKind,
    pub kind_options: KindOptions,
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskResponse {
    #[serde(rename = "taskID")]
    pub task_id: String,
}

/// Registry credentials scoped to one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTokenResponse {
    pub token: String,
    pub repo: String,
}

impl RegistryTokenResponse {
    /// Registry host: the first path segment of the repository reference
    pub fn host(&self) -> &str {
        self.repo.split('/').next().unwrap_or(&self.repo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBuildUploadRequest {
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub id: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBuildUploadResponse {
    pub upload: Upload,
    #[serde(rename = "writeOnlyURL")]
    pub write_only_url: String,
}

/// Source-control metadata attached to a build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildGitMeta {
    pub commit_hash: String,
    pub commit_message: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub file_path: String,
    pub is_dirty: bool,
    pub user: String,
    pub repository: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBuildRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
    #[serde(rename = "sourceUploadID")]
    pub source_upload_id: String,
    pub env: TaskEnv,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_meta: Option<BuildGitMeta>,
}

/// Remote build status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BuildStatus {
    #[default]
    NotStarted,
    Queued,
    Active,
    Succeeded,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    #[serde(default)]
    pub status: BuildStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBuildResponse {
    pub build: Build,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBuildResponse {
    pub build: Build,
}

/// Remote run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    NotStarted,
    Queued,
    Active,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::NotStarted => "NotStarted",
            RunStatus::Queued => "Queued",
            RunStatus::Active => "Active",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    #[serde(default, rename = "taskID")]
    pub task_id: String,
    #[serde(default)]
    pub status: RunStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRunResponse {
    pub run: Run,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub param_values: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTaskResponse {
    #[serde(rename = "runID")]
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// One log line of a build or run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogItem {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "insertID")]
    pub insert_id: String,
    pub text: String,
    #[serde(default)]
    pub level: LogLevel,
}

/// One page of logs plus the continuation token for the next request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLogsResponse {
    #[serde(default)]
    pub logs: Vec<LogItem>,
    #[serde(default)]
    pub prev_page_token: String,
}

/// Outputs produced by a run, as returned by the API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Outputs(pub Value);

impl Outputs {
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(m) => m.is_empty(),
            Value::Array(a) => a.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetOutputsResponse {
    #[serde(default)]
    pub outputs: Outputs,
}
