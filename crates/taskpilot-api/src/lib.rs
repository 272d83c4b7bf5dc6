//! taskpilot API types and clients
//!
//! Defines the request/response shapes the deploy and watch pipelines depend
//! on, the [`ApiClient`] trait they are written against, a blocking HTTP
//! implementation, and an in-process mock for tests.

pub mod client;
pub mod http;
pub mod logs;
pub mod mock;
pub mod types;

pub use client::{ApiClient, ApiError, ApiResult};
pub use http::{HttpClient, HttpClientConfig};
pub use logs::sort_logs;
pub use mock::MockClient;
pub use types::{
    BuildGitMeta, BuildStatus, CreateBuildRequest, CreateBuildResponse, CreateBuildUploadRequest,
    CreateBuildUploadResponse, CreateTaskRequest, CreateTaskResponse, EnvVar, GetBuildResponse,
    GetLogsResponse, GetOutputsResponse, GetRunResponse, KindOptions, LogItem, LogLevel, Outputs,
    RegistryTokenResponse, RunStatus, RunTaskRequest, RunTaskResponse, Task, TaskEnv, TaskKind,
    UpdateTaskRequest, Upload,
};

/// Default API host.
pub const DEFAULT_HOST: &str = "api.taskpilot.dev";

/// Interpolation mode written by current clients.
pub const INTERPOLATION_MODE_JST: &str = "jst";
