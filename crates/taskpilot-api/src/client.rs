//! The API surface the deploy and watch pipelines are written against

use crate::types::{
    CreateBuildRequest, CreateBuildResponse, CreateBuildUploadRequest, CreateBuildUploadResponse,
    CreateTaskRequest, CreateTaskResponse, GetBuildResponse, GetLogsResponse, GetOutputsResponse,
    GetRunResponse, RegistryTokenResponse, RunTaskRequest, RunTaskResponse, Task,
    UpdateTaskRequest,
};

/// API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No task is registered under the slug
    #[error("task with slug {slug:?} does not exist")]
    TaskMissing { slug: String },

    #[error("{operation}: server returned {code}: {message}")]
    Status {
        operation: &'static str,
        code: u16,
        message: String,
    },

    #[error("{operation}: {reason}")]
    Transport {
        operation: &'static str,
        reason: String,
    },

    #[error("{operation}: decoding response: {reason}")]
    Decode {
        operation: &'static str,
        reason: String,
    },

    #[error("no API token configured (set TASKPILOT_API_TOKEN or api_token in config)")]
    MissingToken,
}

impl ApiError {
    pub fn is_task_missing(&self) -> bool {
        matches!(self, ApiError::TaskMissing { .. })
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Blocking client for the remote task service.
///
/// Implementations must be shareable across the deployer's worker threads.
pub trait ApiClient: Send + Sync {
    /// Resolve a slug. Returns [`ApiError::TaskMissing`] when nothing is registered.
    fn get_task(&self, slug: &str) -> ApiResult<Task>;

    fn create_task(&self, req: &CreateTaskRequest) -> ApiResult<CreateTaskResponse>;

    fn update_task(&self, req: &UpdateTaskRequest) -> ApiResult<()>;

    fn get_registry_token(&self) -> ApiResult<RegistryTokenResponse>;

    fn create_build_upload(
        &self,
        req: &CreateBuildUploadRequest,
    ) -> ApiResult<CreateBuildUploadResponse>;

    fn create_build(&self, req: &CreateBuildRequest) -> ApiResult<CreateBuildResponse>;

    fn get_build(&self, build_id: &str) -> ApiResult<GetBuildResponse>;

    /// One page of build logs newer than `prev_page_token` (empty for the first page)
    fn get_build_logs(&self, build_id: &str, prev_page_token: &str) -> ApiResult<GetLogsResponse>;

    fn run_task(&self, req: &RunTaskRequest) -> ApiResult<RunTaskResponse>;

    fn get_run(&self, run_id: &str) -> ApiResult<GetRunResponse>;

    /// One page of run logs newer than `prev_page_token` (empty for the first page)
    fn get_logs(&self, run_id: &str, prev_page_token: &str) -> ApiResult<GetLogsResponse>;

    fn get_outputs(&self, run_id: &str) -> ApiResult<GetOutputsResponse>;

    /// Web URL of a task, for user-facing output
    fn task_url(&self, slug: &str) -> String;

    /// Web URL of a run, for user-facing output
    fn run_url(&self, run_id: &str) -> String;
}
