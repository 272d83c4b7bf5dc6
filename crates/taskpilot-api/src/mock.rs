//! In-process mock of the task service
//!
//! Holds a task table and scripted build/run progressions so the deploy,
//! build and watch pipelines can be exercised without a network. Every call is
//! recorded and any operation can be made to fail.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use ulid::Ulid;

use crate::client::{ApiClient, ApiError, ApiResult};
use crate::types::{
    Build, BuildStatus, CreateBuildRequest, CreateBuildResponse, CreateBuildUploadRequest,
    CreateBuildUploadResponse, CreateTaskRequest, CreateTaskResponse, GetBuildResponse,
    GetLogsResponse, GetOutputsResponse, GetRunResponse, Outputs, RegistryTokenResponse, Run,
    RunStatus, RunTaskRequest, RunTaskResponse, Task, UpdateTaskRequest, Upload,
};

#[derive(Debug, Default)]
struct MockState {
    tasks: BTreeMap<String, Task>,
    calls: Vec<String>,
    log_tokens: Vec<String>,
    updates: Vec<UpdateTaskRequest>,
    created_tasks: Vec<CreateTaskRequest>,
    uploads: Vec<CreateBuildUploadRequest>,
    builds: Vec<CreateBuildRequest>,
    runs: Vec<RunTaskRequest>,
    build_statuses: VecDeque<BuildStatus>,
    build_logs: VecDeque<GetLogsResponse>,
    run_statuses: VecDeque<RunStatus>,
    run_logs: VecDeque<GetLogsResponse>,
    outputs: Outputs,
    failures: HashMap<&'static str, String>,
}

/// Scriptable [`ApiClient`] for tests
#[derive(Debug, Default)]
pub struct MockClient {
    state: Mutex<MockState>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task, keyed by slug
    pub fn with_task(self, task: Task) -> Self {
        self.add_task(task);
        self
    }

    pub fn add_task(&self, task: Task) {
        self.state().tasks.insert(task.slug.clone(), task);
    }

    pub fn task(&self, slug: &str) -> Option<Task> {
        self.state().tasks.get(slug).cloned()
    }

    /// Statuses returned by successive `get_build` calls. The last one repeats.
    pub fn set_build_statuses(&self, statuses: Vec<BuildStatus>) {
        self.state().build_statuses = statuses.into();
    }

    /// Queue one page for `get_build_logs`. An empty page is returned once the queue drains.
    pub fn push_build_logs(&self, page: GetLogsResponse) {
        self.state().build_logs.push_back(page);
    }

    /// Statuses returned by successive `get_run` calls. The last one repeats.
    pub fn set_run_statuses(&self, statuses: Vec<RunStatus>) {
        self.state().run_statuses = statuses.into();
    }

    /// Queue one page for `get_logs`. An empty page is returned once the queue drains.
    pub fn push_run_logs(&self, page: GetLogsResponse) {
        self.state().run_logs.push_back(page);
    }

    pub fn set_outputs(&self, outputs: Outputs) {
        self.state().outputs = outputs;
    }

    /// Make every call of `operation` (a trait method name) fail with a 500
    pub fn fail(&self, operation: &'static str, message: &str) {
        self.state().failures.insert(operation, message.to_string());
    }

    /// Names of the trait methods called so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == operation).count()
    }

    /// Page tokens passed to `get_logs` and `get_build_logs`, in call order
    pub fn log_tokens(&self) -> Vec<String> {
        self.state().log_tokens.clone()
    }

    pub fn updates(&self) -> Vec<UpdateTaskRequest> {
        self.state().updates.clone()
    }

    pub fn created_tasks(&self) -> Vec<CreateTaskRequest> {
        self.state().created_tasks.clone()
    }

    pub fn uploads(&self) -> Vec<CreateBuildUploadRequest> {
        self.state().uploads.clone()
    }

    pub fn builds(&self) -> Vec<CreateBuildRequest> {
        self.state().builds.clone()
    }

    pub fn runs(&self) -> Vec<RunTaskRequest> {
        self.state().runs.clone()
    }

    /// Record the call and return the injected failure for it, if any
    fn enter(&self, operation: &'static str) -> ApiResult<MutexGuard<'_, MockState>> {
        let mut state = self.state();
        state.calls.push(operation.to_string());
        if let Some(message) = state.failures.get(operation).cloned() {
            return Err(ApiError::Status {
                operation,
                code: 500,
                message,
            });
        }
        Ok(state)
    }
}

/// Pop the next scripted value, repeating the last one
fn next_sticky<T: Copy + Default>(queue: &mut VecDeque<T>) -> T {
    if queue.len() > 1 {
        queue.pop_front().unwrap_or_default()
    } else {
        queue.front().copied().unwrap_or_default()
    }
}

fn new_id(prefix: &str) -> String {
    format!("{}{}", prefix, Ulid::new().to_string().to_lowercase())
}

impl ApiClient for MockClient {
    fn get_task(&self, slug: &str) -> ApiResult<Task> {
        let state = self.enter("get_task")?;
        state
            .tasks
            .get(slug)
            .cloned()
            .ok_or_else(|| ApiError::TaskMissing {
                slug: slug.to_string(),
            })
    }

    fn create_task(&self, req: &CreateTaskRequest) -> ApiResult<CreateTaskResponse> {
        let mut state = self.enter("create_task")?;
        let id = new_id("tsk");
        let mut task = Task::new(id.clone(), req.slug.clone(), req.kind);
        task.name = req.name.clone();
        task.description = req.description.clone();
        task.image = req.image.clone();
        task.command = req.command.clone();
        task.arguments = req.arguments.clone();
        task.parameters = req.parameters.clone();
        task.env = req.env.clone();
        task.kind_options = req.kind_options.clone();
        task.timeout = req.timeout;
        state.tasks.insert(req.slug.clone(), task);
        state.created_tasks.push(req.clone());
        Ok(CreateTaskResponse { task_id: id })
    }

    fn update_task(&self, req: &UpdateTaskRequest) -> ApiResult<()> {
        let mut state = self.enter("update_task")?;
        let task = state
            .tasks
            .get_mut(&req.slug)
            .ok_or_else(|| ApiError::TaskMissing {
                slug: req.slug.clone(),
            })?;
        task.kind = req.kind;
        task.kind_options = req.kind_options.clone();
        task.env = req.env.clone();
        if req.image.is_some() {
            task.image = req.image.clone();
        }
        if let Some(mode) = &req.interpolation_mode {
            task.interpolation_mode = mode.clone();
        }
        state.updates.push(req.clone());
        Ok(())
    }

    fn get_registry_token(&self) -> ApiResult<RegistryTokenResponse> {
        let _state = self.enter("get_registry_token")?;
        Ok(RegistryTokenResponse {
            token: "mock-registry-token".to_string(),
            repo: "registry.test/project/tasks".to_string(),
        })
    }

    fn create_build_upload(
        &self,
        req: &CreateBuildUploadRequest,
    ) -> ApiResult<CreateBuildUploadResponse> {
        let mut state = self.enter("create_build_upload")?;
        state.uploads.push(req.clone());
        let id = new_id("upl");
        Ok(CreateBuildUploadResponse {
            write_only_url: format!("https://uploads.test/{id}"),
            upload: Upload {
                id,
                url: String::new(),
            },
        })
    }

    fn create_build(&self, req: &CreateBuildRequest) -> ApiResult<CreateBuildResponse> {
        let mut state = self.enter("create_build")?;
        state.builds.push(req.clone());
        Ok(CreateBuildResponse {
            build: Build {
                id: new_id("bld"),
                status: BuildStatus::NotStarted,
            },
        })
    }

    fn get_build(&self, build_id: &str) -> ApiResult<GetBuildResponse> {
        let mut state = self.enter("get_build")?;
        let status = if state.build_statuses.is_empty() {
            BuildStatus::Succeeded
        } else {
            next_sticky(&mut state.build_statuses)
        };
        Ok(GetBuildResponse {
            build: Build {
                id: build_id.to_string(),
                status,
            },
        })
    }

    fn get_build_logs(&self, _build_id: &str, prev_page_token: &str) -> ApiResult<GetLogsResponse> {
        let mut state = self.enter("get_build_logs")?;
        state.log_tokens.push(prev_page_token.to_string());
        Ok(state.build_logs.pop_front().unwrap_or_default())
    }

    fn run_task(&self, req: &RunTaskRequest) -> ApiResult<RunTaskResponse> {
        let mut state = self.enter("run_task")?;
        state.runs.push(req.clone());
        Ok(RunTaskResponse {
            run_id: new_id("run"),
        })
    }

    fn get_run(&self, run_id: &str) -> ApiResult<GetRunResponse> {
        let mut state = self.enter("get_run")?;
        let status = next_sticky(&mut state.run_statuses);
        Ok(GetRunResponse {
            run: Run {
                id: run_id.to_string(),
                task_id: String::new(),
                status,
            },
        })
    }

    fn get_logs(&self, _run_id: &str, prev_page_token: &str) -> ApiResult<GetLogsResponse> {
        let mut state = self.enter("get_logs")?;
        state.log_tokens.push(prev_page_token.to_string());
        Ok(state.run_logs.pop_front().unwrap_or_default())
    }

    fn get_outputs(&self, _run_id: &str) -> ApiResult<GetOutputsResponse> {
        let state = self.enter("get_outputs")?;
        Ok(GetOutputsResponse {
            outputs: state.outputs.clone(),
        })
    }

    fn task_url(&self, slug: &str) -> String {
        format!("https://app.taskpilot.test/t/{slug}")
    }

    fn run_url(&self, run_id: &str) -> String {
        format!("https://app.taskpilot.test/runs/{run_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskKind;

    #[test]
    fn test_missing_task_is_distinguished() {
        let mock = MockClient::new();
        assert!(mock.get_task("nope").unwrap_err().is_task_missing());
    }

    #[test]
    fn test_scripted_statuses_repeat_last() {
        let mock = MockClient::new();
        mock.set_run_statuses(vec![RunStatus::Queued, RunStatus::Succeeded]);
        assert_eq!(mock.get_run("r").unwrap().run.status, RunStatus::Queued);
        assert_eq!(mock.get_run("r").unwrap().run.status, RunStatus::Succeeded);
        assert_eq!(mock.get_run("r").unwrap().run.status, RunStatus::Succeeded);
    }

    #[test]
    fn test_injected_failure_is_recorded() {
        let mock = MockClient::new().with_task(Task::new("t1", "hello", TaskKind::Python));
        mock.fail("get_task", "boom");
        assert!(matches!(
            mock.get_task("hello"),
            Err(ApiError::Status { code: 500, .. })
        ));
        assert_eq!(mock.call_count("get_task"), 1);
    }

    #[test]
    fn test_create_then_get() {
        let mock = MockClient::new();
        let resp = mock
            .create_task(&CreateTaskRequest {
                slug: "new".to_string(),
                name: "New".to_string(),
                description: String::new(),
                image: None,
                command: vec![],
                arguments: vec![],
                parameters: vec![],
                env: Default::default(),
                kind: TaskKind::Node,
                kind_options: Default::default(),
                timeout: 0,
            })
            .unwrap();
        assert_eq!(mock.get_task("new").unwrap().id, resp.task_id);
    }
}
