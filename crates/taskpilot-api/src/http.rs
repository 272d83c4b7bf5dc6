//! Blocking HTTP implementation of [`ApiClient`]

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::client::{ApiClient, ApiError, ApiResult};
use crate::types::{
    CreateBuildRequest, CreateBuildResponse, CreateBuildUploadRequest, CreateBuildUploadResponse,
    CreateTaskRequest, CreateTaskResponse, GetBuildResponse, GetLogsResponse, GetOutputsResponse,
    GetRunResponse, RegistryTokenResponse, RunTaskRequest, RunTaskResponse, Task,
    UpdateTaskRequest,
};

const TOKEN_HEADER: &str = "X-Taskpilot-Token";
const CLIENT_HEADER: &str = "X-Taskpilot-Client";

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// API host, without scheme (e.g. `api.taskpilot.dev`)
    pub host: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            token: None,
            connect_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(120),
        }
    }
}

/// API client speaking JSON over HTTPS
pub struct HttpClient {
    agent: ureq::Agent,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout(config.timeout)
            .build();
        Self { agent, config }
    }

    fn base_url(&self) -> String {
        let host = &self.config.host;
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}/v0", host.trim_end_matches('/'))
        } else {
            format!("https://{}/v0", host)
        }
    }

    /// Web app host derived from the API host (`api.x` becomes `app.x`)
    fn app_host(&self) -> String {
        let host = self
            .config
            .host
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        match host.strip_prefix("api.") {
            Some(rest) => format!("app.{rest}"),
            None => host.to_string(),
        }
    }

    fn token(&self) -> ApiResult<&str> {
        match self.config.token.as_deref() {
            Some(t) if !t.is_empty() => Ok(t),
            _ => Err(ApiError::MissingToken),
        }
    }

    fn request(&self, method: &str, path: &str) -> ApiResult<ureq::Request> {
        let url = format!("{}{}", self.base_url(), path);
        Ok(self
            .agent
            .request(method, &url)
            .set(TOKEN_HEADER, self.token()?)
            .set(CLIENT_HEADER, concat!("taskpilot/", env!("CARGO_PKG_VERSION"))))
    }

    fn get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, &str)],
    ) -> ApiResult<T> {
        let mut req = self.request("GET", path)?;
        for (k, v) in query {
            req = req.query(k, v);
        }
        tracing::debug!(operation, path, "GET");
        decode(operation, req.call())
    }

    fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        let req = self.request("POST", path)?;
        tracing::debug!(operation, path, "POST");
        decode(operation, req.send_json(body))
    }
}

fn decode<T: DeserializeOwned>(
    operation: &'static str,
    result: Result<ureq::Response, ureq::Error>,
) -> ApiResult<T> {
    match result {
        Ok(resp) => resp.into_json::<T>().map_err(|e| ApiError::Decode {
            operation,
            reason: e.to_string(),
        }),
        Err(ureq::Error::Status(code, resp)) => {
            let body = resp.into_string().unwrap_or_default();
            Err(ApiError::Status {
                operation,
                code,
                message: error_message(&body),
            })
        }
        Err(ureq::Error::Transport(t)) => Err(ApiError::Transport {
            operation,
            reason: t.to_string(),
        }),
    }
}

/// Pull `{"error": "..."}` out of an error body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

impl ApiClient for HttpClient {
    fn get_task(&self, slug: &str) -> ApiResult<Task> {
        match self.get("getting task", "/tasks/get", &[("slug", slug)]) {
            Err(ApiError::Status { code: 404, .. }) => Err(ApiError::TaskMissing {
                slug: slug.to_string(),
            }),
            other => other,
        }
    }

    fn create_task(&self, req: &CreateTaskRequest) -> ApiResult<CreateTaskResponse> {
        self.post("creating task", "/tasks/create", req)
    }

    fn update_task(&self, req: &UpdateTaskRequest) -> ApiResult<()> {
        let _: Value = self.post("updating task", "/tasks/update", req)?;
        Ok(())
    }

    fn get_registry_token(&self) -> ApiResult<RegistryTokenResponse> {
        self.post("getting registry token", "/registry/getToken", &serde_json::json!({}))
    }

    fn create_build_upload(
        &self,
        req: &CreateBuildUploadRequest,
    ) -> ApiResult<CreateBuildUploadResponse> {
        self.post("creating upload", "/builds/createUpload", req)
    }

    fn create_build(&self, req: &CreateBuildRequest) -> ApiResult<CreateBuildResponse> {
        self.post("creating build", "/builds/create", req)
    }

    fn get_build(&self, build_id: &str) -> ApiResult<GetBuildResponse> {
        self.get("getting build", "/builds/get", &[("id", build_id)])
    }

    fn get_build_logs(&self, build_id: &str, prev_page_token: &str) -> ApiResult<GetLogsResponse> {
        self.get(
            "getting build logs",
            "/builds/getLogs",
            &[("buildID", build_id), ("prevPageToken", prev_page_token)],
        )
    }

    fn run_task(&self, req: &RunTaskRequest) -> ApiResult<RunTaskResponse> {
        self.post("running task", "/tasks/execute", req)
    }

    fn get_run(&self, run_id: &str) -> ApiResult<GetRunResponse> {
        self.get("getting run", "/runs/get", &[("id", run_id)])
    }

    fn get_logs(&self, run_id: &str, prev_page_token: &str) -> ApiResult<GetLogsResponse> {
        self.get(
            "getting run logs",
            "/runs/getLogs",
            &[("runID", run_id), ("prevPageToken", prev_page_token)],
        )
    }

    fn get_outputs(&self, run_id: &str) -> ApiResult<GetOutputsResponse> {
        self.get("getting run outputs", "/runs/getOutputs", &[("id", run_id)])
    }

    fn task_url(&self, slug: &str) -> String {
        format!("https://{}/t/{}", self.app_host(), slug)
    }

    fn run_url(&self, run_id: &str) -> String {
        format!("https://{}/runs/{}", self.app_host(), run_id)
    }
}
