//! Image builds
//!
//! A [`BuildCreator`] turns a task root into a pushed container image. Two
//! implementations exist: [`LocalBuildCreator`] drives the local docker CLI
//! with a generated [`Recipe`], and [`RemoteBuildCreator`] uploads the source
//! and polls the service's builder until the build stops.

mod docker;
mod git;
mod local;
mod log;
pub mod recipe;
mod remote;
pub mod versions;

pub use docker::{DockerCli, DockerEngine, DockerError};
pub use git::git_meta;
pub use local::LocalBuildCreator;
pub use log::{BuildLogSink, ConsoleBuildLog, MemoryBuildLog, BUILDER_MARKER};
pub use recipe::{build_dockerfile, Recipe, RecipeError};
pub use remote::RemoteBuildCreator;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use taskpilot_api::{
    ApiClient, ApiError, BuildGitMeta, KindOptions, RegistryTokenResponse, TaskEnv, TaskKind,
};

use crate::archive::{ArchiveError, TarError};
use crate::cancel::CancelToken;

/// Everything needed to produce one image
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Absolute task root, the build context
    pub root: PathBuf,
    pub slug: String,
    pub task_id: String,
    pub kind: TaskKind,
    pub kind_options: KindOptions,
    /// Build-time environment, passed as build args
    pub env: TaskEnv,
    /// Wrap the entrypoint with a generated shim
    pub shim: bool,
    pub git_meta: Option<BuildGitMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResponse {
    pub image_url: String,
    pub build_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("{operation}: {source}")]
    Api {
        operation: &'static str,
        #[source]
        source: ApiError,
    },

    #[error("aborting build")]
    Aborted,

    #[error("asking for confirmation: {0}")]
    Prompt(#[source] std::io::Error),

    #[error("build cancelled")]
    Cancelled,

    #[error("Build failed")]
    Failed { build_id: String },

    #[error("Build cancelled")]
    BuildCancelled { build_id: String },

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("assembling build context: {0}")]
    Context(#[from] TarError),
}

impl BuildError {
    fn api(operation: &'static str) -> impl FnOnce(ApiError) -> Self {
        move |source| Self::Api { operation, source }
    }
}

/// Produces an image for a task
pub trait BuildCreator: Send + Sync {
    fn create_build(
        &self,
        cancel: &CancelToken,
        req: &BuildRequest,
    ) -> Result<BuildResponse, BuildError>;
}

/// Lower-case the id and replace a trailing digit with `a`.
///
/// Image names derived from task ids must not end in a digit. Applying the
/// function twice gives the same result as applying it once.
pub fn sanitize_task_id(task_id: &str) -> String {
    let mut id = task_id.to_lowercase();
    if id.ends_with(|c: char| c.is_ascii_digit()) {
        id.pop();
        id.push('a');
    }
    id
}

/// `{repo}/task-{sanitized id}:{tag}`
pub fn image_url(repo: &str, task_id: &str, tag: &str) -> String {
    format!("{repo}/task-{}:{tag}", sanitize_task_id(task_id))
}

/// Registry token fetched at most once per creator
#[derive(Default)]
pub(crate) struct RegistryTokenCache {
    token: Mutex<Option<RegistryTokenResponse>>,
}

impl RegistryTokenCache {
    pub(crate) fn get(&self, client: &Arc<dyn ApiClient>) -> Result<RegistryTokenResponse, BuildError> {
        let mut slot = self.token.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }
        let token = client
            .get_registry_token()
            .map_err(BuildError::api("getting registry token"))?;
        tracing::debug!(repo = %token.repo, "fetched registry token");
        *slot = Some(token.clone());
        Ok(token)
    }
}

/// Build args from the task environment. Config references are resolved
/// server-side and have no literal value here.
pub(crate) fn build_args(env: &TaskEnv) -> Vec<(String, String)> {
    env.iter()
        .filter_map(|(name, var)| var.value.as_ref().map(|v| (name.clone(), v.clone())))
        .collect()
}
