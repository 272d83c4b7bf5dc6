//! Builds on the service's remote builder

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use taskpilot_api::{sort_logs, ApiClient, BuildStatus, CreateBuildRequest, UpdateTaskRequest};

use super::log::BuildLogSink;
use super::{image_url, BuildCreator, BuildError, BuildRequest, BuildResponse, RegistryTokenCache};
use crate::archive::Archiver;
use crate::cancel::CancelToken;
use crate::config::DEFAULT_POLL_INTERVAL_MS;
use crate::prompt::Confirmer;

pub struct RemoteBuildCreator {
    client: Arc<dyn ApiClient>,
    archiver: Arc<dyn Archiver>,
    confirmer: Arc<dyn Confirmer>,
    log: Arc<dyn BuildLogSink>,
    poll_interval: Duration,
    home: Option<PathBuf>,
    registry: RegistryTokenCache,
}

impl RemoteBuildCreator {
    pub fn new(
        client: Arc<dyn ApiClient>,
        archiver: Arc<dyn Archiver>,
        confirmer: Arc<dyn Confirmer>,
        log: Arc<dyn BuildLogSink>,
    ) -> Self {
        Self {
            client,
            archiver,
            confirmer,
            log,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            home: std::env::var_os("HOME").map(PathBuf::from),
            registry: RegistryTokenCache::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Directory treated as the user's home for the upload guard
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// Refuse to upload a home directory unless the user insists
    fn confirm_build_root(&self, root: &Path) -> Result<(), BuildError> {
        let Some(home) = self.home.as_deref() else {
            return Ok(());
        };
        if !same_dir(root, home) {
            return Ok(());
        }
        tracing::warn!(
            root = %root.display(),
            "this task's root is your home directory, deploying will upload all of it"
        );
        tracing::warn!("consider moving the task into its own directory");
        let confirmed = self
            .confirmer
            .confirm("Are you sure?")
            .map_err(BuildError::Prompt)?;
        if confirmed {
            Ok(())
        } else {
            Err(BuildError::Aborted)
        }
    }

    /// The remote builder reads kind and options from the task record
    fn update_kind_and_options(&self, req: &BuildRequest) -> Result<(), BuildError> {
        let task = self
            .client
            .get_task(&req.slug)
            .map_err(BuildError::api("getting task"))?;

        let mut options = req.kind_options.clone();
        if req.shim {
            options.set("shim", "true");
        }
        if let Some(entrypoint) = options.get_str("entrypoint") {
            let normalized = entrypoint.replace('\\', "/");
            options.set("entrypoint", normalized);
        }

        let mut update = UpdateTaskRequest::from(&task);
        update.kind = req.kind;
        update.kind_options = options;
        self.client
            .update_task(&update)
            .map_err(BuildError::api("updating task"))
    }

    fn wait_for_build(
        &self,
        cancel: &CancelToken,
        slug: &str,
        build_id: &str,
    ) -> Result<(), BuildError> {
        let mut page_token = String::new();
        loop {
            cancel
                .sleep(self.poll_interval)
                .map_err(|_| BuildError::Cancelled)?;

            let mut page = self
                .client
                .get_build_logs(build_id, &page_token)
                .map_err(BuildError::api("getting build logs"))?;
            if !page.logs.is_empty() {
                page_token = page.prev_page_token;
            }
            sort_logs(&mut page.logs);
            for item in &page.logs {
                self.log.log(slug, item.level, &item.text);
            }

            let build = self
                .client
                .get_build(build_id)
                .map_err(BuildError::api("getting build"))?
                .build;
            tracing::debug!(%build_id, status = ?build.status, "polled build");
            match build.status {
                BuildStatus::Succeeded => return Ok(()),
                BuildStatus::Failed => {
                    return Err(BuildError::Failed {
                        build_id: build_id.to_string(),
                    })
                }
                BuildStatus::Cancelled => {
                    return Err(BuildError::BuildCancelled {
                        build_id: build_id.to_string(),
                    })
                }
                BuildStatus::NotStarted | BuildStatus::Queued | BuildStatus::Active => {}
            }
        }
    }
}

impl BuildCreator for RemoteBuildCreator {
    fn create_build(
        &self,
        cancel: &CancelToken,
        req: &BuildRequest,
    ) -> Result<BuildResponse, BuildError> {
        self.confirm_build_root(&req.root)?;
        self.update_kind_and_options(req)?;
        let auth = self.registry.get(&self.client)?;

        let upload = self.archiver.archive(cancel, &req.root)?;
        let build = self
            .client
            .create_build(&CreateBuildRequest {
                task_id: req.task_id.clone(),
                source_upload_id: upload.upload_id,
                env: req.env.clone(),
                git_meta: req.git_meta.clone(),
            })
            .map_err(BuildError::api("creating build"))?
            .build;
        tracing::info!(task = %req.slug, build_id = %build.id, "created remote build");

        self.wait_for_build(cancel, &req.slug, &build.id)?;
        Ok(BuildResponse {
            image_url: image_url(&auth.repo, &req.task_id, &build.id),
            build_id: build.id,
        })
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
