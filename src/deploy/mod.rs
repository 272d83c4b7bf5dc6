//! Deploying discovered tasks
//!
//! Every task in a batch is built (when its kind needs it) and updated on its
//! own scoped thread. A failing task never stops the others; outcomes are
//! collected under a mutex and reported once the whole batch has finished.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use regex_lite::Regex;
use taskpilot_api::{
    ApiClient, ApiError, TaskKind, UpdateTaskRequest, INTERPOLATION_MODE_JST,
};

use crate::build::{git_meta, BuildCreator, BuildError, BuildRequest};
use crate::cancel::CancelToken;
use crate::discover::{absolute, linked_slug, DiscoverError, TaskConfig, TaskConfigSource};

/// Why a single task failed to deploy
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("the file {} is not linked to a task", path.display())]
    NotLinked { path: PathBuf },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Definition(#[from] DiscoverError),

    #[error("deploy cancelled")]
    Cancelled,

    #[error("updating task {slug}: {source}")]
    Update {
        slug: String,
        #[source]
        source: ApiError,
    },
}

impl TaskError {
    pub fn is_not_linked(&self) -> bool {
        matches!(self, TaskError::NotLinked { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            TaskError::Cancelled
                | TaskError::Build(BuildError::Cancelled)
                | TaskError::Build(BuildError::Docker(crate::build::DockerError::Cancelled { .. }))
        )
    }
}

/// The first failure of a batch
#[derive(Debug, Clone, thiserror::Error)]
#[error("deploying {slug}: {message}")]
pub struct DeployError {
    pub slug: String,
    pub message: String,
    cancelled: bool,
}

impl DeployError {
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            crate::signal::EXIT_CODE_CANCELLED
        } else {
            3
        }
    }
}

/// Outcome of every task in a batch
#[derive(Debug, Default)]
pub struct DeployReport {
    /// Deployed slugs, in completion order
    pub deployed: Vec<String>,
    /// Failed slugs with their error, in completion order
    pub errored: Vec<(String, TaskError)>,
    /// Files skipped because they are no longer linked
    pub skipped: Vec<PathBuf>,
}

impl DeployReport {
    /// The first error encountered, if any task failed
    pub fn result(&self) -> Result<(), DeployError> {
        match self.errored.first() {
            Some((slug, err)) => Err(DeployError {
                slug: slug.clone(),
                message: err.to_string(),
                cancelled: err.is_cancelled(),
            }),
            None => Ok(()),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} deployed, {} failed, {} skipped",
            self.deployed.len(),
            self.errored.len(),
            self.skipped.len()
        )
    }

    /// Per-task status blocks, failures first
    pub fn render(&self, client: &dyn ApiClient) -> String {
        let mut out = String::new();
        for (slug, err) in &self.errored {
            let _ = writeln!(out, "\n{slug}\nStatus: failed\n{err}");
        }
        for slug in &self.deployed {
            let _ = writeln!(
                out,
                "\n{slug}\nStatus: succeeded\nExecute the task: {}",
                client.task_url(slug)
            );
        }
        out
    }
}

pub struct Deployer {
    client: Arc<dyn ApiClient>,
    builder: Arc<dyn BuildCreator>,
    changed_files: Vec<PathBuf>,
    upgrade_interpolation: bool,
}

impl Deployer {
    pub fn new(client: Arc<dyn ApiClient>, builder: Arc<dyn BuildCreator>) -> Self {
        Self {
            client,
            builder,
            changed_files: Vec::new(),
            upgrade_interpolation: false,
        }
    }

    /// Only deploy tasks whose root contains one of `files`
    pub fn with_changed_files(mut self, files: Vec<PathBuf>) -> Self {
        self.changed_files = files;
        self
    }

    /// Migrate tasks still on handlebars templates to JST
    pub fn with_upgrade_interpolation(mut self, upgrade: bool) -> Self {
        self.upgrade_interpolation = upgrade;
        self
    }

    /// Drop tasks untouched by the changed files, if any were given
    pub fn filter(&self, configs: Vec<TaskConfig>) -> Vec<TaskConfig> {
        if self.changed_files.is_empty() {
            return configs;
        }
        let total = configs.len();
        let kept: Vec<_> = configs
            .into_iter()
            .filter(|c| contains_file(&c.task_root, &self.changed_files))
            .collect();
        if kept.len() != total {
            tracing::info!(
                total,
                affected = kept.len(),
                "changed files specified, filtered tasks"
            );
        }
        kept
    }

    pub fn deploy(&self, cancel: &CancelToken, configs: Vec<TaskConfig>) -> DeployReport {
        let configs = self.filter(configs);
        if configs.is_empty() {
            tracing::info!("no tasks to deploy");
            return DeployReport::default();
        }

        tracing::info!(count = configs.len(), "deploying tasks");
        for config in &configs {
            tracing::info!(
                task = %config.task.slug,
                kind = %config.kind,
                root = %config.task_root.display(),
                workdir = %config.working_directory.display(),
                url = %self.client.task_url(&config.task.slug),
                "deploying task"
            );
        }

        let report = Mutex::new(DeployReport::default());
        thread::scope(|s| {
            for config in &configs {
                let report = &report;
                s.spawn(move || {
                    let outcome = self.deploy_task(cancel, config);
                    let mut report = report.lock().unwrap_or_else(|e| e.into_inner());
                    match outcome {
                        Ok(()) => report.deployed.push(config.task.slug.clone()),
                        Err(err) if err.is_not_linked() => {
                            tracing::warn!(file = %config.source_file.display(), "{err}, skipping");
                            report.skipped.push(config.source_file.clone());
                        }
                        Err(err) => {
                            tracing::debug!(task = %config.task.slug, error = %err, "task failed");
                            report.errored.push((config.task.slug.clone(), err));
                        }
                    }
                });
            }
        });
        report.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn deploy_task(&self, cancel: &CancelToken, config: &TaskConfig) -> Result<(), TaskError> {
        cancel.check().map_err(|_| TaskError::Cancelled)?;
        let task = &config.task;
        if config.source == TaskConfigSource::Script {
            ensure_linked(&config.source_file, &task.slug)?;
        }

        let mut request = match &config.definition {
            Some(def) => def.update_request(&config.source_file, task)?,
            None => {
                let mut request = UpdateTaskRequest::from(task);
                request.kind = config.kind;
                request.kind_options = config.kind_options.clone();
                request
            }
        };

        let mut interpolation_mode = task.interpolation_mode.clone();
        if interpolation_mode != INTERPOLATION_MODE_JST {
            if self.upgrade_interpolation {
                tracing::warn!(task = %task.slug, "migrating task from handlebars to JS templates");
                interpolation_mode = INTERPOLATION_MODE_JST.to_string();
                request.arguments = upgrade_arguments(config.kind, &request.arguments);
            } else {
                tracing::warn!(
                    task = %task.slug,
                    "task still uses handlebars templates; re-deploy with --jst to upgrade"
                );
            }
        }

        if config.kind.needs_building() {
            let git_file = config.task_file_path.as_deref().unwrap_or(&config.source_file);
            let env = match &config.definition {
                Some(def) => def.env(&config.source_file)?,
                None => task.env.clone(),
            };
            let resp = self.builder.create_build(
                cancel,
                &BuildRequest {
                    root: config.task_root.clone(),
                    slug: task.slug.clone(),
                    task_id: task.id.clone(),
                    kind: config.kind,
                    kind_options: request.kind_options.clone(),
                    env,
                    shim: true,
                    git_meta: git_meta(git_file),
                },
            )?;
            tracing::info!(task = %task.slug, build_id = %resp.build_id, image = %resp.image_url, "built task");
            request.image = Some(resp.image_url);
            request.build_id = Some(resp.build_id);
        }

        if !interpolation_mode.is_empty() {
            request.interpolation_mode = Some(interpolation_mode);
        }
        request.require_explicit_permissions = task.require_explicit_permissions;
        request.permissions = task.permissions.clone();

        self.client
            .update_task(&request)
            .map_err(|source| TaskError::Update {
                slug: task.slug.clone(),
                source,
            })?;
        tracing::info!(task = %task.slug, "updated task");
        Ok(())
    }
}

/// The script must still carry the link comment it was discovered by
fn ensure_linked(file: &Path, slug: &str) -> Result<(), TaskError> {
    match linked_slug(file)? {
        Some(linked) if linked == slug => Ok(()),
        _ => Err(TaskError::NotLinked {
            path: file.to_path_buf(),
        }),
    }
}

/// Whether any of `files` lives under `root`
fn contains_file(root: &Path, files: &[PathBuf]) -> bool {
    files.iter().any(|file| {
        let file = absolute(file);
        file.parent().is_some_and(|dir| dir.starts_with(root))
    })
}

fn json_placeholder() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{ *JSON *\}\}").ok())
        .as_ref()
}

/// Rewrite handlebars `{{ JSON }}` placeholders to their JST equivalent
pub fn upgrade_arguments(kind: TaskKind, arguments: &[String]) -> Vec<String> {
    let upgradable = matches!(
        kind,
        TaskKind::Deno | TaskKind::Go | TaskKind::Node | TaskKind::Python
    );
    match json_placeholder() {
        Some(re) if upgradable => arguments
            .iter()
            .map(|arg| re.replace_all(arg, "{{JSON.stringify(params)}}").into_owned())
            .collect(),
        _ => arguments.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    use taskpilot_api::{KindOptions, MockClient, Task};

    use crate::build::{BuildResponse, RecipeError};
    use crate::discover::{link_comment, TaskDefinition};

    #[derive(Default)]
    struct FakeBuilder {
        fail_slug: Option<String>,
        requests: Mutex<Vec<BuildRequest>>,
    }

    impl BuildCreator for FakeBuilder {
        fn create_build(
            &self,
            _cancel: &CancelToken,
            req: &BuildRequest,
        ) -> Result<BuildResponse, BuildError> {
            self.requests.lock().unwrap().push(req.clone());
            if self.fail_slug.as_deref() == Some(req.slug.as_str()) {
                return Err(BuildError::Recipe(RecipeError::MissingFile {
                    name: "main.py".into(),
                }));
            }
            Ok(BuildResponse {
                image_url: format!("registry.test/task-{}:b1", req.task_id),
                build_id: "b1".into(),
            })
        }
    }

    fn script_config(dir: &Path, slug: &str) -> TaskConfig {
        let file = dir.join(format!("{slug}.py"));
        let comment = link_comment(TaskKind::Python, &format!("https://app.test/t/{slug}"));
        fs::write(&file, format!("{comment}\n")).unwrap();
        let mut task = Task::new(format!("tsk_{slug}"), slug, TaskKind::Python);
        task.interpolation_mode = "jst".into();
        TaskConfig {
            source_file: file.clone(),
            task_root: dir.to_path_buf(),
            working_directory: dir.to_path_buf(),
            task_file_path: Some(file),
            kind: TaskKind::Python,
            kind_options: KindOptions::new().with("entrypoint", format!("{slug}.py")),
            task,
            source: TaskConfigSource::Script,
            definition: None,
        }
    }

    fn client_for(configs: &[TaskConfig]) -> Arc<MockClient> {
        let client = MockClient::new();
        for c in configs {
            client.add_task(c.task.clone());
        }
        Arc::new(client)
    }

    #[test]
    fn test_successful_deploy_updates_image_and_build() {
        let dir = tempfile::tempdir().unwrap();
        let configs = vec![script_config(dir.path(), "hello")];
        let client = client_for(&configs);
        let builder = Arc::new(FakeBuilder::default());
        let deployer = Deployer::new(client.clone(), builder.clone());

        let report = deployer.deploy(&CancelToken::new(), configs);
        assert_eq!(report.deployed, ["hello"]);
        assert!(report.result().is_ok());

        let update = &client.updates()[0];
        assert_eq!(update.image.as_deref(), Some("registry.test/task-tsk_hello:b1"));
        assert_eq!(update.build_id.as_deref(), Some("b1"));
        assert_eq!(update.interpolation_mode.as_deref(), Some("jst"));

        let req = &builder.requests.lock().unwrap()[0];
        assert!(req.shim);
        assert_eq!(req.kind_options.get_str("entrypoint"), Some("hello.py"));
    }

    #[test]
    fn test_one_failure_does_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let configs: Vec<_> = ["one", "two", "three"]
            .iter()
            .map(|s| script_config(dir.path(), s))
            .collect();
        let client = client_for(&configs);
        let builder = Arc::new(FakeBuilder {
            fail_slug: Some("two".into()),
            ..Default::default()
        });
        let report = Deployer::new(client.clone(), builder).deploy(&CancelToken::new(), configs);

        let mut deployed = report.deployed.clone();
        deployed.sort();
        assert_eq!(deployed, ["one", "three"]);
        assert_eq!(report.errored.len(), 1);
        assert_eq!(report.errored[0].0, "two");

        let err = report.result().unwrap_err();
        assert_eq!(err.slug, "two");
        assert_eq!(err.exit_code(), 3);
        assert_eq!(client.updates().len(), 2);
        assert_eq!(report.summary(), "2 deployed, 1 failed, 0 skipped");

        let rendered = report.render(client.as_ref());
        assert!(rendered.contains("two\nStatus: failed\nbuild: the file main.py is required"));
        assert!(rendered.contains("one\nStatus: succeeded\nExecute the task: "));
    }

    #[test]
    fn test_unlinked_script_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = script_config(dir.path(), "hello");
        fs::write(&config.source_file, "print('unlinked')\n").unwrap();
        let client = client_for(std::slice::from_ref(&config));
        let report = Deployer::new(client.clone(), Arc::new(FakeBuilder::default()))
            .deploy(&CancelToken::new(), vec![config]);

        assert!(report.deployed.is_empty());
        assert!(report.errored.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert!(report.result().is_ok());
        assert!(client.updates().is_empty());
    }

    #[test]
    fn test_changed_files_filter() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let configs = vec![script_config(a.path(), "alpha"), script_config(b.path(), "beta")];
        let client = client_for(&configs);
        let deployer = Deployer::new(client, Arc::new(FakeBuilder::default()))
            .with_changed_files(vec![b.path().join("sub/util.py")]);

        let kept = deployer.filter(configs);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].task.slug, "beta");

        let none = deployer.deploy(&CancelToken::new(), vec![script_config(a.path(), "alpha")]);
        assert_eq!(none.summary(), "0 deployed, 0 failed, 0 skipped");
    }

    fn image_config(dir: &Path) -> TaskConfig {
        let file = dir.join("pull.task.yaml");
        let def = TaskDefinition::parse(&file, "slug: pull\nimage:\n  image: alpine:3\n").unwrap();
        TaskConfig {
            source_file: file,
            task_root: dir.to_path_buf(),
            working_directory: dir.to_path_buf(),
            task_file_path: None,
            kind: TaskKind::Image,
            kind_options: KindOptions::new(),
            task: Task::new("tsk_pull", "pull", TaskKind::Image),
            source: TaskConfigSource::DefinitionFile,
            definition: Some(def),
        }
    }

    #[test]
    fn test_image_definition_is_not_built() {
        let dir = tempfile::tempdir().unwrap();
        let config = image_config(dir.path());
        let client = client_for(std::slice::from_ref(&config));
        let builder = Arc::new(FakeBuilder::default());
        let report = Deployer::new(client.clone(), builder.clone())
            .deploy(&CancelToken::new(), vec![config]);

        assert_eq!(report.deployed, ["pull"]);
        assert!(builder.requests.lock().unwrap().is_empty());
        let update = &client.updates()[0];
        assert_eq!(update.image.as_deref(), Some("alpine:3"));
        assert_eq!(update.build_id, None);
    }

    #[test]
    fn test_cancelled_deploy_never_updates() {
        let dir = tempfile::tempdir().unwrap();
        let configs = vec![image_config(dir.path()), script_config(dir.path(), "hello")];
        let client = client_for(&configs);
        let builder = Arc::new(FakeBuilder::default());
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = Deployer::new(client.clone(), builder.clone()).deploy(&cancel, configs);

        assert!(report.deployed.is_empty());
        assert_eq!(report.errored.len(), 2);
        assert!(report.errored.iter().all(|(_, err)| err.is_cancelled()));
        assert_eq!(report.result().unwrap_err().exit_code(), 130);
        assert_eq!(client.call_count("update_task"), 0);
        assert!(builder.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_jst_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = script_config(dir.path(), "hello");
        config.task.interpolation_mode = "handlebars".into();
        config.task.arguments = vec!["{{ JSON }}".into(), "--verbose".into()];
        let client = client_for(std::slice::from_ref(&config));

        Deployer::new(client.clone(), Arc::new(FakeBuilder::default()))
            .with_upgrade_interpolation(true)
            .deploy(&CancelToken::new(), vec![config]);

        let update = &client.updates()[0];
        assert_eq!(update.interpolation_mode.as_deref(), Some("jst"));
        assert_eq!(update.arguments, ["{{JSON.stringify(params)}}", "--verbose"]);
    }

    #[test]
    fn test_upgrade_arguments_only_for_code_kinds() {
        let args = vec!["{{JSON}}".to_string(), "{{  JSON }}".to_string()];
        assert_eq!(
            upgrade_arguments(TaskKind::Node, &args),
            ["{{JSON.stringify(params)}}", "{{JSON.stringify(params)}}"]
        );
        assert_eq!(upgrade_arguments(TaskKind::Image, &args), args);
    }

    #[test]
    fn test_cancelled_build_exit_code() {
        let err = TaskError::Build(BuildError::Cancelled);
        let report = DeployReport {
            errored: vec![("hello".into(), err)],
            ..Default::default()
        };
        assert_eq!(report.result().unwrap_err().exit_code(), 130);
    }
}
