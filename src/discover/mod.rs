//! Task discovery
//!
//! Walks files and directories and asks each registered [`TaskDiscoverer`]
//! whether a file belongs to a remote task. The first strategy to recognize a
//! file wins. Slugs that do not resolve are handed to the strategy's missing
//! task handler, which may create the task or skip the file.

mod definition;
pub mod runtime;
mod script;

pub use definition::{is_definition_file, DefinitionDiscoverer, TaskDefinition};
pub use runtime::{link_comment, Runtime};
pub use script::{linked_slug, ScriptDiscoverer, MAX_SLUG_SCAN_BYTES};

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use taskpilot_api::{ApiClient, ApiError, KindOptions, Task, TaskKind};

/// Directory names never descended into
pub const IGNORED_DIRECTORIES: &[&str] = &["node_modules", "__pycache__", ".git"];

/// How a task config was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskConfigSource {
    /// A source file carrying a link comment
    Script,
    /// A `*.task.yaml` / `*.task.json` definition
    DefinitionFile,
}

impl TaskConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::DefinitionFile => "definition-file",
        }
    }
}

/// A discovered task, ready to build and deploy
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// The script or definition file the task was discovered from
    pub source_file: PathBuf,
    /// Absolute build root
    pub task_root: PathBuf,
    /// Where build commands run; differs from the root for nested packages
    pub working_directory: PathBuf,
    /// Absolute path of the entrypoint, when the kind has one
    pub task_file_path: Option<PathBuf>,
    pub task: Task,
    pub kind: TaskKind,
    pub kind_options: KindOptions,
    pub source: TaskConfigSource,
    /// The parsed definition, for [`TaskConfigSource::DefinitionFile`]
    pub definition: Option<TaskDefinition>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoverError {
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{operation} {slug}: {source}")]
    Api {
        operation: &'static str,
        slug: String,
        #[source]
        source: ApiError,
    },

    #[error("cannot determine how to deploy {path} as a {kind} task")]
    UnsupportedFile { path: PathBuf, kind: TaskKind },

    #[error("no {marker} found in any parent directory of {path}")]
    MissingMarker { marker: &'static str, path: PathBuf },

    #[error("{path} is outside of its task root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("reading task definition {path}: {reason}")]
    Definition { path: PathBuf, reason: String },

    #[error("{path}: incomplete task definition")]
    Incomplete { path: PathBuf },

    #[error("{path}: task definition has more than one kind section")]
    AmbiguousKind { path: PathBuf },

    #[error("asking for confirmation: {0}")]
    Prompt(#[source] io::Error),
}

impl DiscoverError {
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// One way of recognizing task files
pub trait TaskDiscoverer: Send + Sync {
    fn source(&self) -> TaskConfigSource;

    /// The slug `file` is linked to, if this strategy recognizes it
    fn task_slug(&self, file: &Path) -> Result<Option<String>, DiscoverError>;

    fn task_config(&self, task: Task, file: &Path) -> Result<TaskConfig, DiscoverError>;

    /// Called when the slug has no remote task. `None` skips the file.
    fn handle_missing_task(&self, file: &Path) -> Result<Option<Task>, DiscoverError>;
}

pub struct Discoverer {
    discoverers: Vec<Box<dyn TaskDiscoverer>>,
    client: Arc<dyn ApiClient>,
}

impl Discoverer {
    pub fn new(client: Arc<dyn ApiClient>) -> Self {
        Self {
            discoverers: Vec::new(),
            client,
        }
    }

    /// Register a strategy. Strategies are consulted in registration order.
    pub fn with(mut self, discoverer: impl TaskDiscoverer + 'static) -> Self {
        self.discoverers.push(Box::new(discoverer));
        self
    }

    /// Discover tasks under `paths`, depth first, each directory's entries
    /// in name order
    pub fn discover<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<TaskConfig>, DiscoverError> {
        let mut configs = Vec::new();
        for path in paths {
            self.visit(&absolute(path.as_ref()), &mut configs)?;
        }
        Ok(configs)
    }

    fn visit(&self, path: &Path, configs: &mut Vec<TaskConfig>) -> Result<(), DiscoverError> {
        let io_err = |context: &'static str| {
            move |source| DiscoverError::Io {
                context,
                path: path.to_path_buf(),
                source,
            }
        };
        let metadata = fs::metadata(path).map_err(io_err("inspecting"))?;

        if metadata.is_dir() {
            let ignored = path
                .file_name()
                .is_some_and(|name| IGNORED_DIRECTORIES.iter().any(|d| name == *d));
            if ignored {
                return Ok(());
            }
            let mut entries = fs::read_dir(path)
                .map_err(io_err("reading directory"))?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(io_err("reading directory"))?;
            entries.sort();
            for entry in entries {
                self.visit(&entry, configs)?;
            }
            return Ok(());
        }

        tracing::debug!(file = %path.display(), "exploring file");
        for discoverer in &self.discoverers {
            let Some(slug) = discoverer.task_slug(path)? else {
                continue;
            };
            if let Some(config) = self.resolve(discoverer.as_ref(), &slug, path)? {
                configs.push(config);
            }
            break;
        }
        Ok(())
    }

    fn resolve(
        &self,
        discoverer: &dyn TaskDiscoverer,
        slug: &str,
        file: &Path,
    ) -> Result<Option<TaskConfig>, DiscoverError> {
        let task = match self.client.get_task(slug) {
            Ok(task) => task,
            Err(e) if e.is_task_missing() => match discoverer.handle_missing_task(file)? {
                Some(task) => task,
                None => {
                    tracing::warn!(%slug, file = %file.display(), "task does not exist, skipping deploy");
                    return Ok(None);
                }
            },
            Err(source) => {
                return Err(DiscoverError::Api {
                    operation: "getting task",
                    slug: slug.to_string(),
                    source,
                })
            }
        };
        let mut config = discoverer.task_config(task, file)?;
        config.source = discoverer.source();
        tracing::debug!(
            %slug,
            source = config.source.as_str(),
            root = %config.task_root.display(),
            "discovered task"
        );
        Ok(Some(config))
    }
}

/// Absolute, lexically normalized form of `path`
pub(crate) fn absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `rel` with `/` separators
pub(crate) fn slash_relative(path: &Path, root: &Path) -> Result<String, DiscoverError> {
    let rel = path.strip_prefix(root).map_err(|_| DiscoverError::OutsideRoot {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use taskpilot_api::MockClient;

    /// Recognizes `*.task` files whose content is the slug
    struct PlainDiscoverer {
        missing: Mutex<Vec<PathBuf>>,
        create: bool,
    }

    impl PlainDiscoverer {
        fn new(create: bool) -> Self {
            Self {
                missing: Mutex::new(Vec::new()),
                create,
            }
        }
    }

    impl TaskDiscoverer for PlainDiscoverer {
        fn source(&self) -> TaskConfigSource {
            TaskConfigSource::Script
        }

        fn task_slug(&self, file: &Path) -> Result<Option<String>, DiscoverError> {
            if file.extension().is_some_and(|e| e == "task") {
                return Ok(Some(fs::read_to_string(file).unwrap().trim().to_string()));
            }
            Ok(None)
        }

        fn task_config(&self, task: Task, file: &Path) -> Result<TaskConfig, DiscoverError> {
            let root = file.parent().unwrap().to_path_buf();
            Ok(TaskConfig {
                source_file: file.to_path_buf(),
                working_directory: root.clone(),
                task_root: root,
                task_file_path: Some(file.to_path_buf()),
                kind: task.kind,
                kind_options: KindOptions::new(),
                task,
                source: TaskConfigSource::DefinitionFile,
                definition: None,
            })
        }

        fn handle_missing_task(&self, file: &Path) -> Result<Option<Task>, DiscoverError> {
            self.missing.lock().unwrap().push(file.to_path_buf());
            Ok(self
                .create
                .then(|| Task::new("tsk_created", "created", TaskKind::Python)))
        }
    }

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn client() -> Arc<MockClient> {
        Arc::new(
            MockClient::new()
                .with_task(Task::new("tsk_a", "alpha", TaskKind::Python))
                .with_task(Task::new("tsk_b", "beta", TaskKind::Python)),
        )
    }

    #[test]
    fn test_depth_first_name_order_and_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b/one.task", "beta");
        write(dir.path(), "a.task", "alpha");
        write(dir.path(), "node_modules/x.task", "alpha");
        write(dir.path(), "a/.git/y.task", "alpha");
        write(dir.path(), "readme.md", "alpha");

        let discoverer = Discoverer::new(client()).with(PlainDiscoverer::new(false));
        let configs = discoverer.discover(&[dir.path()]).unwrap();
        let slugs: Vec<_> = configs.iter().map(|c| c.task.slug.as_str()).collect();
        assert_eq!(slugs, ["alpha", "beta"]);
        assert!(configs.iter().all(|c| c.source == TaskConfigSource::Script));
        assert_eq!(configs[1].task_root, dir.path().join("b"));
    }

    #[test]
    fn test_missing_task_is_skipped_or_created() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ghost.task", "ghost");

        let skipping = Discoverer::new(client()).with(PlainDiscoverer::new(false));
        assert!(skipping.discover(&[dir.path()]).unwrap().is_empty());

        let creating = Discoverer::new(client()).with(PlainDiscoverer::new(true));
        let configs = creating.discover(&[dir.path()]).unwrap();
        assert_eq!(configs[0].task.slug, "created");
    }

    #[test]
    fn test_api_failure_aborts_discovery() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.task", "alpha");
        let client = client();
        client.fail("get_task", "unavailable");
        let discoverer = Discoverer::new(client).with(PlainDiscoverer::new(false));
        let err = discoverer.discover(&[dir.path()]).unwrap_err();
        assert!(matches!(err, DiscoverError::Api { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_missing_path_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let discoverer = Discoverer::new(client()).with(PlainDiscoverer::new(false));
        let err = discoverer.discover(&[dir.path().join("nope")]).unwrap_err();
        assert!(matches!(err, DiscoverError::Io { context: "inspecting", .. }));
    }

    #[test]
    fn test_absolute_normalizes() {
        assert_eq!(absolute(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert!(absolute(Path::new("rel")).is_absolute());
    }

    #[test]
    fn test_slash_relative() {
        let rel = slash_relative(Path::new("/r/src/main.py"), Path::new("/r")).unwrap();
        assert_eq!(rel, "src/main.py");
        assert!(slash_relative(Path::new("/x/main.py"), Path::new("/r")).is_err());
    }
}
