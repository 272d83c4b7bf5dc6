//! Declarative task definition files (`*.task.yaml`, `*.task.json`)

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use taskpilot_api::{
    ApiClient, CreateTaskRequest, EnvVar, KindOptions, Task, TaskEnv, TaskKind, UpdateTaskRequest,
};

use super::{absolute, DiscoverError, TaskConfig, TaskConfigSource, TaskDiscoverer};
use crate::prompt::Confirmer;

const DEFINITION_SUFFIXES: &[&str] = &[".task.yaml", ".task.yml", ".task.json"];

/// Whether `path` is named like a task definition
pub fn is_definition_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| DEFINITION_SUFFIXES.iter().any(|s| name.ends_with(s)))
}

/// An environment variable as written in a definition: a bare string or a
/// `{value}` / `{config}` table
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DefinitionEnvVar {
    Literal(String),
    Table(EnvVar),
}

pub type DefinitionEnv = BTreeMap<String, DefinitionEnvVar>;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EntrypointSection {
    pub entrypoint: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub env: DefinitionEnv,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSection {
    pub entrypoint: String,
    #[serde(default)]
    pub node_version: Option<Value>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub env: DefinitionEnv,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DockerfileSection {
    pub dockerfile: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub env: DefinitionEnv,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ImageSection {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub env: DefinitionEnv,
}

/// A parsed definition file. Exactly one kind section must be present.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskDefinition {
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
    #[serde(default)]
    pub timeout: u64,

    #[serde(default)]
    pub deno: Option<EntrypointSection>,
    #[serde(default)]
    pub dockerfile: Option<DockerfileSection>,
    #[serde(default)]
    pub go: Option<EntrypointSection>,
    #[serde(default)]
    pub image: Option<ImageSection>,
    #[serde(default)]
    pub node: Option<NodeSection>,
    #[serde(default)]
    pub python: Option<EntrypointSection>,
    #[serde(default)]
    pub shell: Option<EntrypointSection>,
}

/// Borrowed view of whichever kind section is set
#[derive(Debug, Clone, Copy)]
struct Section<'a> {
    kind: TaskKind,
    entrypoint: Option<&'a str>,
    arguments: &'a [String],
    root: Option<&'a str>,
    env: &'a DefinitionEnv,
}

impl EntrypointSection {
    fn section(&self, kind: TaskKind) -> Section<'_> {
        Section {
            kind,
            entrypoint: Some(self.entrypoint.as_str()),
            arguments: &self.arguments,
            root: self.root.as_deref(),
            env: &self.env,
        }
    }
}

impl TaskDefinition {
    pub fn from_file(path: &Path) -> Result<Self, DiscoverError> {
        let contents = fs::read_to_string(path).map_err(|source| DiscoverError::Io {
            context: "reading",
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &contents)
    }

    /// Parse YAML or JSON; `path` is only used in errors
    pub fn parse(path: &Path, contents: &str) -> Result<Self, DiscoverError> {
        serde_yaml::from_str(contents).map_err(|e| DiscoverError::Definition {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Set kind sections, in kind precedence order
    fn sections(&self) -> Vec<Section<'_>> {
        let dockerfile = self.dockerfile.as_ref().map(|s| Section {
            kind: TaskKind::Dockerfile,
            entrypoint: None,
            arguments: &s.arguments,
            root: s.root.as_deref(),
            env: &s.env,
        });
        let image = self.image.as_ref().map(|s| Section {
            kind: TaskKind::Image,
            entrypoint: None,
            arguments: &s.arguments,
            root: s.root.as_deref(),
            env: &s.env,
        });
        let node = self.node.as_ref().map(|s| Section {
            kind: TaskKind::Node,
            entrypoint: Some(s.entrypoint.as_str()),
            arguments: &s.arguments,
            root: s.root.as_deref(),
            env: &s.env,
        });
        [
            self.deno.as_ref().map(|s| s.section(TaskKind::Deno)),
            dockerfile,
            self.go.as_ref().map(|s| s.section(TaskKind::Go)),
            image,
            node,
            self.python.as_ref().map(|s| s.section(TaskKind::Python)),
            self.shell.as_ref().map(|s| s.section(TaskKind::Shell)),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn section(&self, path: &Path) -> Result<Section<'_>, DiscoverError> {
        let mut sections = self.sections();
        match sections.len() {
            0 => Err(DiscoverError::Incomplete {
                path: path.to_path_buf(),
            }),
            1 => Ok(sections.remove(0)),
            _ => Err(DiscoverError::AmbiguousKind {
                path: path.to_path_buf(),
            }),
        }
    }

    pub fn kind(&self, path: &Path) -> Result<TaskKind, DiscoverError> {
        Ok(self.section(path)?.kind)
    }

    /// Entrypoint relative to the task root; dockerfile and image tasks have none
    pub fn entrypoint(&self, path: &Path) -> Result<Option<&str>, DiscoverError> {
        Ok(self.section(path)?.entrypoint)
    }

    pub fn arguments(&self, path: &Path) -> Result<&[String], DiscoverError> {
        Ok(self.section(path)?.arguments)
    }

    /// Absolute task root for a definition stored at `path`
    pub fn root(&self, path: &Path) -> Result<PathBuf, DiscoverError> {
        let section = self.section(path)?;
        let dir = path.parent().unwrap_or(Path::new("."));
        Ok(absolute(&dir.join(section.root.unwrap_or("."))))
    }

    pub fn env(&self, path: &Path) -> Result<TaskEnv, DiscoverError> {
        Ok(self
            .section(path)?
            .env
            .iter()
            .map(|(name, var)| {
                let var = match var {
                    DefinitionEnvVar::Literal(value) => EnvVar::value(value.clone()),
                    DefinitionEnvVar::Table(var) => var.clone(),
                };
                (name.clone(), var)
            })
            .collect())
    }

    pub fn kind_options(&self, path: &Path) -> Result<KindOptions, DiscoverError> {
        let section = self.section(path)?;
        let mut options = KindOptions::new();
        if let Some(entrypoint) = section.entrypoint {
            options.set("entrypoint", entrypoint);
        }
        match section.kind {
            TaskKind::Node => {
                let node = self.node.as_ref();
                match node.and_then(|n| n.node_version.as_ref()) {
                    Some(Value::String(v)) => options.set("nodeVersion", v.as_str()),
                    Some(Value::Number(v)) => options.set("nodeVersion", v.to_string()),
                    _ => {}
                }
                let typescript = section.entrypoint.is_some_and(|e| e.ends_with(".ts"));
                options.set("language", if typescript { "typescript" } else { "javascript" });
            }
            TaskKind::Dockerfile => {
                if let Some(d) = &self.dockerfile {
                    options.set("dockerfile", d.dockerfile.as_str());
                }
            }
            _ => {}
        }
        Ok(options)
    }

    fn image_and_command(&self) -> (Option<String>, Vec<String>) {
        match &self.image {
            Some(image) => (Some(image.image.clone()), image.command.clone()),
            None => (None, Vec::new()),
        }
    }

    /// Request replacing `task`'s fields with this definition's.
    ///
    /// Permissions are not part of a definition and are kept from `task`.
    pub fn update_request(&self, path: &Path, task: &Task) -> Result<UpdateTaskRequest, DiscoverError> {
        let (image, command) = self.image_and_command();
        Ok(UpdateTaskRequest {
            slug: self.slug.clone(),
            name: non_empty(&self.name, &task.name),
            description: self.description.clone(),
            image,
            command,
            arguments: self.arguments(path)?.to_vec(),
            parameters: self.parameters.clone(),
            env: self.env(path)?,
            kind: self.kind(path)?,
            kind_options: self.kind_options(path)?,
            timeout: self.timeout,
            interpolation_mode: None,
            build_id: None,
            require_explicit_permissions: task.require_explicit_permissions,
            permissions: task.permissions.clone(),
        })
    }

    pub fn create_request(&self, path: &Path) -> Result<CreateTaskRequest, DiscoverError> {
        let (image, command) = self.image_and_command();
        Ok(CreateTaskRequest {
            slug: self.slug.clone(),
            name: non_empty(&self.name, &self.slug),
            description: self.description.clone(),
            image,
            command,
            arguments: self.arguments(path)?.to_vec(),
            parameters: self.parameters.clone(),
            env: self.env(path)?,
            kind: self.kind(path)?,
            kind_options: self.kind_options(path)?,
            timeout: self.timeout,
        })
    }
}

fn non_empty(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

/// Recognizes definition files; offers to create tasks that do not exist yet
pub struct DefinitionDiscoverer {
    client: Arc<dyn ApiClient>,
    confirmer: Arc<dyn Confirmer>,
}

impl DefinitionDiscoverer {
    pub fn new(client: Arc<dyn ApiClient>, confirmer: Arc<dyn Confirmer>) -> Self {
        Self { client, confirmer }
    }
}

impl TaskDiscoverer for DefinitionDiscoverer {
    fn source(&self) -> TaskConfigSource {
        TaskConfigSource::DefinitionFile
    }

    fn task_slug(&self, file: &Path) -> Result<Option<String>, DiscoverError> {
        if !is_definition_file(file) {
            return Ok(None);
        }
        let def = TaskDefinition::from_file(file)?;
        Ok(Some(def.slug).filter(|s| !s.is_empty()))
    }

    fn task_config(&self, task: Task, file: &Path) -> Result<TaskConfig, DiscoverError> {
        let def = TaskDefinition::from_file(file)?;
        let root = def.root(file)?;
        let task_file_path = def.entrypoint(file)?.map(|e| absolute(&root.join(e)));
        Ok(TaskConfig {
            source_file: file.to_path_buf(),
            working_directory: root.clone(),
            task_root: root,
            task_file_path,
            kind: def.kind(file)?,
            kind_options: def.kind_options(file)?,
            task,
            source: TaskConfigSource::DefinitionFile,
            definition: Some(def),
        })
    }

    fn handle_missing_task(&self, file: &Path) -> Result<Option<Task>, DiscoverError> {
        let def = TaskDefinition::from_file(file)?;
        if !self.confirmer.can_prompt() {
            return Ok(None);
        }
        let question = format!(
            "Task with slug {} does not exist. Would you like to create a new task?",
            def.slug
        );
        if !self.confirmer.confirm(&question).map_err(DiscoverError::Prompt)? {
            return Ok(None);
        }

        tracing::info!(slug = %def.slug, "creating task");
        let api_err = |operation| {
            let slug = def.slug.clone();
            move |source| DiscoverError::Api {
                operation,
                slug,
                source,
            }
        };
        self.client
            .create_task(&def.create_request(file)?)
            .map_err(api_err("creating task"))?;
        let task = self
            .client
            .get_task(&def.slug)
            .map_err(api_err("fetching created task"))?;
        Ok(Some(task))
    }
}
