//! Build recipes
//!
//! [`build_dockerfile`] maps a task kind and its options to a Dockerfile plus
//! any generated files (shims) the Dockerfile expects in the build context.
//! Recipes only check that the files they need exist under the root; they
//! never read the user's source except for a user-supplied Dockerfile.

mod deno;
mod dockerfile;
mod go;
mod node;
mod python;
mod shell;

pub use shell::{find_dockerfile, DOCKERFILE_NAMES};

use std::path::{Path, PathBuf};

use serde_json::Value;
use taskpilot_api::{KindOptions, TaskKind};

/// Directory the task source is copied to inside the image
pub const WORKDIR: &str = "/taskpilot";

/// Context directory for generated files
pub const GENERATED_DIR: &str = ".taskpilot";

#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("build: the file {name} is required")]
    MissingFile { name: String },

    #[error("build: {kind} tasks require the {option:?} option")]
    MissingOption {
        kind: TaskKind,
        option: &'static str,
    },

    #[error("build: unknown language {0:?}, expected \"javascript\" or \"typescript\"")]
    UnknownLanguage(String),

    #[error("build: {0} tasks are not built")]
    NotBuildable(TaskKind),

    #[error("build: reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A Dockerfile and the generated files it depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub dockerfile: String,
    /// `(context-relative path, contents)`
    pub files: Vec<(String, String)>,
}

impl Recipe {
    fn new(dockerfile: String) -> Self {
        Self {
            dockerfile,
            files: Vec::new(),
        }
    }

    fn with_file(mut self, path: String, contents: String) -> Self {
        self.files.push((path, contents));
        self
    }
}

/// Produce the recipe for `kind` rooted at `root`
pub fn build_dockerfile(
    kind: TaskKind,
    root: &Path,
    options: &KindOptions,
    shim: bool,
) -> Result<Recipe, RecipeError> {
    match kind {
        TaskKind::Go => go::recipe(root, options),
        TaskKind::Node => node::recipe(root, options, shim),
        TaskKind::Python => python::recipe(root, options, shim),
        TaskKind::Deno => deno::recipe(root, options, shim),
        TaskKind::Shell => shell::recipe(root, options),
        TaskKind::Dockerfile => dockerfile::recipe(root, options),
        TaskKind::Image => Err(RecipeError::NotBuildable(kind)),
    }
}

/// Fail with the first of `names` (relative to `root`) that does not exist
fn require(root: &Path, names: &[&str]) -> Result<(), RecipeError> {
    for name in names {
        if !root.join(name).exists() {
            let base = Path::new(name)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| name.to_string());
            return Err(RecipeError::MissingFile { name: base });
        }
    }
    Ok(())
}

/// String option, accepting numbers too (`nodeVersion: 18`)
fn option(options: &KindOptions, key: &str) -> Option<String> {
    match options.0.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn entrypoint(kind: TaskKind, options: &KindOptions) -> Result<String, RecipeError> {
    option(options, "entrypoint").ok_or(RecipeError::MissingOption {
        kind,
        option: "entrypoint",
    })
}

/// A double-quoted string usable in exec-form Dockerfile instructions and as
/// a script literal
fn quoted(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// `/taskpilot/<rel>`
fn in_workdir(rel: &str) -> String {
    format!("{WORKDIR}/{}", rel.trim_start_matches("./"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_image_kind_is_not_buildable() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_dockerfile(TaskKind::Image, dir.path(), &KindOptions::new(), true)
            .unwrap_err();
        assert!(matches!(err, RecipeError::NotBuildable(TaskKind::Image)));
    }

    #[test]
    fn test_every_buildable_kind_dispatches() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["main.go", "go.mod", "go.sum", "main.py", "main.ts", "package.json", "run.sh"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        let cases = [
            (TaskKind::Go, KindOptions::new().with("entrypoint", "main.go")),
            (
                TaskKind::Node,
                KindOptions::new()
                    .with("entrypoint", "main.ts")
                    .with("language", "typescript"),
            ),
            (TaskKind::Python, KindOptions::new().with("entrypoint", "main.py")),
            (TaskKind::Deno, KindOptions::new().with("entrypoint", "main.ts")),
            (TaskKind::Shell, KindOptions::new().with("entrypoint", "run.sh")),
            (TaskKind::Dockerfile, KindOptions::new().with("dockerfile", "Dockerfile")),
        ];
        for (kind, options) in cases {
            let recipe = build_dockerfile(kind, dir.path(), &options, true)
                .unwrap_or_else(|e| panic!("{kind}: {e}"));
            assert!(recipe.dockerfile.contains("FROM"), "{kind}");
        }
    }

    #[test]
    fn test_missing_file_names_basename() {
        let dir = tempfile::tempdir().unwrap();
        let err = require(dir.path(), &["sub/main.py"]).unwrap_err();
        assert_eq!(err.to_string(), "build: the file main.py is required");
    }

    #[test]
    fn test_option_accepts_numbers() {
        let options = KindOptions::new().with("nodeVersion", 18);
        assert_eq!(option(&options, "nodeVersion").as_deref(), Some("18"));
        assert_eq!(option(&options, "missing"), None);
    }

    #[test]
    fn test_quoted_escapes() {
        assert_eq!(quoted(r#"a "b".py"#), r#""a \"b\".py""#);
    }
}
