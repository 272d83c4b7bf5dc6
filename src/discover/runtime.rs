//! Per-language rules for linked scripts: which files a kind accepts, where
//! the build root is, and how the link comment is written.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use taskpilot_api::{KindOptions, TaskKind};

use super::{slash_relative, DiscoverError};
use crate::build::recipe::DOCKERFILE_NAMES;

/// Language runtime of a linked script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Go,
    Node { typescript: bool },
    Deno,
    Python,
    Shell,
}

impl Runtime {
    /// Runtime able to run `file` as a task of `kind`
    pub fn lookup(file: &Path, kind: TaskKind) -> Option<Runtime> {
        let ext = file.extension()?.to_str()?;
        match (kind, ext) {
            (TaskKind::Go, "go") => Some(Runtime::Go),
            (TaskKind::Node, "js") => Some(Runtime::Node { typescript: false }),
            (TaskKind::Node, "ts") => Some(Runtime::Node { typescript: true }),
            (TaskKind::Deno, "ts" | "js") => Some(Runtime::Deno),
            (TaskKind::Python, "py") => Some(Runtime::Python),
            (TaskKind::Shell, "sh") => Some(Runtime::Shell),
            _ => None,
        }
    }

    /// Whether any runtime handles files with this extension
    pub fn supports(file: &Path) -> bool {
        TaskKind::ALL
            .iter()
            .any(|kind| Runtime::lookup(file, *kind).is_some())
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Runtime::Go => TaskKind::Go,
            Runtime::Node { .. } => TaskKind::Node,
            Runtime::Deno => TaskKind::Deno,
            Runtime::Python => TaskKind::Python,
            Runtime::Shell => TaskKind::Shell,
        }
    }

    /// Build root for `file`
    pub fn root(&self, file: &Path) -> Result<PathBuf, DiscoverError> {
        let dir = parent(file);
        match self {
            Runtime::Node { .. } => {
                let package = find_up(dir, &["package.json"]).ok_or_else(|| {
                    DiscoverError::MissingMarker {
                        marker: "package.json",
                        path: file.to_path_buf(),
                    }
                })?;
                let package_dir = parent(&package);
                match package_root_setting(&package)? {
                    Some(root) => Ok(super::absolute(&package_dir.join(root))),
                    None => Ok(package_dir.to_path_buf()),
                }
            }
            Runtime::Python => Ok(find_dir_up(dir, &["requirements.txt"])),
            Runtime::Shell => Ok(find_dir_up(dir, DOCKERFILE_NAMES)),
            Runtime::Go => Ok(find_dir_up(dir, &["go.mod"])),
            Runtime::Deno => Ok(find_dir_up(dir, &["deno.json", "deno.jsonc"])),
        }
    }

    /// Directory build commands run in; only node packages nest
    pub fn working_directory(&self, file: &Path, root: &Path) -> PathBuf {
        match self {
            Runtime::Node { .. } => find_up(parent(file), &["package.json"])
                .map(|p| parent(&p).to_path_buf())
                .unwrap_or_else(|| root.to_path_buf()),
            _ => root.to_path_buf(),
        }
    }

    /// `base` with the entrypoint and language filled in for `file`
    pub fn kind_options(
        &self,
        base: &KindOptions,
        file: &Path,
        root: &Path,
    ) -> Result<KindOptions, DiscoverError> {
        let mut options = base.clone();
        options.set("entrypoint", slash_relative(file, root)?);
        if let Runtime::Node { typescript } = self {
            let language = if *typescript { "typescript" } else { "javascript" };
            options.set("language", language);
            // Package directory below the root, for npm install and the entrypoint
            match slash_relative(&self.working_directory(file, root), root) {
                Ok(workdir) if !workdir.is_empty() => options.set("workdir", workdir),
                _ => {
                    options.0.remove("workdir");
                }
            }
        }
        Ok(options)
    }

    /// `text` as a line comment in this runtime's syntax
    pub fn comment(&self, text: &str) -> String {
        match self {
            Runtime::Go | Runtime::Node { .. } | Runtime::Deno => format!("// {text}"),
            Runtime::Python | Runtime::Shell => format!("# {text}"),
        }
    }
}

/// The comment linking a script of `kind` to the task at `url`
pub fn link_comment(kind: TaskKind, url: &str) -> String {
    let text = format!("Linked to {url} [do not edit this line]");
    match kind {
        TaskKind::Python | TaskKind::Shell => Runtime::Python.comment(&text),
        _ => Runtime::Go.comment(&text),
    }
}

#[derive(Deserialize)]
struct PackageJson {
    #[serde(default)]
    taskpilot: Option<PackageSettings>,
}

#[derive(Deserialize)]
struct PackageSettings {
    #[serde(default)]
    root: Option<String>,
}

fn package_root_setting(package: &Path) -> Result<Option<String>, DiscoverError> {
    let contents = fs::read_to_string(package).map_err(|source| DiscoverError::Io {
        context: "reading",
        path: package.to_path_buf(),
        source,
    })?;
    let parsed: PackageJson =
        serde_json::from_str(&contents).map_err(|e| DiscoverError::Definition {
            path: package.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(parsed
        .taskpilot
        .and_then(|s| s.root)
        .filter(|r| !r.is_empty()))
}

fn parent(path: &Path) -> &Path {
    path.parent().unwrap_or(path)
}

/// First file named one of `names` in `start` or its ancestors
fn find_up(start: &Path, names: &[&str]) -> Option<PathBuf> {
    start
        .ancestors()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Directory holding the nearest of `names`, else `start`
fn find_dir_up(start: &Path, names: &[&str]) -> PathBuf {
    find_up(start, names)
        .map(|p| parent(&p).to_path_buf())
        .unwrap_or_else(|| start.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_lookup_by_extension_and_kind() {
        let ts = Path::new("a/main.ts");
        assert_eq!(
            Runtime::lookup(ts, TaskKind::Node),
            Some(Runtime::Node { typescript: true })
        );
        assert_eq!(Runtime::lookup(ts, TaskKind::Deno), Some(Runtime::Deno));
        assert_eq!(Runtime::lookup(ts, TaskKind::Python), None);
        assert_eq!(Runtime::lookup(Path::new("Makefile"), TaskKind::Shell), None);
        assert!(Runtime::supports(Path::new("x.sh")));
        assert!(!Runtime::supports(Path::new("x.rb")));
    }

    #[test]
    fn test_node_root_is_nearest_package() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("package.json"), "{}");
        let file = dir.path().join("src/tasks/hello.ts");
        touch(&file, "");

        let runtime = Runtime::Node { typescript: true };
        let root = runtime.root(&file).unwrap();
        assert_eq!(root, dir.path());
        assert_eq!(runtime.working_directory(&file, &root), dir.path());

        let options = runtime.kind_options(&KindOptions::new(), &file, &root).unwrap();
        assert_eq!(options.get_str("entrypoint"), Some("src/tasks/hello.ts"));
        assert_eq!(options.get_str("language"), Some("typescript"));
    }

    #[test]
    fn test_node_root_setting_points_above_package() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("package.json"), "{}");
        touch(
            &dir.path().join("pkgs/api/package.json"),
            r#"{"name": "api", "taskpilot": {"root": "../.."}}"#,
        );
        let file = dir.path().join("pkgs/api/task.js");
        touch(&file, "");

        let runtime = Runtime::Node { typescript: false };
        let root = runtime.root(&file).unwrap();
        assert_eq!(root, dir.path());
        assert_eq!(
            runtime.working_directory(&file, &root),
            dir.path().join("pkgs/api")
        );
        let options = runtime.kind_options(&KindOptions::new(), &file, &root).unwrap();
        assert_eq!(options.get_str("entrypoint"), Some("pkgs/api/task.js"));
        assert_eq!(options.get_str("workdir"), Some("pkgs/api"));
    }

    #[test]
    fn test_workdir_only_set_for_nested_packages() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("package.json"), "{}");
        let file = dir.path().join("main.ts");
        touch(&file, "");

        let runtime = Runtime::Node { typescript: true };
        let root = runtime.root(&file).unwrap();
        let stale = KindOptions::new().with("workdir", "old/pkg");
        let options = runtime.kind_options(&stale, &file, &root).unwrap();
        assert_eq!(options.get_str("workdir"), None);

        let py = dir.path().join("jobs/main.py");
        touch(&py, "");
        let py_root = Runtime::Python.root(&py).unwrap();
        let options = Runtime::Python
            .kind_options(&KindOptions::new(), &py, &py_root)
            .unwrap();
        assert_eq!(options.get_str("workdir"), None);
    }

    #[test]
    fn test_node_without_package_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("task.js");
        touch(&file, "");
        let err = Runtime::Node { typescript: false }.root(&file).unwrap_err();
        assert!(matches!(err, DiscoverError::MissingMarker { marker: "package.json", .. }));
    }

    #[test]
    fn test_python_root_falls_back_to_file_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("jobs/main.py");
        touch(&file, "");
        assert_eq!(Runtime::Python.root(&file).unwrap(), dir.path().join("jobs"));

        touch(&dir.path().join("requirements.txt"), "");
        assert_eq!(Runtime::Python.root(&file).unwrap(), dir.path());
    }

    #[test]
    fn test_shell_root_follows_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("Dockerfile.taskpilot"), "FROM alpine");
        let file = dir.path().join("scripts/run.sh");
        touch(&file, "");
        assert_eq!(Runtime::Shell.root(&file).unwrap(), dir.path());
    }

    #[test]
    fn test_link_comment_syntax() {
        let url = "https://app.taskpilot.dev/t/hello";
        assert_eq!(
            link_comment(TaskKind::Python, url),
            "# Linked to https://app.taskpilot.dev/t/hello [do not edit this line]"
        );
        assert!(link_comment(TaskKind::Node, url).starts_with("// Linked to"));
        assert!(link_comment(TaskKind::Shell, url).starts_with("# "));
    }
}
