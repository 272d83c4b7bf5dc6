//! Source files linked to a task by a comment

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use regex_lite::Regex;
use taskpilot_api::Task;

use super::runtime::Runtime;
use super::{DiscoverError, TaskConfig, TaskConfigSource, TaskDiscoverer};

/// Only the head of a file is searched for the link comment
pub const MAX_SLUG_SCAN_BYTES: u64 = 4096;

fn link_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"Linked to (https://\S*/t/\S+) \[do not edit this line\]").ok())
        .as_ref()
}

/// Slug named by the link comment in the first bytes of `file`, if any
pub fn linked_slug(file: &Path) -> Result<Option<String>, DiscoverError> {
    let io_err = |source| DiscoverError::Io {
        context: "reading",
        path: file.to_path_buf(),
        source,
    };
    let mut head = Vec::new();
    File::open(file)
        .map_err(io_err)?
        .take(MAX_SLUG_SCAN_BYTES)
        .read_to_end(&mut head)
        .map_err(io_err)?;
    let head = String::from_utf8_lossy(&head);

    Ok(link_pattern()
        .and_then(|re| re.captures(&head))
        .and_then(|caps| caps.get(1))
        .and_then(|url| slug_from_url(url.as_str())))
}

/// Last non-empty path segment of `url`
fn slug_from_url(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://")?;
    let path = rest.split_once('/').map(|(_, p)| p).unwrap_or("");
    let path = path.split(['?', '#']).next().unwrap_or("");
    path.split('/')
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

/// Recognizes scripts carrying a link comment.
///
/// Missing tasks are never created from scripts; they are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptDiscoverer;

impl TaskDiscoverer for ScriptDiscoverer {
    fn source(&self) -> TaskConfigSource {
        TaskConfigSource::Script
    }

    fn task_slug(&self, file: &Path) -> Result<Option<String>, DiscoverError> {
        if !Runtime::supports(file) {
            return Ok(None);
        }
        linked_slug(file)
    }

    fn task_config(&self, task: Task, file: &Path) -> Result<TaskConfig, DiscoverError> {
        let runtime = Runtime::lookup(file, task.kind).ok_or_else(|| {
            DiscoverError::UnsupportedFile {
                path: file.to_path_buf(),
                kind: task.kind,
            }
        })?;
        let root = runtime.root(file)?;
        let working_directory = runtime.working_directory(file, &root);
        let kind_options = runtime.kind_options(&task.kind_options, file, &root)?;
        Ok(TaskConfig {
            source_file: file.to_path_buf(),
            task_root: root,
            working_directory,
            task_file_path: Some(file.to_path_buf()),
            kind: runtime.kind(),
            kind_options,
            task,
            source: TaskConfigSource::Script,
            definition: None,
        })
    }

    fn handle_missing_task(&self, _file: &Path) -> Result<Option<Task>, DiscoverError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use taskpilot_api::TaskKind;

    use crate::discover::link_comment;

    #[test]
    fn test_slug_from_url() {
        assert_eq!(
            slug_from_url("https://app.taskpilot.dev/t/hello_world").as_deref(),
            Some("hello_world")
        );
        assert_eq!(
            slug_from_url("https://app.taskpilot.dev/t/hello/?env=prod").as_deref(),
            Some("hello")
        );
        assert_eq!(slug_from_url("http://app.taskpilot.dev/t/x"), None);
    }

    #[test]
    fn test_linked_slug_reads_comment() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        let comment = link_comment(TaskKind::Python, "https://app.taskpilot.dev/t/hello");
        fs::write(&file, format!("{comment}\n\ndef main(params):\n    pass\n")).unwrap();
        assert_eq!(linked_slug(&file).unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn test_link_beyond_scan_window_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        let padding = "#\n".repeat(MAX_SLUG_SCAN_BYTES as usize);
        let comment = link_comment(TaskKind::Python, "https://app.taskpilot.dev/t/hello");
        fs::write(&file, format!("{padding}{comment}\n")).unwrap();
        assert_eq!(linked_slug(&file).unwrap(), None);
    }

    #[test]
    fn test_unsupported_extension_is_not_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        fs::write(
            &file,
            "Linked to https://app.taskpilot.dev/t/hello [do not edit this line]",
        )
        .unwrap();
        assert_eq!(ScriptDiscoverer.task_slug(&file).unwrap(), None);
    }

    #[test]
    fn test_config_for_python_script() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        fs::write(&file, "").unwrap();
        let mut task = Task::new("tsk1", "hello", TaskKind::Python);
        task.kind_options.set("entrypoint", "old.py");

        let config = ScriptDiscoverer.task_config(task, &file).unwrap();
        assert_eq!(config.task_root, dir.path());
        assert_eq!(config.working_directory, dir.path());
        assert_eq!(config.kind_options.get_str("entrypoint"), Some("main.py"));
        assert_eq!(config.source, TaskConfigSource::Script);
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        fs::write(&file, "").unwrap();
        let task = Task::new("tsk1", "hello", TaskKind::Go);
        let err = ScriptDiscoverer.task_config(task, &file).unwrap_err();
        assert!(matches!(err, DiscoverError::UnsupportedFile { .. }));
    }
}
