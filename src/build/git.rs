//! Best-effort git metadata for builds

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use taskpilot_api::BuildGitMeta;

/// Output from a git command
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[derive(Debug, thiserror::Error)]
enum GitError {
    #[error("executing git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {args} failed: {stderr}")]
    Failed { args: String, stderr: String },
}

fn git_command(dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
    tracing::trace!(?args, dir = %dir.display(), "running git");
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(GitError::Spawn)?;

    Ok(GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
    })
}

fn git_command_checked(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = git_command(dir, args)?;
    if !output.success {
        return Err(GitError::Failed {
            args: args.join(" "),
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Collect commit metadata for the repository containing `file`.
///
/// Returns `None` when `file` is not inside a git repository, and also when
/// any git command fails; failures are logged at debug level only.
pub fn git_meta(file: &Path) -> Option<BuildGitMeta> {
    let dir = file.parent().unwrap_or(file);
    let top = match git_command(dir, &["rev-parse", "--show-toplevel"]) {
        Ok(out) if out.success => PathBuf::from(out.stdout.trim()),
        Ok(out) => {
            if !out.stderr.contains("not a git repository") {
                tracing::debug!(stderr = %out.stderr.trim(), "failed to locate git repository");
            }
            return None;
        }
        Err(e) => {
            tracing::debug!(error = %e, "failed to gather git metadata");
            return None;
        }
    };

    match collect(&top, file) {
        Ok(meta) => Some(meta),
        Err(e) => {
            tracing::debug!(error = %e, file = %file.display(), "failed to gather git metadata");
            None
        }
    }
}

fn collect(top: &Path, file: &Path) -> Result<BuildGitMeta, GitError> {
    let file = file.canonicalize().unwrap_or_else(|_| file.to_path_buf());
    let top = top.canonicalize().unwrap_or_else(|_| top.to_path_buf());
    let file_path = file
        .strip_prefix(&top)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();

    let status = git_command_checked(&top, &["status", "--porcelain"])?;
    let head = git_command_checked(&top, &["log", "-1", "--format=%H%x00%an%x00%B"])?;
    let mut fields = head.splitn(3, '\0');
    let commit_hash = fields.next().unwrap_or_default().trim().to_string();
    let user = fields.next().unwrap_or_default().to_string();
    let commit_message = fields.next().unwrap_or_default().trim_end().to_string();
    let git_ref = git_command_checked(&top, &["rev-parse", "--abbrev-ref", "HEAD"])?
        .trim()
        .to_string();
    let repository = git_command(&top, &["config", "--get", "remote.origin.url"])?
        .stdout
        .trim()
        .to_string();

    Ok(BuildGitMeta {
        commit_hash,
        commit_message,
        git_ref,
        file_path,
        is_dirty: !status.trim().is_empty(),
        user,
        repository,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok()
    }

    fn git(dir: &Path, args: &[&str]) {
        let mut full = vec!["-c", "user.name=Ada", "-c", "user.email=ada@example.com"];
        full.extend_from_slice(args);
        let out = git_command(dir, &full).unwrap();
        assert!(out.success, "git {args:?}: {}", out.stderr);
    }

    #[test]
    fn test_outside_repository_is_none() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        // a stray GIT_DIR or enclosing checkout would make this meaningless
        if git_command(dir.path(), &["rev-parse", "--show-toplevel"]).unwrap().success {
            return;
        }
        fs::write(dir.path().join("main.py"), "").unwrap();
        assert!(git_meta(&dir.path().join("main.py")).is_none());
    }

    #[test]
    fn test_collects_commit_metadata() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q"]);
        git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/trunk"]);
        fs::create_dir_all(dir.path().join("tasks")).unwrap();
        fs::write(dir.path().join("tasks/main.py"), "print(1)\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "add task"]);

        let meta = git_meta(&dir.path().join("tasks/main.py")).unwrap();
        assert_eq!(meta.file_path, "tasks/main.py");
        assert_eq!(meta.git_ref, "trunk");
        assert_eq!(meta.commit_message, "add task");
        assert_eq!(meta.user, "Ada");
        assert_eq!(meta.commit_hash.len(), 40);
        assert!(!meta.is_dirty);

        fs::write(dir.path().join("tasks/main.py"), "print(2)\n").unwrap();
        assert!(git_meta(&dir.path().join("tasks/main.py")).unwrap().is_dirty);
    }
}
