//! Local container builds through the docker CLI

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use base64::Engine;
use taskpilot_api::RegistryTokenResponse;

use crate::cancel::CancelToken;

/// Path of the recipe inside the build context
pub const CONTEXT_DOCKERFILE: &str = ".taskpilot/Dockerfile";

/// Platform every task image targets
pub const PLATFORM: &str = "linux/amd64";

/// Registry user paired with an access token
const TOKEN_USER: &str = "oauth2accesstoken";

/// Lines of output kept for error messages
const TAIL_LINES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("docker {step}: {source}")]
    Spawn {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("docker {step} failed ({status}): {output}")]
    Failed {
        step: &'static str,
        status: String,
        output: String,
    },

    #[error("writing registry credentials: {0}")]
    Credentials(#[source] io::Error),

    #[error("docker {step} cancelled")]
    Cancelled { step: &'static str },
}

/// A container engine able to build and push images
pub trait DockerEngine: Send + Sync {
    /// Build `context` (an uncompressed tar) and tag the result `tag`
    fn build(
        &self,
        cancel: &CancelToken,
        context: &Path,
        tag: &str,
        build_args: &[(String, String)],
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), DockerError>;

    fn push(
        &self,
        cancel: &CancelToken,
        image: &str,
        auth: &RegistryTokenResponse,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), DockerError>;
}

/// Drives the `docker` executable
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerEngine for DockerCli {
    fn build(
        &self,
        cancel: &CancelToken,
        context: &Path,
        tag: &str,
        build_args: &[(String, String)],
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), DockerError> {
        let stdin = File::open(context).map_err(|source| DockerError::Spawn {
            step: "build",
            source,
        })?;
        let mut cmd = Command::new(&self.binary);
        cmd.args(["build", "--platform", PLATFORM, "-f", CONTEXT_DOCKERFILE, "-t", tag]);
        for (name, value) in build_args {
            cmd.arg("--build-arg").arg(format!("{name}={value}"));
        }
        cmd.arg("-").stdin(Stdio::from(stdin));
        tracing::debug!(%tag, build_args = build_args.len(), "docker build");
        run_streaming(cancel, "build", cmd, on_line)
    }

    fn push(
        &self,
        cancel: &CancelToken,
        image: &str,
        auth: &RegistryTokenResponse,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), DockerError> {
        let config = tempfile::tempdir().map_err(DockerError::Credentials)?;
        let contents = registry_config(auth.host(), &auth.token).to_string();
        fs::write(config.path().join("config.json"), contents).map_err(DockerError::Credentials)?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--config")
            .arg(config.path())
            .args(["push", image])
            .stdin(Stdio::null());
        tracing::debug!(%image, host = auth.host(), "docker push");
        run_streaming(cancel, "push", cmd, on_line)
    }
}

/// Docker client config granting `token` on `host`
fn registry_config(host: &str, token: &str) -> serde_json::Value {
    let auth = base64::engine::general_purpose::STANDARD.encode(format!("{TOKEN_USER}:{token}"));
    serde_json::json!({ "auths": { host: { "auth": auth } } })
}

/// Run `cmd`, passing each stdout/stderr line to `on_line` as it arrives.
///
/// The child is killed if `cancel` fires. A non-zero exit carries the last
/// lines of output.
fn run_streaming(
    cancel: &CancelToken,
    step: &'static str,
    mut cmd: Command,
    on_line: &mut dyn FnMut(&str),
) -> Result<(), DockerError> {
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| DockerError::Spawn { step, source })?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut tail: Vec<String> = Vec::new();
    let mut cancelled = false;
    thread::scope(|s| {
        let (tx, rx) = mpsc::channel::<String>();
        for stream in [stdout.map(boxed), stderr.map(boxed)].into_iter().flatten() {
            let tx = tx.clone();
            s.spawn(move || {
                for line in BufReader::new(stream).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(line) => {
                    on_line(&line);
                    tail.push(line);
                    if tail.len() > TAIL_LINES {
                        tail.remove(0);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                let _ = child.kill();
            }
        }
    });

    let status = child
        .wait()
        .map_err(|source| DockerError::Spawn { step, source })?;
    if cancelled {
        return Err(DockerError::Cancelled { step });
    }
    if !status.success() {
        return Err(DockerError::Failed {
            step,
            status: status.to_string(),
            output: tail.join("\n"),
        });
    }
    Ok(())
}

fn boxed<R: Read + Send + 'static>(r: R) -> Box<dyn Read + Send> {
    Box::new(r)
}
