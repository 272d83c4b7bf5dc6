//! Watching a remote run
//!
//! [`RunWatcher`] polls a run on its own thread and hands one [`RunState`] per
//! tick to the consumer over a rendezvous channel. Logs are sorted, and lines
//! already delivered are never delivered again. The stream ends after the
//! first stopped or errored state.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{Map, Value};
use taskpilot_api::{
    sort_logs, ApiClient, ApiError, LogItem, Outputs, RunStatus, RunTaskRequest,
};

use crate::cancel::CancelToken;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watch cancelled")]
    Cancelled,

    #[error("{operation} {run_id}: {source}")]
    Fetch {
        operation: &'static str,
        run_id: String,
        #[source]
        source: ApiError,
    },

    #[error("{operation}: {source}")]
    Api {
        operation: &'static str,
        #[source]
        source: ApiError,
    },

    #[error("the run watcher has stopped")]
    Closed,

    #[error("run {run_id} {status}")]
    RunFailed { run_id: String, status: RunStatus },
}

impl WatchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            WatchError::Cancelled => crate::signal::EXIT_CODE_CANCELLED,
            WatchError::RunFailed { .. } => 4,
            _ => 1,
        }
    }
}

/// A run at one polling tick
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub status: RunStatus,
    /// Lines not delivered by any earlier state, in `(timestamp, insert_id)` order
    pub logs: Vec<LogItem>,
    /// Token the next log page was requested with
    pub prev_page_token: String,
    /// Present once the run has stopped
    pub outputs: Option<Outputs>,
    pub error: Option<Arc<WatchError>>,
}

impl RunState {
    fn errored(error: WatchError) -> Self {
        Self {
            error: Some(Arc::new(error)),
            ..Default::default()
        }
    }

    pub fn stopped(&self) -> bool {
        self.status.is_stopped()
    }

    pub fn failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    pub fn err(&self) -> Option<&WatchError> {
        self.error.as_deref()
    }

    /// Whether no state follows this one
    pub fn is_terminal(&self) -> bool {
        self.stopped() || self.error.is_some()
    }
}

/// Pull-based stream of [`RunState`]s for one run
pub struct RunWatcher {
    run_id: String,
    states: Receiver<RunState>,
    finished: bool,
}

impl RunWatcher {
    /// Start polling `run_id` every `interval`
    pub fn start(
        client: Arc<dyn ApiClient>,
        run_id: impl Into<String>,
        cancel: CancelToken,
        interval: Duration,
    ) -> Self {
        let run_id = run_id.into();
        let (tx, rx) = mpsc::sync_channel(0);
        let poller = Poller {
            client,
            run_id: run_id.clone(),
            cancel,
            interval,
            tx,
        };
        thread::spawn(move || poller.run());
        Self {
            run_id,
            states: rx,
            finished: false,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Block until the next state. After the terminal state every call
    /// returns a [`WatchError::Closed`] state.
    pub fn next_state(&mut self) -> RunState {
        if self.finished {
            return RunState::errored(WatchError::Closed);
        }
        let state = self
            .states
            .recv()
            .unwrap_or_else(|_| RunState::errored(WatchError::Closed));
        self.finished = state.is_terminal();
        state
    }
}

impl Iterator for RunWatcher {
    type Item = RunState;

    /// Yields states up to and including the terminal one
    fn next(&mut self) -> Option<RunState> {
        if self.finished {
            return None;
        }
        Some(self.next_state())
    }
}

struct Fetched {
    status: RunStatus,
    outputs: Option<Outputs>,
    logs: Vec<LogItem>,
    prev_page_token: String,
}

struct Poller {
    client: Arc<dyn ApiClient>,
    run_id: String,
    cancel: CancelToken,
    interval: Duration,
    tx: SyncSender<RunState>,
}

impl Poller {
    fn run(self) {
        let mut page_token = String::new();
        let mut delivered: HashSet<String> = HashSet::new();
        loop {
            if self.cancel.sleep(self.interval).is_err() {
                let _ = self.tx.send(RunState::errored(WatchError::Cancelled));
                return;
            }

            let fetched = match self.fetch(&page_token) {
                Ok(fetched) => fetched,
                Err(err) => {
                    tracing::debug!(run_id = %self.run_id, error = %err, "run polling failed");
                    let _ = self.tx.send(RunState::errored(err));
                    return;
                }
            };

            let requested_with = page_token.clone();
            if !fetched.logs.is_empty() {
                page_token = fetched.prev_page_token;
            }
            let logs: Vec<LogItem> = fetched
                .logs
                .into_iter()
                .filter(|item| delivered.insert(item.insert_id.clone()))
                .collect();

            let state = RunState {
                status: fetched.status,
                logs,
                prev_page_token: requested_with,
                outputs: fetched.outputs,
                error: None,
            };
            let stopped = state.stopped();
            if self.tx.send(state).is_err() || stopped {
                return;
            }
        }
    }

    /// Status (plus outputs once stopped) and logs, fetched concurrently
    fn fetch(&self, page_token: &str) -> Result<Fetched, WatchError> {
        let fetch_err = |operation| {
            move |source| WatchError::Fetch {
                operation,
                run_id: self.run_id.clone(),
                source,
            }
        };

        let (status, logs) = thread::scope(|s| {
            let status = s.spawn(|| {
                let status = self
                    .client
                    .get_run(&self.run_id)
                    .map_err(fetch_err("getting run"))?
                    .run
                    .status;
                let outputs = if status.is_stopped() {
                    let resp = self
                        .client
                        .get_outputs(&self.run_id)
                        .map_err(fetch_err("getting outputs"))?;
                    Some(resp.outputs)
                } else {
                    None
                };
                Ok::<_, WatchError>((status, outputs))
            });
            let logs = s.spawn(|| {
                let mut page = self
                    .client
                    .get_logs(&self.run_id, page_token)
                    .map_err(fetch_err("getting logs"))?;
                sort_logs(&mut page.logs);
                Ok::<_, WatchError>(page)
            });
            (join(status), join(logs))
        });

        let (status, outputs) = status?;
        let page = logs?;
        Ok(Fetched {
            status,
            outputs,
            logs: page.logs,
            prev_page_token: page.prev_page_token,
        })
    }
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>) -> T {
    handle
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

/// Outcome of [`execute_task`]
#[derive(Debug, Clone)]
pub struct Execution {
    pub run_id: String,
    pub status: RunStatus,
    pub outputs: Option<Outputs>,
}

/// Run the task `slug` with `params` and follow it to completion, passing
/// each new log line to `on_log`.
///
/// A run that ends failed or cancelled is an error; logs delivered before
/// that have already reached `on_log`.
pub fn execute_task(
    client: Arc<dyn ApiClient>,
    cancel: &CancelToken,
    slug: &str,
    params: Map<String, Value>,
    interval: Duration,
    on_log: &mut dyn FnMut(&LogItem),
) -> Result<Execution, WatchError> {
    let task = client.get_task(slug).map_err(|source| WatchError::Api {
        operation: "getting task",
        source,
    })?;
    let run_id = client
        .run_task(&RunTaskRequest {
            task_id: task.id.clone(),
            param_values: params,
        })
        .map_err(|source| WatchError::Api {
            operation: "running task",
            source,
        })?
        .run_id;
    tracing::info!(task = %slug, %run_id, url = %client.run_url(&run_id), "started run");

    let mut watcher = RunWatcher::start(client, run_id.clone(), cancel.clone(), interval);
    loop {
        let state = watcher.next_state();
        for item in &state.logs {
            on_log(item);
        }
        if let Some(err) = state.error {
            return Err(Arc::try_unwrap(err).unwrap_or(WatchError::Closed));
        }
        if state.stopped() {
            tracing::info!(%run_id, status = %state.status, "run stopped");
            if matches!(state.status, RunStatus::Failed | RunStatus::Cancelled) {
                return Err(WatchError::RunFailed {
                    run_id,
                    status: state.status,
                });
            }
            return Ok(Execution {
                run_id,
                status: state.status,
                outputs: state.outputs,
            });
        }
    }
}
