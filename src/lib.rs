//! taskpilot - deploy tasks from a local source tree and watch their runs
//!
//! The deploy pipeline runs [`discover::Discoverer`] over a set of paths,
//! then hands the resulting task configs to [`deploy::Deployer`], which builds
//! each task with a [`build::BuildCreator`] (the local docker daemon or the
//! remote builder fed by [`archive::ApiArchiver`]) and updates the remote
//! record. [`watch::RunWatcher`] follows a started run.

pub mod archive;
pub mod build;
pub mod cancel;
pub mod config;
pub mod deploy;
pub mod discover;
pub mod logging;
pub mod prompt;
pub mod signal;
pub mod watch;

pub use cancel::CancelToken;
pub use deploy::{DeployError, DeployReport, Deployer, TaskError};
pub use discover::{Discoverer, TaskConfig, TaskConfigSource};
pub use watch::{RunState, RunWatcher, WatchError};
