//! taskpilot CLI
//!
//! Entry point for the `taskpilot` command-line tool.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{ArgGroup, Parser, Subcommand};
use serde_json::{json, Map, Value};
use taskpilot::archive::{ApiArchiver, HttpUploader};
use taskpilot::build::{
    BuildCreator, ConsoleBuildLog, DockerCli, LocalBuildCreator, RemoteBuildCreator,
};
use taskpilot::config::{ConfigPaths, Settings};
use taskpilot::discover::{DefinitionDiscoverer, Discoverer, ScriptDiscoverer};
use taskpilot::prompt::{AssumeConfirmer, Confirmer, TerminalConfirmer};
use taskpilot::watch::execute_task;
use taskpilot::{logging, signal, CancelToken, Deployer};
use taskpilot_api::{ApiClient, HttpClient};

#[derive(Parser)]
#[command(name = "taskpilot")]
#[command(about = "Deploy tasks from a source tree and watch their runs", version)]
struct Cli {
    /// Verbose diagnostics
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, build and deploy tasks
    #[command(group(ArgGroup::new("answer").args(["yes", "no"])))]
    Deploy {
        /// Files or directories to search for tasks (default: .)
        paths: Vec<PathBuf>,

        /// Build with the local docker daemon
        #[arg(long)]
        local: bool,

        /// Do not push locally built images
        #[arg(long)]
        no_push: bool,

        /// Only deploy tasks containing one of these files
        #[arg(long = "changed-files", value_name = "FILE")]
        changed_files: Vec<PathBuf>,

        /// Upgrade tasks from handlebars to JS templates
        #[arg(long)]
        jst: bool,

        /// Answer yes to every confirmation
        #[arg(long, short = 'y')]
        yes: bool,

        /// Answer no to every confirmation
        #[arg(long)]
        no: bool,
    },

    /// Run a task and follow it to completion
    Execute {
        /// Slug of the task to run
        slug: String,

        /// Parameter as KEY=VALUE; VALUE is parsed as JSON when it can be
        #[arg(long = "param", short = 'p', value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.debug) {
        eprintln!("Error initializing logging: {}", e);
        process::exit(1);
    }
    let cancel = CancelToken::new();
    if let Err(e) = signal::install(cancel.clone()) {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }

    match cli.command {
        Commands::Deploy {
            paths,
            local,
            no_push,
            changed_files,
            jst,
            yes,
            no,
        } => {
            let mut overrides = Map::new();
            if local {
                overrides.insert("build".into(), json!({ "local": true }));
            }
            if no_push {
                let build = overrides.entry("build").or_insert_with(|| json!({}));
                build["push"] = json!(false);
            }
            let settings = load_settings(Value::Object(overrides));
            let confirmer: Arc<dyn Confirmer> = match (yes, no) {
                (true, _) => Arc::new(AssumeConfirmer(true)),
                (_, true) => Arc::new(AssumeConfirmer(false)),
                _ => Arc::new(TerminalConfirmer),
            };
            run_deploy(&settings, &cancel, confirmer, paths, changed_files, jst);
        }
        Commands::Execute { slug, params } => {
            let settings = load_settings(Value::Object(Map::new()));
            run_execute(&settings, &cancel, &slug, params.into_iter().collect());
        }
    }
}

fn load_settings(overrides: Value) -> Settings {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let env = |name: &str| std::env::var(name).ok();
    match Settings::load(&ConfigPaths::discover(&cwd), &env, Some(overrides)) {
        Ok(settings) => {
            tracing::debug!(
                sources = %settings.describe_sources(),
                api_host = %settings.api_host,
                "loaded configuration"
            );
            settings
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(e.exit_code());
        }
    }
}

fn api_client(settings: &Settings) -> Arc<dyn ApiClient> {
    Arc::new(HttpClient::new(settings.http_client_config()))
}

fn run_deploy(
    settings: &Settings,
    cancel: &CancelToken,
    confirmer: Arc<dyn Confirmer>,
    paths: Vec<PathBuf>,
    changed_files: Vec<PathBuf>,
    upgrade_jst: bool,
) {
    let client = api_client(settings);
    let paths = if paths.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        paths
    };

    let discoverer = Discoverer::new(client.clone())
        .with(DefinitionDiscoverer::new(client.clone(), confirmer.clone()))
        .with(ScriptDiscoverer);
    let configs = match discoverer.discover(&paths) {
        Ok(configs) => configs,
        Err(e) => {
            eprintln!("Error discovering tasks: {}", e);
            process::exit(e.exit_code());
        }
    };

    let log = Arc::new(ConsoleBuildLog::default());
    let builder: Arc<dyn BuildCreator> = if settings.build.local {
        Arc::new(
            LocalBuildCreator::new(client.clone(), Arc::new(DockerCli::default()), log)
                .with_push(settings.build.push)
                .with_ignore_file(settings.archive.ignore_file.clone()),
        )
    } else {
        let archiver = ApiArchiver::new(client.clone(), Arc::new(HttpUploader::default()))
            .with_ignore_file(settings.archive.ignore_file.clone());
        Arc::new(
            RemoteBuildCreator::new(client.clone(), Arc::new(archiver), confirmer, log)
                .with_poll_interval(settings.build_poll_interval()),
        )
    };

    let report = Deployer::new(client.clone(), builder)
        .with_changed_files(changed_files)
        .with_upgrade_interpolation(upgrade_jst)
        .deploy(cancel, configs);

    print!("{}", report.render(client.as_ref()));
    tracing::info!("{}", report.summary());
    if let Err(e) = report.result() {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

fn run_execute(settings: &Settings, cancel: &CancelToken, slug: &str, params: Map<String, Value>) {
    let client = api_client(settings);
    let result = execute_task(
        client,
        cancel,
        slug,
        params,
        settings.watch_poll_interval(),
        &mut |item| println!("{}", item.text),
    );
    match result {
        Ok(execution) => {
            if let Some(outputs) = execution.outputs.filter(|o| !o.is_empty()) {
                match serde_json::to_string_pretty(&outputs) {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        eprintln!("Error serializing outputs: {}", e);
                        process::exit(1);
                    }
                }
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    }
}

/// `KEY=VALUE`, with VALUE taken as JSON when it parses and as a string otherwise
fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
