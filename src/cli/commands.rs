//! CLI command definitions for tubeworker.
//!
//! `run` starts a worker pool with the import-job demo handler subscribed to
//! one or more tubes; `stats` prints the server's statistics.

use std::collections::BTreeMap;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{Broker, TcpBroker};
use crate::error::ConfigError;
use crate::logging::{Logger, TracingLogger};
use crate::pool::config::normalize_num_workers;
use crate::pool::{WorkerPool, WorkerPoolConfig};
use crate::policy::ErrorAction;

use super::import_job::{handle_import_job, DEFAULT_IMPORT_TUBE};

/// Default beanstalkd address.
const DEFAULT_ADDR: &str = "127.0.0.1:11300";

/// Concurrent beanstalkd consumer.
#[derive(Parser)]
#[command(name = "tubeworker")]
#[command(about = "Reserve, decode and dispatch beanstalkd jobs across a pool of connections")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Consume import jobs until interrupted (SIGINT, SIGTERM or SIGHUP).
    Run(RunArgs),

    /// Print server statistics as JSON.
    Stats(StatsArgs),
}

/// Arguments for `tubeworker run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Address of the beanstalkd server.
    #[arg(short, long, env = "TUBEWORKER_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Number of concurrent workers; zero or less runs one
    /// (overrides TUBEWORKER_NUM_WORKERS).
    #[arg(short = 'n', long, allow_negative_numbers = true)]
    pub num_workers: Option<i64>,

    /// What to do with jobs that fail to decode: delete, release or bury.
    /// Anything else means release (overrides TUBEWORKER_UNMARSHAL_ERROR_ACTION).
    #[arg(long)]
    pub unmarshal_error_action: Option<String>,

    /// Tube to consume; repeat for several.
    #[arg(short, long = "tube", default_value = DEFAULT_IMPORT_TUBE)]
    pub tubes: Vec<String>,
}

/// Arguments for `tubeworker stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Address of the beanstalkd server.
    #[arg(short, long, env = "TUBEWORKER_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_worker_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
    }
}

/// Loads the environment configuration and applies command-line overrides.
fn build_config(args: &RunArgs) -> anyhow::Result<WorkerPoolConfig> {
    let config =
        WorkerPoolConfig::from_env().context("Invalid TUBEWORKER_* environment configuration")?;
    Ok(apply_overrides(config, args, &TracingLogger)?)
}

/// Applies command-line overrides on top of `config`.
fn apply_overrides(
    mut config: WorkerPoolConfig,
    args: &RunArgs,
    logger: &dyn Logger,
) -> Result<WorkerPoolConfig, ConfigError> {
    if let Some(num_workers) = args.num_workers {
        config.num_workers = normalize_num_workers(num_workers);
    }
    if let Some(name) = &args.unmarshal_error_action {
        config.unmarshal_error_action = ErrorAction::from_name_lossy(name, logger);
    }

    config.validate()?;
    Ok(config)
}

async fn run_worker_command(args: RunArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?;

    let mut pool = WorkerPool::with_config(TcpBroker::new(args.addr.clone()), config);
    for tube in &args.tubes {
        pool.subscribe(tube.clone(), handle_import_job)?;
    }

    info!(
        addr = %args.addr,
        num_workers = pool.num_workers(),
        unmarshal_error_action = %pool.config().unmarshal_error_action,
        "Starting tubeworker"
    );

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = pool.run(cancel).await;
    signals.abort();

    match serde_json::to_string(&pool.stats()) {
        Ok(stats) => info!(%stats, "Finished tubeworker"),
        Err(e) => warn!(error = %e, "Finished tubeworker, could not serialize stats"),
    }
    result.map_err(Into::into)
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let broker = TcpBroker::new(args.addr);
    let conn = broker.dial().await?;
    let stats: BTreeMap<String, String> = conn.stats().await?.into_iter().collect();

    let json_output = serde_json::to_string_pretty(&stats)
        .map_err(|e| anyhow::anyhow!("Failed to serialize stats JSON: {}", e))?;
    println!("{}", json_output);

    Ok(())
}

/// Cancels `cancel` on every SIGINT, SIGTERM or SIGHUP.
#[cfg(unix)]
async fn cancel_on_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = [
        SignalKind::interrupt(),
        SignalKind::terminate(),
        SignalKind::hangup(),
    ]
    .into_iter()
    .map(signal)
    .collect::<Result<Vec<_>, _>>();

    let mut streams = match streams {
        Ok(streams) => streams,
        Err(e) => {
            warn!(error = %e, "Could not install signal handlers");
            return;
        }
    };

    loop {
        let pending = streams.iter_mut().map(|s| Box::pin(s.recv()));
        let (received, _, _) = futures::future::select_all(pending).await;
        if received.is_none() {
            return;
        }
        info!("Got signal, cancelling workers");
        cancel.cancel();
    }
}

#[cfg(not(unix))]
async fn cancel_on_signal(cancel: CancellationToken) {
    while tokio::signal::ctrl_c().await.is_ok() {
        info!("Got signal, cancelling workers");
        cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::RecordingLogger;

    #[test]
    fn test_run_args_defaults() {
        let cli = Cli::try_parse_from(["tubeworker", "run"]).unwrap();
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.tubes, vec![DEFAULT_IMPORT_TUBE]);
                assert_eq!(args.num_workers, None);
                assert_eq!(args.unmarshal_error_action, None);
            }
            Commands::Stats(_) => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_args_overrides() {
        let cli = Cli::try_parse_from([
            "tubeworker",
            "run",
            "--addr",
            "10.0.0.5:11300",
            "-n",
            "4",
            "--unmarshal-error-action",
            "bury",
            "--tube",
            "imports",
            "--tube",
            "exports",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.addr, "10.0.0.5:11300");
        assert_eq!(args.num_workers, Some(4));
        assert_eq!(args.unmarshal_error_action.as_deref(), Some("bury"));
        assert_eq!(args.tubes, vec!["imports", "exports"]);

        let logger = RecordingLogger::new();
        let config = apply_overrides(WorkerPoolConfig::default(), &args, &logger).unwrap();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.unmarshal_error_action, ErrorAction::Bury);
        assert!(logger.lines().is_empty());
    }

    #[test]
    fn test_unknown_error_action_falls_back_to_release() {
        let cli = Cli::try_parse_from([
            "tubeworker",
            "run",
            "--unmarshal-error-action",
            "kick",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        let logger = RecordingLogger::new();
        let base = WorkerPoolConfig::default().with_unmarshal_error_action(ErrorAction::Bury);
        let config = apply_overrides(base, &args, &logger).unwrap();

        assert_eq!(config.unmarshal_error_action, ErrorAction::Release);
        let errors = logger.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("kick"));
    }

    #[test]
    fn test_non_positive_num_workers_means_one() {
        for value in ["0", "-1"] {
            let cli = Cli::try_parse_from(["tubeworker", "run", "-n", value]).unwrap();
            let Commands::Run(args) = cli.command else {
                panic!("expected run");
            };

            let base = WorkerPoolConfig::new(8);
            let config = apply_overrides(base, &args, &RecordingLogger::new()).unwrap();
            assert_eq!(config.num_workers, 1, "{value}");
        }
    }

    #[test]
    fn test_overrides_still_validate() {
        let cli = Cli::try_parse_from(["tubeworker", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        let base = WorkerPoolConfig::default().with_reserve_timeout(std::time::Duration::ZERO);
        let result = apply_overrides(base, &args, &RecordingLogger::new());
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }
}
