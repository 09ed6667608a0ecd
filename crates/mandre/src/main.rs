//! Mandre: durable task scheduler host
//!
//! Main binary with subcommands:
//! - `run`: Drive the scheduler until interrupted, logging every fired task
//! - `once`, `every`, `cron`: Register a task
//! - `cancel`, `suspend`, `resume`, `purge`: Change an existing task
//! - `list`: Show every stored task
//! - `gc`: Delete expired cancelled and exhausted records

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mandre_scheduler::SchedulerConfig;

mod commands;

#[derive(Parser)]
#[command(name = "mandre")]
#[command(about = "Durable task scheduler", long_about = None)]
struct Cli {
    /// Directory holding task records
    #[arg(long, global = true, env = "MANDRE_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Seconds a single delivery may run before it counts as failed
    #[arg(long, global = true, env = "MANDRE_DELIVERY_TIMEOUT_SECS")]
    delivery_timeout: Option<u64>,

    /// Seconds to keep cancelled and exhausted records (default: forever)
    #[arg(long, global = true, env = "MANDRE_RETENTION_SECS")]
    retention: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every registering subcommand.
#[derive(Args, Debug, Clone)]
struct TaskArgs {
    /// Human-readable label
    name: String,

    /// JSON payload handed to the sink on every fire
    #[arg(long)]
    payload: Option<String>,

    /// Failed deliveries allowed per occurrence
    #[arg(long)]
    max_attempts: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C.
    ///
    /// Warning: every subcommand except `list` reconciles the store when it
    /// starts. Used against a live `run`, that charges the running process's
    /// in-flight deliveries a failed attempt. Stop `run` first, make the
    /// change, then start it again to pick the change up.
    Run,

    /// Register a task that fires once
    Once {
        #[command(flatten)]
        task: TaskArgs,

        /// Fire at this RFC 3339 instant
        #[arg(long, conflicts_with = "after", required_unless_present = "after")]
        at: Option<DateTime<Utc>>,

        /// Fire this many seconds from now
        #[arg(long)]
        after: Option<u64>,
    },

    /// Register a task that fires every N seconds
    Every {
        #[command(flatten)]
        task: TaskArgs,

        /// Interval in seconds
        #[arg(value_name = "SECONDS")]
        seconds: u64,
    },

    /// Register a task driven by a cron expression
    Cron {
        #[command(flatten)]
        task: TaskArgs,

        /// Five- or six-field cron expression, evaluated in UTC
        #[arg(value_name = "EXPRESSION")]
        expression: String,
    },

    /// Cancel a task
    Cancel { id: String },

    /// Stop a task from firing until resumed
    Suspend { id: String },

    /// Resume a suspended task
    Resume { id: String },

    /// Delete a task record
    Purge { id: String },

    /// List stored tasks
    List {
        /// Print full records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete cancelled and exhausted records older than the retention
    Gc,
}

impl Cli {
    fn scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        if let Some(secs) = self.delivery_timeout {
            config = config.with_delivery_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.retention {
            config = config.with_retention(Duration::from_secs(secs));
        }
        config
    }

    fn store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mandre")
                .join("tasks")
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "mandre=info,mandre_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let store_dir = cli.store_dir();
    let config = cli.scheduler_config();

    match cli.command {
        Commands::Run => commands::run(&store_dir, config).await,

        Commands::Once { task, at, after } => {
            let at = match (at, after) {
                (Some(at), _) => at,
                (None, Some(secs)) => commands::from_now(secs)?,
                (None, None) => return Err(miette::miette!("either --at or --after is required")),
            };
            let spec = commands::build_spec(
                mandre_scheduler::TaskSpec::once(task.name.clone(), at),
                &task,
            )?;
            commands::register(&store_dir, config, spec).await
        }

        Commands::Every { task, seconds } => {
            let spec = commands::build_spec(
                mandre_scheduler::TaskSpec::interval(task.name.clone(), seconds),
                &task,
            )?;
            commands::register(&store_dir, config, spec).await
        }

        Commands::Cron { task, expression } => {
            let spec = commands::build_spec(
                mandre_scheduler::TaskSpec::calendar(task.name.clone(), expression),
                &task,
            )?;
            commands::register(&store_dir, config, spec).await
        }

        Commands::Cancel { id } => {
            commands::change(&store_dir, config, commands::Change::Cancel, id.into()).await
        }
        Commands::Suspend { id } => {
            commands::change(&store_dir, config, commands::Change::Suspend, id.into()).await
        }
        Commands::Resume { id } => {
            commands::change(&store_dir, config, commands::Change::Resume, id.into()).await
        }
        Commands::Purge { id } => {
            commands::change(&store_dir, config, commands::Change::Purge, id.into()).await
        }

        Commands::List { json } => commands::list(&store_dir, json).await,

        Commands::Gc => commands::gc(&store_dir, config).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_help_warns_about_live_store() {
        let cmd = Cli::command();
        let run = cmd.find_subcommand("run").unwrap();
        let help = run.get_long_about().unwrap().to_string();
        assert!(help.contains("in-flight deliveries a failed attempt"));
        assert!(help.contains("Stop `run` first"));
    }

    #[test]
    fn test_global_options_build_config() {
        let cli = Cli::try_parse_from([
            "mandre",
            "--store-dir",
            "/tmp/tasks",
            "--delivery-timeout",
            "5",
            "--retention",
            "3600",
            "gc",
        ])
        .unwrap();

        let config = cli.scheduler_config();
        assert_eq!(config.delivery_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.retention, Some(Duration::from_secs(3600)));
        assert_eq!(cli.store_dir(), PathBuf::from("/tmp/tasks"));
    }

    #[test]
    fn test_once_requires_a_time() {
        assert!(Cli::try_parse_from(["mandre", "once", "ping"]).is_err());
        assert!(
            Cli::try_parse_from(["mandre", "once", "ping", "--after", "5", "--at", "2025-01-01T00:00:00Z"])
                .is_err()
        );

        let cli = Cli::try_parse_from(["mandre", "once", "ping", "--at", "2025-01-01T00:00:00Z"])
            .unwrap();
        match cli.command {
            Commands::Once { task, at, after } => {
                assert_eq!(task.name, "ping");
                assert_eq!(at.map(|at| at.timestamp()), Some(1_735_689_600));
                assert!(after.is_none());
            }
            _ => panic!("expected once"),
        }
    }

    #[test]
    fn test_every_parses_task_options() {
        let cli = Cli::try_parse_from([
            "mandre",
            "every",
            "heartbeat",
            "30",
            "--payload",
            r#"{"chat":42}"#,
            "--max-attempts",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Every { task, seconds } => {
                assert_eq!(seconds, 30);
                assert_eq!(task.max_attempts, Some(5));
                assert_eq!(task.payload.as_deref(), Some(r#"{"chat":42}"#));
            }
            _ => panic!("expected every"),
        }
    }
}
