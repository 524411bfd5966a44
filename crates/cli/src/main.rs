//! CogWorks CLI entry point.
//!
//! This binary is the composition root for the entire system:
//!
//! 1. **Parse configuration**: `.cogworks/config.toml`, overridden by flags.
//! 2. **Wire observability**: `tracing-subscriber` with a JSON or human
//!    layer, plus an OpenTelemetry OTLP exporter when an endpoint is set.
//! 3. **Construct infrastructure**: `AnthropicProvider`,
//!    `HttpDomainServiceClient`, the file-backed state store and tracker, and
//!    inject them into the `GraphExecutionEngine`.
//! 4. **Run one invocation**: the engine advances the run as far as it can and
//!    returns; the next invocation with the same `--run-id` resumes it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;
mod config;
mod loader;
mod observability;
mod store;
mod tracker;

use config::{CliConfig, API_KEY_ENV, DEFAULT_CONFIG_PATH};
use observability::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "cogworks", version, about = "Runs CogWorks pipeline graphs")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Graph description; overrides `paths.graph`.
    #[arg(long, global = true)]
    graph: Option<PathBuf>,
    /// Snapshot directory; overrides `paths.state_dir`.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,
    #[arg(long, global = true, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start or resume a pipeline run
    Run(commands::RunArgs),
    /// Validate the graph description without running anything
    Validate,
    /// Record a human gate decision
    Decide(commands::DecisionArgs),
}

impl Cli {
    fn resolve_config(&self) -> anyhow::Result<CliConfig> {
        let mut config = CliConfig::load(&self.config)?;
        config.apply_api_key(std::env::var(API_KEY_ENV).ok());
        if let Some(graph) = &self.graph {
            config.paths.graph = graph.clone();
        }
        if let Some(state_dir) = &self.state_dir {
            config.paths.state_dir = state_dir.clone();
        }
        if let Some(format) = self.log_format {
            config.telemetry.log_format = format;
        }
        if let Some(endpoint) = &self.otlp_endpoint {
            config.telemetry.otlp_endpoint = Some(endpoint.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    let telemetry = observability::init(
        config.telemetry.log_format,
        config.telemetry.otlp_endpoint.as_deref(),
    )?;

    let result = match cli.command {
        Command::Run(args) => commands::run(args, config).await,
        Command::Validate => commands::validate(config).await,
        Command::Decide(args) => commands::decide(args, config).await,
    };

    telemetry.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_expected_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_flags_expected_to_override_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[paths]\ngraph = \"from-file.toml\"\nstate_dir = \"runs\"\n").expect("write");
        let cli = Cli::parse_from([
            "cogworks",
            "--config",
            path.to_str().expect("utf-8 path"),
            "--graph",
            "from-flag.toml",
            "--log-format",
            "json",
            "run",
            "--work-item",
            "42",
        ]);

        let config = cli.resolve_config().expect("config");

        assert_eq!(config.paths.graph, PathBuf::from("from-flag.toml"));
        assert_eq!(config.paths.state_dir, PathBuf::from("runs"));
        assert_eq!(config.telemetry.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Command::Run(ref args) if args.work_item == 42 && !args.restart));
    }

    #[test]
    fn cli_restart_without_run_id_expected_rejected() {
        let result = Cli::try_parse_from(["cogworks", "run", "--work-item", "1", "--restart"]);
        assert!(result.is_err());
    }
}
