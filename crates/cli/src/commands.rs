//! Subcommand handlers. Each one builds exactly the collaborators it needs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use extension_api::HttpDomainServiceClient;
use llm::AnthropicProvider;
use nodes::{EngineServices, GraphExecutionEngine, RunRequest};
use pipeline::ports::{load_pipeline_graph, DomainServiceClient, LlmProvider};
use pipeline::report::RunReport;
use pipeline::state::RunStatus;
use pipeline::{CostBudget, NodeId, PipelineRunId, WorkItemId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CliConfig;
use crate::loader::FileGraphLoader;
use crate::store::FileStateStore;
use crate::tracker::LocalTracker;

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Work item the run belongs to.
    #[arg(long)]
    pub work_item: u64,
    /// JSON file with the run input. Defaults to `{}`.
    #[arg(long)]
    pub input: Option<PathBuf>,
    /// Resume this run instead of starting a new one.
    #[arg(long)]
    pub run_id: Option<PipelineRunId>,
    /// Discard the stored snapshot of `--run-id` and start over.
    #[arg(long, requires = "run_id")]
    pub restart: bool,
    /// Treat the run as safety-classified from the start.
    #[arg(long)]
    pub safety_classified: bool,
    /// Override the run budget in USD.
    #[arg(long)]
    pub budget: Option<f64>,
}

#[derive(Debug, clap::Args)]
pub struct DecisionArgs {
    #[arg(long)]
    pub work_item: u64,
    /// Gated node the decision applies to.
    #[arg(long)]
    pub node: String,
    /// Record a rejection instead of an approval.
    #[arg(long)]
    pub reject: bool,
}

pub async fn run(args: RunArgs, config: CliConfig) -> anyhow::Result<ExitCode> {
    let mut engine_config = config.engine.clone();
    if let Some(budget) = args.budget {
        engine_config.budget =
            CostBudget::new(budget).with_context(|| format!("invalid budget {budget}"))?;
    }

    let graph = load_pipeline_graph(&FileGraphLoader, &config.paths.graph.to_string_lossy()).await?;
    let llm: Arc<dyn LlmProvider> = Arc::new(AnthropicProvider::new(config.llm.clone())?);
    let judge = match config.judge.clone() {
        Some(judge) => Some(Arc::new(AnthropicProvider::new(judge)?) as Arc<dyn LlmProvider>),
        None => None,
    };
    let domain = if config.services.is_empty() {
        None
    } else {
        Some(Arc::new(HttpDomainServiceClient::new(config.services.clone())?) as Arc<dyn DomainServiceClient>)
    };
    let services = EngineServices {
        llm,
        judge,
        domain,
        tracker: Arc::new(LocalTracker::new(&config.paths.tracker_dir)),
        store: Arc::new(FileStateStore::new(&config.paths.state_dir)),
    };
    let engine = GraphExecutionEngine::new(graph, engine_config, services);

    let request = RunRequest {
        run_id: args.run_id.unwrap_or_else(PipelineRunId::new_random),
        work_item: WorkItemId::new(args.work_item),
        input: read_input(args.input.as_deref()).await?,
        safety_classified: args.safety_classified,
        restart: args.restart,
    };
    info!(run_id = %request.run_id, work_item = args.work_item, "Starting invocation");

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight nodes");
            on_interrupt.cancel();
        }
    });

    let result = engine.run(request, cancel).await;
    interrupt.abort();
    let report = result?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    info!("{}", report.summary());
    Ok(exit_code(&report))
}

pub async fn validate(config: CliConfig) -> anyhow::Result<ExitCode> {
    let source = config.paths.graph.to_string_lossy();
    let graph = load_pipeline_graph(&FileGraphLoader, &source).await?;
    println!(
        "{}: {} nodes, {} edges, fingerprint {}",
        graph.name(),
        graph.node_count(),
        graph.edges().count(),
        graph.fingerprint()
    );
    Ok(ExitCode::SUCCESS)
}

pub async fn decide(args: DecisionArgs, config: CliConfig) -> anyhow::Result<ExitCode> {
    let Some(node) = NodeId::new(args.node) else {
        bail!("node name must not be empty");
    };
    let tracker = LocalTracker::new(&config.paths.tracker_dir);
    tracker
        .record_decision(WorkItemId::new(args.work_item), &node, !args.reject)
        .await?;
    let decision = if args.reject { "rejected" } else { "approved" };
    println!("{node} {decision} for work item {}", args.work_item);
    Ok(ExitCode::SUCCESS)
}

async fn read_input(path: Option<&Path>) -> anyhow::Result<Value> {
    let Some(path) = path else {
        return Ok(Value::Object(Default::default()));
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read input {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("input {} is not valid JSON", path.display()))
}

/// 0 for success or a run waiting on approval, 2 for an escalation, 1 otherwise.
pub fn exit_code(report: &RunReport) -> ExitCode {
    match report.status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Running if report.is_awaiting_approval() => ExitCode::SUCCESS,
        RunStatus::Escalated => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}
