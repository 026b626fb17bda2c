//! Stream Orchestrator CLI.
//!
//! Binds one tab, starts one run against a backend endpoint and prints every page delivery as a
//! JSON line on stdout until the run reaches a terminal phase. Ctrl-C stops the run.
//!
//! # Environment Variables
//!
//! - `ORCHESTRATOR_*`: see `OrchestratorConfig`
//! - `LOG_LEVEL`, `LOG_FORMAT`: logging to stderr

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use serde_json::{json, Value};
use std::sync::Arc;
use stream_orchestrator::logging::{load_logging_config_from_env, tracing_init};
use stream_orchestrator::{
    channels, Envelope, Orchestrator, OrchestratorConfig, RunPhase, StartRun, StreamEvent,
};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(version, about = "Run one streaming backend call through the orchestrator")]
struct Args {
    /// Endpoint path joined onto the backend URL, or an absolute URL
    endpoint: String,

    /// Backend base URL
    #[arg(long, env = "ORCHESTRATOR_BACKEND_URL")]
    backend_url: Option<String>,

    /// Tab identifier to bind
    #[arg(long, default_value = "cli")]
    tab: String,

    /// Route the tab is showing
    #[arg(long, default_value = "/")]
    route: String,

    /// Logical consumer; also the page channel for deliveries
    #[arg(long)]
    sink: Option<String>,

    /// JSON request body
    #[arg(long, default_value = "{}")]
    body: String,

    /// JSON selection stored for the tab and sent as context
    #[arg(long)]
    selection: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let conf = load_logging_config_from_env().unwrap_or_default();
    tracing_init(conf)?;

    let args = Args::parse();
    let mut config = OrchestratorConfig::from_env();
    if let Some(url) = args.backend_url {
        config.backend_url = url;
    }
    let body: Value = serde_json::from_str(&args.body).context("--body is not valid JSON")?;
    let selection: Option<Value> = args
        .selection
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--selection is not valid JSON")?;

    let orchestrator = Orchestrator::with_http_backend(config)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Envelope)>();
    orchestrator.configure(Arc::new(move |channel: &str, envelope: &Envelope| {
        let _ = tx.send((channel.to_string(), envelope.clone()));
    }));

    orchestrator.deliver(Envelope::command(
        channels::TAB_BIND,
        json!({ "tab_id": args.tab, "route": args.route }),
    ));
    let include_selection = selection.is_some();
    if let Some(selection) = selection {
        orchestrator.deliver(Envelope::command(channels::SELECTION_UPDATE, selection));
    }

    let run_id = orchestrator.start_run(
        None,
        StartRun {
            endpoint: args.endpoint,
            sink: args.sink,
            body,
            include_selection,
        },
    )?;
    tracing::info!("started run {}", run_id);

    let mut final_phase = None;
    while final_phase.is_none() {
        tokio::select! {
            delivery = rx.recv() => {
                let Some((channel, envelope)) = delivery else {
                    break;
                };
                println!("{}", json!({ "channel": channel, "envelope": envelope }));
                if envelope.metadata_str("runId") != Some(run_id.as_str()) {
                    continue;
                }
                if let Ok(StreamEvent::Phase { phase, .. }) =
                    serde_json::from_value::<StreamEvent>(envelope.payload)
                {
                    if phase.is_terminal() {
                        final_phase = Some(phase);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, stopping run {}", run_id);
                orchestrator.stop_run(None)?;
            }
        }
    }

    match final_phase {
        Some(RunPhase::Errored) => anyhow::bail!("run {} ended with an error", run_id),
        Some(phase) => {
            tracing::info!("run {} ended: {}", run_id, phase);
            Ok(())
        }
        None => anyhow::bail!("page delivery channel closed before run {} ended", run_id),
    }
}
