use anyhow::{bail, Context, Result};
use cadence_core::{AmbientContext, EngineConfig, FlowMonitor, FlowRegistry, FlowValue};
use cadence_monitoring::{LogExt, MonitoringConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cadence", version, about = "Run and inspect Cadence flows")]
struct Cli {
    /// Flow document (YAML or JSON); defaults to the configured flows path
    #[arg(long, short, global = true)]
    flows: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Invoke a flow and print its result and coverage
    Run {
        /// Flow to invoke
        flow: String,
        /// Flow input as JSON
        #[arg(long, default_value = "null")]
        input: String,
        /// Ambient context as a JSON object
        #[arg(long)]
        ambient: Option<String>,
    },
    /// Load and validate the flow document, then list its flows
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    cadence_monitoring::init_logging(&MonitoringConfig::from_env())
        .context("Failed to initialize logging")?;

    let config = EngineConfig::load().context("Failed to load configuration")?;
    let flows = match cli.flows.clone().or_else(|| config.flows_path.clone()) {
        Some(path) => path,
        None => bail!("no flow document given; pass --flows or set CADENCE_FLOWS"),
    };

    let registry = FlowRegistry::builder(cadence_stdlib::components())
        .with_config(config)
        .build()
        .context("Failed to build flow registry")?;
    let loaded = registry
        .load_file(&flows)
        .log_err("Flow document rejected")
        .with_context(|| format!("Failed to load flows from {}", flows.display()))?;
    info!(path = %flows.display(), flows = loaded.len(), "Flows loaded");

    match cli.command {
        Command::Run {
            flow,
            input,
            ambient,
        } => run(&registry, &flow, &input, ambient.as_deref()).await,
        Command::Check => check(&registry),
    }
}

async fn run(registry: &Arc<FlowRegistry>, flow: &str, input: &str, ambient: Option<&str>) -> Result<()> {
    let executor = registry.executor(flow)?;
    let input: serde_json::Value = serde_json::from_str(input).context("--input is not valid JSON")?;
    let ambient: AmbientContext = match ambient {
        Some(text) => serde_json::from_str(text).context("--ambient is not a JSON object")?,
        None => AmbientContext::new(),
    };

    let monitor = FlowMonitor::new(flow);
    let interrupt = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping flow");
                monitor.stop();
            }
        })
    };

    let outcome = executor
        .invoke_monitored(FlowValue::data(input), ambient, monitor)
        .await
        .log_err("Flow invocation failed");
    interrupt.abort();
    let outcome = outcome.with_context(|| format!("Flow '{}' failed", flow))?;

    let result = match outcome.result.as_data() {
        Some(data) => serde_json::to_string_pretty(data)?,
        None => outcome.result.summary(),
    };
    println!("status: {:?}", outcome.status);
    println!("result: {}", result);
    print!("{}", outcome.coverage.report());
    Ok(())
}

fn check(registry: &Arc<FlowRegistry>) -> Result<()> {
    for name in registry.flow_names() {
        let executor = registry.executor(&name)?;
        let coverage = executor.coverage();
        println!(
            "{}: {} step(s), {} coverage element(s)",
            name,
            executor.definition().steps.len(),
            coverage.total_count()
        );
    }
    Ok(())
}
