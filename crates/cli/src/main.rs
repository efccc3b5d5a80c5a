use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use runboard_engine::{AppSession, DependencyGraph, NoopBackend, SessionConfig, load_app_document};
use runboard_types::validate_document;
use serde_json::Value;
use tracing::debug;

#[derive(Parser)]
#[command(name = "runboard", version, about = "Inspect and simulate the refresh graph of an app document")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the runnables depending on each component, then the refresh order.
    Graph {
        /// App document (YAML or JSON).
        file: PathBuf,
    },
    /// Report document issues, resolution warnings and dangling references.
    Check { file: PathBuf },
    /// Run a session with the no-op backend and print its events as JSON lines.
    Simulate {
        file: PathBuf,
        /// Component whose dependents are notified. Repeatable.
        #[arg(long = "change")]
        changes: Vec<String>,
        /// Output to write, as `<component>.<key>=<json>`. Repeatable.
        #[arg(long = "set")]
        outputs: Vec<String>,
        #[arg(long)]
        debounce_ms: Option<u64>,
        /// How long to let the session settle before printing.
        #[arg(long, default_value_t = 1000)]
        settle_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Graph { file } => print_graph(&file),
        Commands::Check { file } => check(&file),
        Commands::Simulate {
            file,
            changes,
            outputs,
            debounce_ms,
            settle_ms,
        } => simulate(&file, &changes, &outputs, debounce_ms, Duration::from_millis(settle_ms)).await,
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_graph(file: &Path) -> Result<DependencyGraph> {
    let document = load_app_document(file)?;
    DependencyGraph::build(document.runnables(), document.component_ids()).with_context(|| format!("Invalid app document: {}", file.display()))
}

fn print_graph(file: &Path) -> Result<ExitCode> {
    let graph = build_graph(file)?;

    for component_id in graph.component_ids() {
        let dependents: Vec<String> = graph.on_component_changed(component_id).into_iter().collect();
        if dependents.is_empty() {
            println!("{component_id}");
        } else {
            println!("{component_id} -> {}", dependents.join(", "));
        }
    }

    match graph.refresh_order() {
        Ok(order) => println!("\nrefresh order: {}", order.join(", ")),
        Err(error) => println!("\nrefresh order unavailable: {error}"),
    }
    Ok(ExitCode::SUCCESS)
}

fn check(file: &Path) -> Result<ExitCode> {
    let document = load_app_document(file)?;
    let graph = DependencyGraph::build(document.runnables(), document.component_ids())?;

    let issues = validate_document(&document);
    for issue in &issues {
        println!("issue: {issue}");
    }
    for warning in graph.warnings() {
        println!("warning: {warning}");
    }
    let dangling = graph.dangling_references();
    for reference in &dangling {
        println!("dangling: {reference}");
    }
    if let Err(error) = graph.refresh_order() {
        println!("warning: {error}");
    }

    if dangling.is_empty() {
        println!("ok: {} runnables, {} issues", graph.runnables().count(), issues.len());
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn simulate(file: &Path, changes: &[String], outputs: &[String], debounce_ms: Option<u64>, settle: Duration) -> Result<ExitCode> {
    let document = load_app_document(file)?;
    let mut config = SessionConfig::load();
    if let Some(debounce_ms) = debounce_ms {
        config.debounce_ms = debounce_ms;
    }
    let writes = outputs.iter().map(|output| parse_output(output)).collect::<Result<Vec<_>>>()?;

    let session = AppSession::from_document(&document, Arc::new(NoopBackend::new()), config)?;
    let mut events = session.subscribe();
    let handle = session.start();

    for (component, key, value) in writes {
        debug!(component = %component, key = %key, "writing output");
        handle.set_component_output(component, key, value).await?;
    }
    for component in changes {
        handle.component_changed(component.as_str()).await?;
    }
    tokio::time::sleep(settle).await;
    handle.shutdown().await?;

    while let Some(event) = events.try_recv() {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(ExitCode::SUCCESS)
}

/// Parses `<component>.<key>=<json>`; a value that is not valid JSON is taken as a string.
fn parse_output(raw: &str) -> Result<(String, String, Value)> {
    let Some((target, value)) = raw.split_once('=') else {
        bail!("expected <component>.<key>=<value>, got '{raw}'");
    };
    let Some((component, key)) = target.split_once('.') else {
        bail!("expected <component>.<key> before '=', got '{target}'");
    };
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((component.to_string(), key.to_string(), value))
}
