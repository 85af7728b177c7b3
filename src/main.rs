mod config;
mod discovery;
mod graph;
mod process_tree;
mod runner;
mod signals;
mod sink;
mod watchdog;

use clap::Parser;
use graph::DependencyGraphService;
use runner::ProcessRunner;
use sink::{NullSink, OutputSink, TracingSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Restore a .NET project and print its dependency graph, supervising the
/// build tool so a hung restore cannot block forever.
#[derive(Parser, Debug)]
#[command(name = "dotnet-outdated", version, about)]
pub struct Cli {
    /// Project or solution file, or a directory containing exactly one
    #[arg(value_name = "PATH", default_value = ".")]
    path: PathBuf,

    /// Config file path
    #[arg(short, long, default_value = "outdated.toml")]
    config: PathBuf,

    /// Runtime identifier to restore for (overrides config)
    #[arg(short, long)]
    runtime: Option<String>,

    /// Write the graph here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Inactivity timeout in seconds (overrides config)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,

    /// Resolve the project and print the build-tool invocation, don't run
    #[arg(long)]
    dry_run: bool,

    /// Echo build-tool output and runner decisions
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn default_filter(verbose: bool, quiet: bool) -> &'static str {
    if verbose {
        "dotnet_outdated=debug"
    } else if quiet {
        "dotnet_outdated=warn"
    } else {
        "dotnet_outdated=info"
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose, quiet)));

    // Logs go to stderr; stdout carries the graph.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: &Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let mut config = config::load_config(&cli.config)?;
    if let Some(secs) = cli.timeout {
        config.runner.inactivity_timeout_secs = secs;
    }
    let runtime = cli
        .runtime
        .clone()
        .unwrap_or_else(|| config.graph.runtime.clone());

    let project = discovery::resolve_project(&cli.path)?;

    if cli.dry_run {
        let args = graph::build_arguments(&project, Path::new("<temporary file>"), &runtime);
        println!("program: {}", config.runner.command);
        println!("working directory: {}", graph::working_dir_for(&project).display());
        println!(
            "inactivity timeout: {}s",
            config.runner.inactivity_timeout_secs
        );
        println!("arguments:");
        for arg in &args {
            println!("  {arg}");
        }
        return Ok(0);
    }

    let sink: Arc<dyn OutputSink> = if cli.quiet {
        Arc::new(NullSink)
    } else {
        Arc::new(TracingSink)
    };
    let runner = ProcessRunner::new(config.runner.command.clone())
        .with_options(config.runner.options())
        .with_sink(sink);
    tracing::debug!(program = runner.program(), "runner configured");
    let service = DependencyGraphService::new(runner);

    let artifact = tokio::select! {
        res = service.generate_dependency_graph(&project, &runtime) => res?,
        signal = signals::shutdown() => {
            let signal = signal?;
            tracing::warn!(%signal, "interrupted, stopping build tool");
            return Ok(signal.exit_code());
        }
    };

    if artifact.is_empty() {
        tracing::warn!(project = %project.display(), "build tool wrote an empty dependency graph");
    } else if !artifact.is_well_formed() {
        tracing::warn!(project = %project.display(), "dependency graph is not valid JSON");
    }

    match &cli.output {
        Some(path) => {
            tokio::fs::write(path, artifact.as_str()).await?;
            tracing::info!(
                path = %path.display(),
                bytes = artifact.len(),
                "dependency graph written"
            );
        }
        None => println!("{}", artifact.into_string()),
    }
    Ok(0)
}
