//! Preview Sandbox CLI
//!
//! Usage:
//!   preview-sandbox check <file>                 Report violations and blocked imports
//!   preview-sandbox build <file> [--data JSON]   Print the synthesized document
//!   preview-sandbox run <file> [--data JSON]     Render headlessly and report the outcome
//!   preview-sandbox serve                        Persistent process, reads from stdin
//!   preview-sandbox pin                          Print integrity hashes for the libraries
//!
//! Protocol (serve):
//!   Request (stdin, one JSON object per line):
//!     {"source":"function Component() {...}","data":{"title":"Hi"}}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:58
//!
//!     {"context":"...","state":"ready"}
//!
//!   Status is one of Ok, Error, Timeout or Dropped. A request superseded by a
//!   newer one before the throttle interval elapses is answered with Dropped.

use anyhow::{anyhow, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use preview_sandbox::{
    pin_libraries, prepare, validate, validate_imports, ErrorEvent, HostState, HostUpdate, PreviewConfig,
    PreviewError, PreviewRequest, Previewer, V8Backend,
};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "preview-sandbox")]
#[command(author, version, about = "Sandboxed live preview for untrusted UI components")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a component and report violations
    Check {
        /// Component source file
        file: PathBuf,
    },

    /// Synthesize the preview document
    Build {
        /// Component source file
        file: PathBuf,

        #[command(flatten)]
        data: DataArgs,

        /// Write the document here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Render the component in a headless isolate
    Run {
        /// Component source file
        file: PathBuf,

        #[command(flatten)]
        data: DataArgs,

        /// Override the execution budget
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Serve preview requests over stdin/stdout
    Serve,

    /// Fetch the configured libraries and print their integrity hashes
    Pin,
}

#[derive(Args)]
struct DataArgs {
    /// Mock data as inline JSON
    #[arg(long, conflicts_with = "data_file")]
    data: Option<String>,

    /// Mock data from a JSON file
    #[arg(long)]
    data_file: Option<PathBuf>,
}

impl DataArgs {
    fn load(&self) -> Result<Value> {
        let text = match (&self.data, &self.data_file) {
            (Some(json), _) => json.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read mock data '{}'", path.display()))?,
            (None, None) => return Ok(serde_json::json!({})),
        };
        serde_json::from_str(&text).map_err(|e| anyhow!("Invalid mock data JSON: {}", e))
    }
}

/// Outcome of one rendered preview, as reported by `run` and `serve`.
#[derive(Serialize)]
struct Outcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<String>,
    state: HostState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Status {
    Ok,
    Error,
    Timeout,
    Dropped,
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read component '{}'", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<PreviewConfig> {
    match path {
        Some(path) => Ok(PreviewConfig::load(path)?),
        None => Ok(PreviewConfig::default()),
    }
}

fn run_check(file: &Path) -> Result<()> {
    let source = read_source(file)?;
    let result = validate(&source);
    let imports = validate_imports(&source);

    for violation in &result.violations {
        println!(
            "{}:{}: {} - {} ({})",
            file.display(),
            violation.line,
            violation.pattern_id,
            violation.description,
            violation.excerpt
        );
    }
    for module in &imports.blocked_imports {
        println!("{}: blocked import '{}' will be removed", file.display(), module);
    }

    match result.into_admitted() {
        Ok(_) => {
            println!("{}: ok", file.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_build(config: &PreviewConfig, file: &Path, data: &DataArgs, output: Option<&Path>) -> Result<()> {
    let source = read_source(file)?;
    let document = prepare(&config.synthesizer()?, &source, data.load()?)?;

    match output {
        Some(path) => {
            std::fs::write(path, document.html())
                .with_context(|| format!("failed to write '{}'", path.display()))?;
            info!(path = %path.display(), csp = %document.content_security_policy(), "wrote preview document");
        }
        None => print!("{}", document.html()),
    }
    Ok(())
}

/// Render `request` and wait for it to settle.
async fn render(previewer: &mut Previewer<V8Backend>, request: PreviewRequest) -> (Status, Outcome) {
    let context = match previewer.preview(request) {
        Ok(context) => context,
        Err(e) => return rejected(&e),
    };
    settle(previewer, Some(context.to_string())).await
}

async fn settle(previewer: &mut Previewer<V8Backend>, context: Option<String>) -> (Status, Outcome) {
    let host = previewer.host_mut();
    let settled = host.settle().await;
    let outcome = |warning: Option<String>| Outcome {
        context: context.clone(),
        state: host.state(),
        error: host.last_error().cloned(),
        warning,
    };
    match settled {
        Ok(HostState::Ready) => (Status::Ok, outcome(None)),
        Ok(_) => (Status::Error, outcome(None)),
        // Advisory: the context is still running, only the budget ran out
        Err(e) if e.is_advisory() => (Status::Timeout, outcome(Some(e.to_string()))),
        Err(e) => (Status::Error, outcome(Some(e.to_string()))),
    }
}

fn rejected(error: &PreviewError) -> (Status, Outcome) {
    (
        Status::Error,
        Outcome {
            context: None,
            state: HostState::Idle,
            error: Some(ErrorEvent::new(error.to_string())),
            warning: None,
        },
    )
}

async fn run_single_shot(config: PreviewConfig, file: &Path, data: &DataArgs, timeout_ms: Option<u64>) -> Result<()> {
    let mut config = config;
    if let Some(ms) = timeout_ms {
        config.host.timeout_ms = ms;
    }
    let request = PreviewRequest::new(read_source(file)?, data.load()?);
    let mut previewer = Previewer::from_config(&config, V8Backend::new(config.isolate_config()))?;

    let (status, outcome) = render(&mut previewer, request).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    // Surface late runtime errors until the context exits
    if matches!(status, Status::Ok) {
        while let Some(update) = previewer.host_mut().next_update().await {
            if let HostUpdate::Event(event) = update {
                println!("{}", event.to_json());
            }
        }
    }

    match (status, previewer.host().error()) {
        (Status::Ok, None) => Ok(()),
        (_, Some(error)) => Err(error.into()),
        (_, None) => Err(anyhow!("preview did not become ready")),
    }
}

/// Run in server mode (persistent process, reads requests from stdin)
async fn run_server(config: PreviewConfig) -> Result<()> {
    let mut previewer = Previewer::from_config(&config, V8Backend::new(config.isolate_config()))?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    info!(throttle_ms = config.controls.throttle_ms, "server ready, reading from stdin");

    loop {
        let deadline = previewer.next_deadline();
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    // EOF - stdin closed, exit gracefully
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PreviewRequest>(&line) {
                    Ok(request) => {
                        if previewer.request(request, Instant::now()).is_some() {
                            write_response(&mut stdout, Status::Dropped, "superseded by a newer request")?;
                        }
                    }
                    Err(e) => write_response(&mut stdout, Status::Error, &format!("Invalid request: {}", e))?,
                }
            }
            _ = wait_until(deadline) => {
                if let Some(result) = previewer.poll(Instant::now()) {
                    respond(&mut previewer, &mut stdout, result.map(|c| c.to_string())).await?;
                }
            }
        }
    }

    // Answer the request still waiting on the throttle
    while let Some(deadline) = previewer.next_deadline() {
        wait_until(Some(deadline)).await;
        if let Some(result) = previewer.poll(Instant::now()) {
            respond(&mut previewer, &mut stdout, result.map(|c| c.to_string())).await?;
        }
    }

    info!("server shutting down");
    Ok(())
}

async fn respond(
    previewer: &mut Previewer<V8Backend>,
    stdout: &mut std::io::Stdout,
    loaded: std::result::Result<String, PreviewError>,
) -> Result<()> {
    let (status, outcome) = match loaded {
        Ok(context) => settle(previewer, Some(context)).await,
        Err(e) => {
            warn!(error = %e, before_execution = e.is_fatal_to_synthesis(), "preview request rejected");
            rejected(&e)
        }
    };
    write_response(stdout, status, &serde_json::to_string(&outcome)?)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, status: Status, body: &str) -> Result<()> {
    writeln!(stdout, "Status:{:?}", status)?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

async fn run_pin(config: &PreviewConfig) -> Result<()> {
    let pinned = pin_libraries(&config.synthesizer.libraries).await?;

    #[derive(Serialize)]
    struct Pinned<'a> {
        libraries: &'a [preview_sandbox::TrustedScript],
    }
    #[derive(Serialize)]
    struct Document<'a> {
        synthesizer: Pinned<'a>,
    }

    let document = Document {
        synthesizer: Pinned { libraries: &pinned },
    };
    print!("{}", toml::to_string(&document)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries documents and protocol responses
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check { file } => run_check(&file),
        Commands::Build { file, data, output } => run_build(&config, &file, &data, output.as_deref()),
        Commands::Run { file, data, timeout_ms } => run_single_shot(config, &file, &data, timeout_ms).await,
        Commands::Serve => run_server(config).await,
        Commands::Pin => run_pin(&config).await,
    }
}
