use crate::client::{ClientConfig, StreamingClient, DEFAULT_ENDPOINT};
use crate::model::{AggregateRequest, SessionEvent, SessionStatus, Tally, DEFAULT_TOP_N};
use crate::orchestrator::{AppCommand, AppEvent, Controller};
use crate::supervisor::{default_resources_dir, Deployment, Supervisor, SupervisorConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "keyword-aggregator",
    version,
    about = "Run a keyword aggregation on a local worker and stream its progress"
)]
pub struct Cli {
    /// Text file to aggregate (read by the worker, not by this tool)
    #[arg(long)]
    pub file: String,

    /// Keyword to aggregate around
    #[arg(long)]
    pub keyword: String,

    /// Number of ranked keywords to request
    #[arg(long, default_value_t = DEFAULT_TOP_N)]
    pub top_n: u32,

    /// Base URL of the worker
    #[arg(long, env = "KWAGG_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Resolve the worker from the packaged resource directory
    #[arg(long, env = "KWAGG_PACKAGED")]
    pub packaged: bool,

    /// Development tree root holding backend/main.py (defaults to the current directory)
    #[arg(long)]
    pub project_root: Option<PathBuf>,

    /// Packaged resource directory (defaults to <exe dir>/resources)
    #[arg(long)]
    pub resources_dir: Option<PathBuf>,

    /// Interpreter for the development worker (defaults to the project venv, then `python`)
    #[arg(long)]
    pub python: Option<PathBuf>,

    /// Explicit worker command line; must be the last option
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub worker_cmd: Vec<String>,

    /// Use an already running worker instead of spawning one
    #[arg(long)]
    pub no_spawn: bool,

    /// Longest silence accepted from the worker while streaming
    #[arg(long, default_value = "30s")]
    pub idle_timeout: humantime::Duration,

    /// TCP connect timeout for the request
    #[arg(long, default_value = "5s")]
    pub connect_timeout: humantime::Duration,

    /// How long to wait for a spawned worker to accept connections
    #[arg(long, default_value = "20s")]
    pub ready_timeout: humantime::Duration,

    /// Grace period before a stopping worker is force-killed
    #[arg(long, default_value = "3s")]
    pub stop_grace: humantime::Duration,

    /// Print the final summary as JSON and nothing else on stdout
    #[arg(long, conflicts_with = "text")]
    pub json: bool,

    /// Stream progress and print a text summary (default)
    #[arg(long)]
    pub text: bool,

    /// Export the final session summary as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Log filter, e.g. `info` or `keyword_aggregator=debug,worker=warn`
    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,
}

pub fn build_request(args: &Cli) -> AggregateRequest {
    AggregateRequest::new(args.file.clone(), args.keyword.clone()).with_top_n(args.top_n)
}

/// Build a `ClientConfig` from CLI arguments.
pub fn build_client_config(args: &Cli) -> ClientConfig {
    ClientConfig {
        endpoint: args.endpoint.clone(),
        idle_timeout: Duration::from(args.idle_timeout),
        connect_timeout: Duration::from(args.connect_timeout),
        ..ClientConfig::default()
    }
}

/// Build a `SupervisorConfig` from CLI arguments.
///
/// An explicit `--worker-cmd` wins over `--packaged`, which wins over the
/// development layout.
pub fn build_supervisor_config(args: &Cli) -> Result<SupervisorConfig> {
    let deployment = if let Some((program, rest)) = args.worker_cmd.split_first() {
        Deployment::Command {
            program: PathBuf::from(program),
            args: rest.to_vec(),
        }
    } else if args.packaged {
        let resources_dir = match args.resources_dir.clone() {
            Some(dir) => dir,
            None => default_resources_dir()
                .context("cannot locate the resource directory next to the executable")?,
        };
        Deployment::Packaged { resources_dir }
    } else {
        let project_root = match args.project_root.clone() {
            Some(dir) => dir,
            None => std::env::current_dir().context("cannot read the current directory")?,
        };
        Deployment::Development {
            project_root,
            python: args.python.clone(),
        }
    };
    Ok(SupervisorConfig {
        deployment,
        stop_grace: Duration::from(args.stop_grace),
    })
}

pub async fn run(args: Cli) -> Result<()> {
    crate::logging::init(args.log_level.as_deref(), std::io::stderr().is_terminal());

    let request = build_request(&args);
    request.validate().context("invalid request")?;

    let client_cfg = build_client_config(&args);
    let worker_addr = client_cfg.socket_addr()?;
    let client = StreamingClient::new(client_cfg)?;
    let supervisor = if args.no_spawn {
        None
    } else {
        Some(Arc::new(Supervisor::new(build_supervisor_config(&args)?)))
    };

    let controller = Controller {
        supervisor,
        client,
        worker_addr,
        ready_timeout: Duration::from(args.ready_timeout),
    };
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<AppEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<AppCommand>();
    let handle = tokio::spawn(controller.run(evt_tx, cmd_rx));
    let _ = cmd_tx.send(AppCommand::Aggregate(request.clone()));

    let (out_tx, out_handle) = spawn_output_writer();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut outcome: Option<(SessionStatus, Option<String>, Tally)> = None;

    loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    AppEvent::WorkerStarted { pid } => {
                        let _ = out_tx.send(OutputLine::Stderr(format!("Worker started (pid {pid})")));
                    }
                    AppEvent::WorkerStopped => {
                        let _ = out_tx.send(OutputLine::Stderr("Worker stopped".into()));
                    }
                    AppEvent::SessionStarted(req) => {
                        let _ = out_tx.send(OutputLine::Stderr(format!(
                            "Aggregating {:?} in {}",
                            req.keyword, req.file_path
                        )));
                    }
                    AppEvent::Info(msg) => {
                        let _ = out_tx.send(OutputLine::Stderr(msg));
                    }
                    AppEvent::Session(SessionEvent::Progress(tally)) => {
                        if !args.json {
                            let _ = out_tx.send(OutputLine::Stderr(
                                crate::text_summary::progress_line(&tally),
                            ));
                        }
                    }
                    AppEvent::Session(SessionEvent::Completed(tally)) => {
                        outcome = Some((SessionStatus::Completed, None, tally));
                        let _ = cmd_tx.send(AppCommand::Quit);
                    }
                    AppEvent::Session(SessionEvent::Failed { reason, last }) => {
                        outcome = Some((SessionStatus::Failed, Some(reason.reason()), last));
                        let _ = cmd_tx.send(AppCommand::Quit);
                    }
                }
            }
            res = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                if let Err(e) = res {
                    tracing::warn!("cannot listen for Ctrl-C: {e}");
                    continue;
                }
                let _ = out_tx.send(OutputLine::Stderr("Interrupted, shutting down".into()));
                let _ = cmd_tx.send(AppCommand::Quit);
            }
        }
    }

    handle
        .await
        .context("controller task failed")?
        .context("controller failed")?;

    let (status, reason, tally) = outcome.context("session ended without a result")?;
    let summary = crate::orchestrator::summarize_parts(&request, status, reason, &tally);

    if let Some(p) = args.export_json.as_deref() {
        crate::orchestrator::export_json(p, &summary)?;
        let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", p.display())));
    }
    if args.json {
        let out = serde_json::to_string_pretty(&summary)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in crate::text_summary::build_text_summary(&summary).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;

    match summary.status {
        SessionStatus::Failed => Err(anyhow::anyhow!(
            "aggregation failed: {}",
            summary.reason.as_deref().unwrap_or("unknown reason")
        )),
        _ => Ok(()),
    }
}
