use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mender::config::Config;
use mender::engine::{AgentDeps, EventSink, Session, SessionRequest};
use mender::git_ops::SnapshotManager;
use mender::llm::OpenRouterClient;
use mender::logging;
use mender::research::WebSearchClient;
use mender::server::{self, AppState};
use mender::workspace::Workspace;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "mender",
    about = "Plan, build and repair changes in a project, with checkpoints you can roll back",
    version
)]
struct Args {
    /// Project root (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP / SSE API
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(short, long, default_value = "3001")]
        port: u16,
    },
    /// Run one session and print its events as JSON lines
    Run {
        message: String,
        /// File open in the editor, used to disambiguate "create" requests
        #[arg(long)]
        open_file: Option<String>,
        #[arg(long)]
        skip_verification: bool,
    },
    /// Show what changed since a checkpoint
    Diff { checkpoint: String },
    /// Restore touched files to a checkpoint
    Rollback {
        checkpoint: String,
        #[arg(required = true)]
        files: Vec<String>,
    },
}

fn build_deps(root: &std::path::Path) -> Result<AgentDeps> {
    let config = Config::load();
    let llm = OpenRouterClient::from_config(&config).with_context(|| {
        format!(
            "No LLM credentials. Set OPENROUTER_API_KEY or add openrouter_api_key to {}",
            Config::config_location()
        )
    })?;
    let search = WebSearchClient::from_config(&config);
    let workspace = Workspace::new(root)?;
    let mut deps = AgentDeps::new(Arc::new(llm), workspace, config);
    if let Some(search) = search {
        deps = deps.with_search(Arc::new(search));
    }
    Ok(deps)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();
    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("Project root not found: {}", args.root.display()))?;

    match args.command {
        Command::Serve { bind, port } => {
            let deps = build_deps(&root)?;
            let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
            info!(root = %root.display(), "starting server");
            server::serve(addr, AppState::from_deps(deps)).await?;
        }
        Command::Run {
            message,
            open_file,
            skip_verification,
        } => {
            let deps = build_deps(&root)?;
            let session = Session::new(deps);
            let request = SessionRequest {
                open_file,
                skip_verification,
                ..SessionRequest::new(message)
            };

            let (sink, mut rx) = EventSink::channel();
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    println!("{}", event.to_json());
                }
            });
            let result = session.run(request, sink).await;
            printer.await?;
            eprintln!("{}", result.message);
        }
        Command::Diff { checkpoint } => {
            let diff = SnapshotManager::new(&root).diff(&checkpoint)?;
            if diff.files.is_empty() {
                println!("No changes since {}", checkpoint);
            } else {
                for file in &diff.files {
                    println!("{}", file);
                }
                println!();
                print!("{}", diff.stat);
            }
        }
        Command::Rollback { checkpoint, files } => {
            let report = SnapshotManager::new(&root).rollback(&checkpoint, &files)?;
            for path in &report.restored {
                println!("restored  {}", path);
            }
            for path in &report.deleted {
                println!("deleted   {}", path);
            }
            for path in &report.unchanged {
                println!("unchanged {}", path);
            }
        }
    }

    Ok(())
}
