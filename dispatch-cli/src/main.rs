use clap::Parser;
use clap::Subcommand;
use dispatch_cli::DaemonClient;
use dispatch_protocol::RunKind;
use owo_colors::OwoColorize;

/// `dispatch`: operator CLI for a running `dispatchd` process.
#[derive(Debug, Parser)]
#[command(name = "dispatch", version)]
struct Cli {
    /// Daemon base URL.
    #[arg(long, env = "DISPATCH_URL", default_value = "http://127.0.0.1:7777")]
    url: String,

    /// Bearer token for the daemon's auth validator.
    #[arg(long, env = "DISPATCH_TOKEN", default_value = "")]
    token: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new run.
    Create {
        /// pty | claude | file-editor
        kind: String,
        /// Absolute path of the owning workspace.
        workspace_path: String,
    },
    /// Resume a previously stopped or crashed resumable run.
    Resume { session_id: String },
    /// List all known runs.
    Ls,
    /// Close a live run.
    Close { run_id: String },
    /// Print a run's event history.
    History {
        run_id: String,
        #[arg(long, default_value_t = 1)]
        from_seq: i64,
        #[arg(long, default_value_t = 1000)]
        limit: i64,
    },
    /// Workspace management.
    #[command(subcommand)]
    Workspace(WorkspaceCommand),
    /// Check daemon liveness.
    Healthz,
}

#[derive(Debug, Subcommand)]
enum WorkspaceCommand {
    /// Register a new workspace.
    Create {
        path: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// List known workspaces.
    Ls,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();
    let client = DaemonClient::new(cli.url, cli.token);

    match cli.command {
        Command::Create { kind, workspace_path } => {
            let Ok(kind) = kind.parse::<RunKind>() else {
                anyhow::bail!("unknown run kind {kind:?} (expected pty, claude, or file-editor)");
            };
            let session = client.create_session(kind, &workspace_path, serde_json::json!({})).await?;
            println!("{} {}", "created".green(), session.run_id);
        }
        Command::Resume { session_id } => {
            let session = client.resume_session(&session_id).await?;
            println!("{} {}", "resumed".green(), session.run_id);
        }
        Command::Ls => {
            for session in client.list_sessions().await? {
                println!(
                    "{:<28} {:<10} {:<9} {}",
                    session.run_id,
                    session.kind.as_str(),
                    session.status.as_str(),
                    session.workspace_path
                );
            }
        }
        Command::Close { run_id } => {
            client.close_session(&run_id).await?;
            println!("{} {}", "closed".yellow(), run_id);
        }
        Command::History { run_id, from_seq, limit } => {
            let history = client.session_history(&run_id, from_seq, limit).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Command::Workspace(WorkspaceCommand::Create { path, name }) => {
            let ws = client.create_workspace(&path, name).await?;
            println!("{} {}", "created".green(), ws.path);
        }
        Command::Workspace(WorkspaceCommand::Ls) => {
            for ws in client.list_workspaces().await? {
                println!("{:<40} {}", ws.path, ws.name);
            }
        }
        Command::Healthz => {
            let body = client.healthz().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}
