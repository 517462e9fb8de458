use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dispatch_common::CliConfigOverrides;
use dispatch_daemon::AppState;
use dispatch_daemon::AuthValidator;
use dispatch_daemon::Config;
use dispatch_daemon::StaticTokenValidator;
use dispatch_daemon::build_orchestrator;
use dispatch_daemon::logging;
use tracing::info;

/// `dispatchd`: the Session Core daemon process (`spec.md` §2 C8).
#[derive(Parser, Debug)]
#[command(name = "dispatchd", version)]
struct Cli {
    /// Configuration directory (defaults to `$DISPATCH_HOME`, or `~/.dispatch`).
    #[arg(long = "config-dir", value_name = "DIR")]
    config_dir: Option<PathBuf>,

    #[command(flatten)]
    overrides: CliConfigOverrides,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(dispatch_daemon::config::default_config_dir);
    std::fs::create_dir_all(&config_dir)?;

    let config = Config::load(&config_dir, &cli.overrides)?;
    let _log_guard = logging::init(&config_dir.join("log"))?;

    let start_time = chrono::Utc::now();
    info!(listen_address = %config.listen_address, listen_port = config.listen_port, "starting dispatchd");

    std::fs::create_dir_all(&config.workspaces_root)?;

    let orchestrator = build_orchestrator(&config)?;
    let recovered = orchestrator.recover_crashed_runs().await?;
    if recovered > 0 {
        info!(recovered, "recovered orphaned runs from a prior process as crashed");
    }

    let auth: Arc<dyn AuthValidator> = Arc::new(StaticTokenValidator::new(config.auth_tokens.clone()));
    let state = AppState {
        orchestrator,
        auth,
        config: Arc::new(config.clone()),
    };
    let app = dispatch_daemon::app(state);

    let addr = format!("{}:{}", config.listen_address, config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, elapsed = %dispatch_common::format_elapsed(start_time), "dispatchd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("dispatchd shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler; ctrl-c remains the only shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
