//! Structured logging setup (`SPEC_FULL.md` §3.1 ambient additions):
//! `EnvFilter` plus a rotating file appender, matching the teacher's own
//! `tracing_subscriber::fmt` + `EnvFilter` idiom (`codex-exec::run_main`)
//! generalized from "stderr only" to "stderr plus a daily-rotating log
//! file", since a daemon has no terminal to write ANSI to most of the time.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Must be kept alive for the lifetime of the process; dropping it stops the
/// background flush thread (`tracing-appender`'s own contract).
pub fn init(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "dispatchd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = "info";
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking);
    let stderr_layer = fmt::layer().with_ansi(true).with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}
