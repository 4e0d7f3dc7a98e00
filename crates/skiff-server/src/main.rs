use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use skiff_transfer::{DispatchMode, Responder, ResponderConfig, TracingLogger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff_server=debug,skiff_transfer=info".into()),
        )
        .init();

    // Config
    let host = std::env::var("SKIFF_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().with_context(|| format!("invalid port argument {arg:?}"))?,
        None => env_or("SKIFF_PORT", "9876")?,
    };
    anyhow::ensure!(port != 0, "port must be between 1 and 65535");
    let root: PathBuf = std::env::var("SKIFF_ROOT").unwrap_or_else(|_| ".".into()).into();
    let ack_timeout_ms: u64 = env_or("SKIFF_ACK_TIMEOUT_MS", "1500")?;
    let max_retries: u32 = env_or("SKIFF_MAX_RETRIES", "20")?;
    let concurrent: bool = env_or("SKIFF_CONCURRENT", "false")?;
    let max_sessions: usize = env_or("SKIFF_MAX_SESSIONS", "16")?;

    anyhow::ensure!(root.is_dir(), "SKIFF_ROOT {} is not a directory", root.display());

    let bind_addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let mode = if concurrent {
        DispatchMode::Concurrent { max_sessions }
    } else {
        DispatchMode::Sequential
    };

    let responder = Responder::bind(ResponderConfig {
        bind_addr,
        root: root.clone(),
        ack_timeout: Duration::from_millis(ack_timeout_ms),
        max_retries: (max_retries > 0).then_some(max_retries),
        mode,
        logger: Arc::new(TracingLogger),
    })?;

    info!("Skiff server listening on {}", responder.local_addr());
    info!("Serving files from {} ({:?})", root.display(), mode);

    let shutdown = responder.shutdown_handle();
    let mut serve_task = tokio::task::spawn_blocking(move || responder.serve());

    tokio::select! {
        result = &mut serve_task => {
            result??;
            return Ok(());
        }
        _ = shutdown_signal() => shutdown.shutdown(),
    }

    serve_task.await??;
    info!("Skiff server stopped");
    Ok(())
}

/// Read and parse an environment variable, falling back to `default`.
fn env_or<T>(key: &str, default: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = std::env::var(key).unwrap_or_else(|_| default.into());
    raw.trim()
        .parse()
        .with_context(|| format!("invalid {key} value {raw:?}"))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
