use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::info;

use skiff_transfer::{RequestConfig, request, resolve_endpoint};

const USAGE: &str = "usage: skiff-get <file> [host] [port]";

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff_get=info,skiff_transfer=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(file_name) = args.next() else {
        bail!(USAGE);
    };
    let host = match args.next() {
        Some(host) => host,
        None => std::env::var("SKIFF_SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
    };
    let port: u16 = match args.next() {
        Some(arg) => arg.parse().with_context(|| format!("invalid port argument {arg:?}"))?,
        None => env_or("SKIFF_SERVER_PORT", "9876")?,
    };
    let timeout_ms: u64 = env_or("SKIFF_TIMEOUT_MS", "1500")?;
    let max_retries: u32 = env_or("SKIFF_MAX_RETRIES", "20")?;
    let output_dir: PathBuf = std::env::var("SKIFF_OUTPUT_DIR")
        .unwrap_or_else(|_| ".".into())
        .into();

    let server_addr = resolve_endpoint(&host, port)?;
    let output_path = output_dir.join(local_name(&file_name)?);

    let mut config = RequestConfig::new(file_name.as_str(), server_addr, output_path.clone());
    config.timeout = Duration::from_millis(timeout_ms);
    config.linger = config.timeout * 2;
    config.max_retries = (max_retries > 0).then_some(max_retries);

    info!("Requesting {} from {}", file_name, server_addr);
    let summary = request(&config)?;

    info!(
        "Saved {} ({} bytes, {} packets, {} duplicates) in {:.2}s",
        output_path.display(),
        summary.file_size,
        summary.chunks,
        summary.duplicates,
        summary.elapsed.as_secs_f64()
    );
    println!("{}  {}", summary.sha256, output_path.display());
    Ok(())
}

/// Last path component of the requested name; the file is saved under it.
fn local_name(requested: &str) -> anyhow::Result<&Path> {
    Path::new(requested.trim())
        .file_name()
        .map(Path::new)
        .with_context(|| format!("{requested:?} does not name a file"))
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
