//! certstash CLI: inspect and manipulate certificate storage in an S3 bucket.
//!
//! Reads the same storage block a cert manager host would (directive
//! grammar), falls back to the `S3_*` environment variables, and runs one
//! operation against the bucket:
//! - `certstash probe`: provision and check the bucket is reachable
//! - `certstash get KEY` / `put KEY FILE|-` / `rm KEY` / `stat KEY`
//! - `certstash ls [PREFIX] [-r]`
//! - `certstash lock KEY [--hold SECS]`: take a lock, hold it, release it
//!
//! Ctrl-C cancels the running operation.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use certstash_core::config::S3Settings;
use certstash_core::context::{CancelHandle, Context};
use certstash_core::{CertStashError, CertStorage, Locker, Result, S3Options};
use certstash_runtime::S3Storage;

/// Command-line interface for certstash.
#[derive(Parser)]
#[command(name = "certstash")]
#[command(author, version, about = "Certificate storage in S3-compatible buckets", long_about = None)]
struct Cli {
    /// Storage block in directive grammar. Without it only the S3_*
    /// environment variables are used.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Abort the operation after this many seconds.
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the storage and check the bucket is reachable.
    Probe,

    /// Write the value at KEY to stdout.
    Get { key: String },

    /// Store a file (or stdin with `-`) at KEY.
    Put { key: String, file: String },

    /// Delete KEY. A key ending in `/` deletes everything below it.
    Rm { key: String },

    /// List keys below PREFIX.
    Ls {
        #[arg(default_value = "")]
        prefix: String,

        /// Include all descendants instead of immediate children.
        #[arg(short, long)]
        recursive: bool,
    },

    /// Print metadata for KEY as JSON.
    Stat { key: String },

    /// Acquire the lock named KEY, hold it, then release it.
    Lock {
        key: String,

        /// Seconds to hold the lock; waits for Ctrl-C when omitted.
        #[arg(long)]
        hold: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("certstash: {e}");
            if e.is_not_found() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.config.as_deref(), |name| std::env::var(name).ok())?;

    let (ctx, cancel) = Context::background().with_cancel();
    let ctx = match cli.timeout {
        Some(secs) => ctx.with_timeout(Duration::from_secs(secs)),
        None => ctx,
    };
    let interrupt = tokio::spawn(cancel_on_interrupt(cancel));

    let result = match connect(&ctx, settings).await {
        Ok(storage) => execute(&storage, &ctx, cli.command).await,
        Err(e) => Err(e),
    };
    interrupt.abort();
    result
}

/// Provision the storage under `ctx`, so the timeout and Ctrl-C also cover
/// the initial bucket check.
async fn connect(ctx: &Context, settings: S3Settings) -> Result<S3Storage> {
    let bucket = settings.bucket.clone();
    ctx.run("provision", &bucket, S3Storage::provision(settings)).await
}

/// Read the storage block at `path` (if any) and resolve it against `env`.
fn load_settings<F>(path: Option<&Path>, env: F) -> Result<S3Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let options = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                CertStashError::config(format!("cannot read {}: {e}", path.display()))
            })?;
            S3Options::parse(&text)?
        }
        None => S3Options::default(),
    };
    options.resolve_with(env)
}

async fn cancel_on_interrupt(cancel: CancelHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupted, cancelling");
        cancel.cancel();
    }
}

async fn execute(storage: &S3Storage, ctx: &Context, command: Commands) -> Result<()> {
    match command {
        Commands::Probe => {
            println!("{storage}: ok");
        }
        Commands::Get { key } => {
            let value = storage.load(ctx, &key).await?;
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(&value)
                .await
                .map_err(|e| CertStashError::Internal {
                    message: format!("cannot write to stdout: {e}"),
                })?;
            stdout.flush().await.map_err(|e| CertStashError::Internal {
                message: format!("cannot write to stdout: {e}"),
            })?;
        }
        Commands::Put { key, file } => {
            let value = read_input(&file).await?;
            let size = value.len();
            storage.store(ctx, &key, value).await?;
            info!(key = %storage.filename(&key), size, "Stored");
        }
        Commands::Rm { key } => {
            storage.delete(ctx, &key).await?;
            info!(key = %storage.filename(&key), "Deleted");
        }
        Commands::Ls { prefix, recursive } => {
            for key in storage.list(ctx, &prefix, recursive).await? {
                println!("{key}");
            }
        }
        Commands::Stat { key } => {
            let info = storage.stat(ctx, &key).await?;
            let json = serde_json::to_string_pretty(&info)
                .map_err(|e| CertStashError::Serialization(e.to_string()))?;
            println!("{json}");
        }
        Commands::Lock { key, hold } => {
            storage.lock(ctx, &key).await?;
            info!(key = %key, owner = %storage.owner(), "Holding lock");
            let held = match hold {
                Some(secs) => ctx.sleep("lock", &key, Duration::from_secs(secs)).await,
                None => {
                    ctx.done().await;
                    Ok(())
                }
            };
            // `ctx` may already be cancelled here.
            let release = Context::background().with_timeout(Duration::from_secs(30));
            storage.unlock(&release, &key).await?;
            if let Err(e) = held {
                if !e.is_cancelled() {
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

/// Read a value from a file, or from stdin for `-`.
async fn read_input(file: &str) -> Result<Bytes> {
    if file == "-" {
        let mut buf = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut buf)
            .await
            .map_err(|e| CertStashError::Internal {
                message: format!("cannot read stdin: {e}"),
            })?;
        return Ok(Bytes::from(buf));
    }
    tokio::fs::read(file)
        .await
        .map(Bytes::from)
        .map_err(|e| CertStashError::Internal {
            message: format!("cannot read {file}: {e}"),
        })
}
