//! sftp-storage: run storage driver operations against a configured endpoint.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use eyre::Context as _;
use storage::{FileInfo, Settings, Storage, StorageFactory, WalkControl};
use tokio::io::AsyncWriteExt as _;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "sftp-storage", about = "Inspect and modify registry storage over SFTP")]
struct Cli {
    /// Settings file with [pool] and [storage] tables
    #[arg(short, long, default_value = "storage.toml", env = "SFTP_STORAGE_CONFIG")]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the contents of an object
    Get { path: String },

    /// Store a local file as an object
    Put { path: String, local: Utf8PathBuf },

    /// Stream an object starting at an offset
    Cat {
        path: String,

        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Show size, modification time and type
    Stat { path: String },

    /// List the children of a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Move an object
    Mv { source: String, dest: String },

    /// Recursively delete an object
    Rm { path: String },

    /// List every entry below a directory
    Walk {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Check that the endpoint is reachable
    Health,
}

fn print_info(info: &FileInfo) {
    let kind = if info.is_dir { "dir" } else { "file" };
    println!(
        "{kind:4} {:>12} {} {}",
        info.size,
        info.modified.to_rfc3339(),
        info.path
    );
}

async fn run(storage: &Storage, command: Command) -> eyre::Result<()> {
    let mut stdout = tokio::io::stdout();
    match command {
        Command::Get { path } => {
            let content = storage.get_content(&path).await?;
            stdout.write_all(&content).await?;
        }
        Command::Put { path, local } => {
            let mut file = tokio::fs::File::open(&local)
                .await
                .with_context(|| format!("opening {local}"))?;
            let size = storage.upload(&path, &mut file).await?;
            tracing::info!(%path, size, "uploaded");
        }
        Command::Cat { path, offset } => {
            let mut reader = storage.reader(&path, offset).await?;
            let copied = tokio::io::copy(&mut reader, &mut stdout).await;
            reader.close().await?;
            copied?;
        }
        Command::Stat { path } => print_info(&storage.stat(&path).await?),
        Command::Ls { path } => {
            let mut children = storage.list(&path).await?;
            children.sort();
            for child in children {
                println!("{child}");
            }
        }
        Command::Mv { source, dest } => storage.move_to(&source, &dest).await?,
        Command::Rm { path } => storage.delete(&path).await?,
        Command::Walk { path } => {
            storage
                .walk(&path, &mut |info: &FileInfo| {
                    print_info(info);
                    Ok(WalkControl::Continue)
                })
                .await?
        }
        Command::Health => {
            let status = storage.health_status().await;
            println!("{status}");
            if !status.is_healthy() {
                eyre::bail!("storage is {status}");
            }
        }
    }
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_error::ErrorLayer::default())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config))?;

    let factory = StorageFactory::ssh(settings.pool);
    let storage = factory.build(&settings.storage)?;

    let result = run(&storage, cli.command).await;
    factory.shutdown().await;
    result
}
