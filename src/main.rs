use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use treesync::config::expand_tilde;
use treesync::{Client, Config, MetadataStore, Server};

#[derive(Parser, Debug)]
#[command(name = "treesync")]
#[command(about = "Keep a file tree in sync across machines", version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a tree to peers
    Serve {
        /// TOML configuration file
        #[arg(short, long, env = "TREESYNC_CONFIG")]
        config: Option<PathBuf>,

        /// Address to listen on (overrides the config file)
        #[arg(short, long)]
        listen: Option<String>,

        /// Root of the synchronized tree (overrides the config file)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the version record of a tracked path
    Status {
        /// Path relative to the tree root
        path: String,

        #[arg(short, long, default_value = ".")]
        data_dir: PathBuf,
    },
    /// Check that a server is reachable and speaks our protocol
    Ping {
        /// Server address, e.g. 127.0.0.1:7420
        addr: String,
    },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
        } => serve(config, listen, data_dir).await,
        Command::Status { path, data_dir } => status(&path, &data_dir),
        Command::Ping { addr } => ping(&addr).await,
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    listen: Option<String>,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }
    if let Some(dir) = data_dir {
        config.data_dir = expand_tilde(&dir);
    }

    let server = Server::bind(config).await.context("starting server")?;
    info!("listening on {}", server.local_addr()?);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn status(path: &str, data_dir: &std::path::Path) -> Result<()> {
    let store = MetadataStore::new(expand_tilde(data_dir)).with_lock_timeout(Some(Duration::ZERO));
    match store.inspect(path)? {
        Some(record) => println!("{}: {}", path, record),
        None => println!("{}: untracked", path),
    }
    Ok(())
}

async fn ping(addr: &str) -> Result<()> {
    let mut client = Client::connect(addr)
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    let version = client.hello().await?;
    let started = std::time::Instant::now();
    client.ping(1).await?;
    println!(
        "{}: protocol v{}, round trip {:?}",
        addr,
        version,
        started.elapsed()
    );
    client.quit().await?;
    Ok(())
}
