use std::path::{Path, PathBuf};
#[cfg(feature = "watch")]
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use livesync::{AdbTunnel, Config, DirectTunnel, LiveSync};

/// Config file looked up in the working directory when `--config` is absent.
const LOCAL_CONFIG: &str = "livesync.toml";

#[derive(Parser)]
#[command(name = "livesync")]
#[command(version)]
#[command(about = "Push local file changes to a running app over an adb tunnel")]
#[command(long_about = r#"
livesync streams file creates and deletes to the livesync agent inside a
running application, then asks it to apply them.

Examples:
  livesync -a com.example.app push src/         Send a directory and sync
  livesync -a com.example.app delete src/old.js Remove a file and sync
  livesync -a com.example.app watch             Push changes as they happen
"#)]
struct Cli {
    /// Config file (default: ./livesync.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Application identifier, e.g. com.example.app
    #[arg(short = 'a', long = "app", env = "LIVESYNC_APP", global = true)]
    application_id: Option<String>,

    /// Directory device paths are relative to (default: current directory)
    #[arg(short, long, global = true)]
    base_dir: Option<PathBuf>,

    /// Local port forwarded to the agent
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Address the forwarded port is bound on
    #[arg(long, global = true)]
    host: Option<String>,

    /// Device serial when more than one is attached
    #[arg(short = 's', long, env = "ANDROID_SERIAL", global = true)]
    device: Option<String>,

    /// Suffix of the agent's abstract socket
    #[arg(long, global = true)]
    suffix: Option<String>,

    /// Path to the adb binary
    #[arg(long, global = true)]
    adb: Option<PathBuf>,

    /// Don't run adb forward; the port is already reachable
    #[arg(long, global = true)]
    no_forward: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files or directories, then sync
    Push {
        /// Files or directories under the base directory
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,

        /// Don't send a do-sync afterwards
        #[arg(long)]
        no_sync: bool,
    },

    /// Delete files on the device, then sync
    Delete {
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,

        #[arg(long)]
        no_sync: bool,
    },

    /// Ask the agent to apply everything sent so far
    Sync {
        /// Acknowledgment timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Watch a directory and push changes continuously
    #[cfg(feature = "watch")]
    Watch {
        /// Directory to watch (default: the base directory)
        dir: Option<PathBuf>,

        /// Debounce delay in milliseconds
        #[arg(short, long, default_value_t = livesync::watch::DEFAULT_DEBOUNCE.as_millis() as u64)]
        debounce_ms: u64,
    },

    /// List the port forwards adb has in place
    Forwards,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "livesync=debug"
    } else {
        "livesync=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = cli.load_config()?;

    match &cli.command {
        Commands::Forwards => forwards_command(&config).await,
        Commands::Push { paths, no_sync } => {
            let engine = cli.connect(config).await?;
            let result = push_command(&engine, paths, *no_sync).await;
            engine.end().await;
            result
        }
        Commands::Delete { paths, no_sync } => {
            let engine = cli.connect(config).await?;
            let result = delete_command(&engine, paths, *no_sync).await;
            engine.end().await;
            result
        }
        Commands::Sync { timeout_ms } => {
            let engine = cli.connect(config).await?;
            let timeout = timeout_ms.map(std::time::Duration::from_millis);
            let result = engine.send_sync(None, timeout).await;
            engine.end().await;
            let op = result.context("sync failed")?;
            println!("{op}");
            Ok(())
        }
        #[cfg(feature = "watch")]
        Commands::Watch { dir, debounce_ms } => {
            let engine = cli.connect(config).await?;
            let root = match dir {
                Some(dir) => absolute(dir)?,
                None => engine.config().base_dir.clone(),
            };
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            livesync::watch::watch(&engine, &root, Duration::from_millis(*debounce_ms), shutdown)
                .await?;
            engine.end().await;
            Ok(())
        }
    }
}

impl Cli {
    /// File config (if any) with command-line overrides applied.
    fn load_config(&self) -> Result<Config> {
        let mut config = match self.config_path() {
            Some(path) => Config::load(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(app) = &self.application_id {
            config.application_id = app.clone();
        }
        if let Some(base) = &self.base_dir {
            config.base_dir = base.clone();
        }
        if config.base_dir.as_os_str().is_empty() {
            config.base_dir = std::env::current_dir().context("failed to read current directory")?;
        }
        config.base_dir = absolute(&config.base_dir)?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(device) = &self.device {
            config.device = Some(device.clone());
        }
        if let Some(suffix) = &self.suffix {
            config.socket_suffix = suffix.clone();
        }
        if let Some(adb) = &self.adb {
            config.adb_path = adb.clone();
        }

        Ok(config)
    }

    fn config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config {
            return Some(path.clone());
        }
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("livesync").join("config.toml"))
            .filter(|path| path.is_file())
    }

    async fn connect(&self, config: Config) -> Result<LiveSync> {
        let engine = if self.no_forward {
            LiveSync::with_tunnel(config, DirectTunnel)
        } else {
            LiveSync::new(config)
        };
        engine.on_error(|e| tracing::error!(error = %e, "livesync error"));

        let handshake = engine
            .connect()
            .await
            .context("failed to connect to the livesync agent")?;
        tracing::debug!(version = %handshake.protocol_version, "handshake received");
        Ok(engine)
    }
}

async fn push_command(engine: &LiveSync, paths: &[PathBuf], no_sync: bool) -> Result<()> {
    let mut sent = 0usize;
    let mut files = Vec::new();

    for path in paths {
        let path = absolute(path)?;
        if path.is_dir() {
            sent += engine.send_directory(&path).await?.len();
        } else {
            files.push(path);
        }
    }
    sent += engine.send_files(&files).await?.len();
    tracing::info!(files = sent, "sent");

    if !no_sync {
        let op = engine.send_sync(None, None).await.context("sync failed")?;
        println!("{op}");
    }
    Ok(())
}

async fn delete_command(engine: &LiveSync, paths: &[PathBuf], no_sync: bool) -> Result<()> {
    let paths = paths
        .iter()
        .map(|p| absolute(p))
        .collect::<Result<Vec<_>>>()?;
    engine.delete_files(&paths).await?;
    tracing::info!(files = paths.len(), "deleted");

    if !no_sync {
        let op = engine.send_sync(None, None).await.context("sync failed")?;
        println!("{op}");
    }
    Ok(())
}

async fn forwards_command(config: &Config) -> Result<()> {
    let rules = AdbTunnel::new(config.adb_path.clone()).list().await?;
    if rules.is_empty() {
        println!("No forwards.");
        return Ok(());
    }
    println!("{:<24} {:<16} {}", "SERIAL", "LOCAL", "REMOTE");
    for rule in &rules {
        println!("{:<24} {:<16} {}", rule.serial, rule.local, rule.remote);
    }
    Ok(())
}

/// Absolute form of `path`, resolving symlinks when the path exists so it
/// lines up with what the filesystem watcher reports.
fn absolute(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    Ok(cwd.join(path))
}
