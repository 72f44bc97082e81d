//! BuildIt master.
//!
//! Loads `master.kdl`, opens the mutually authenticated worker channel and
//! runs the coordinator until interrupted.

use anyhow::Context;
use buildit_channel::{ChannelManager, ChannelSettings, ListenHandle, TlsMaterial};
use buildit_config::{MasterConfig, default_config_kdl, load_master_config};
use buildit_scheduler::{BuildEvent, Coordinator, CoordinatorHandle, CoordinatorSettings};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/buildit/master.kdl";

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "buildit-master")]
#[command(about = "BuildIt CI master", long_about = None)]
struct Cli {
    /// Path to the master configuration file
    #[arg(long, global = true, env = "BUILDIT_MASTER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master (default)
    Serve(Overrides),
    /// Write the default configuration file
    InitConfig {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration and print the effective values
    CheckConfig(Overrides),
}

/// Command-line values that take precedence over the configuration file.
#[derive(Args, Debug, Default, Clone)]
struct Overrides {
    /// Worker channel listen address
    #[arg(long, env = "BUILDIT_LISTEN")]
    listen: Option<SocketAddr>,

    /// PEM certificate presented to workers
    #[arg(long, env = "BUILDIT_TLS_CERT")]
    cert: Option<PathBuf>,

    /// PEM private key for the certificate
    #[arg(long, env = "BUILDIT_TLS_KEY")]
    key: Option<PathBuf>,

    /// PEM bundle of CAs trusted to sign worker certificates
    #[arg(long, env = "BUILDIT_TLS_CA")]
    ca: Option<PathBuf>,
}

impl Overrides {
    fn apply(&self, config: &mut MasterConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(cert) = &self.cert {
            config.tls.cert = Some(cert.clone());
        }
        if let Some(key) = &self.key {
            config.tls.key = Some(key.clone());
        }
        if let Some(ca) = &self.ca {
            config.tls.ca = Some(ca.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command.unwrap_or(Commands::Serve(Overrides::default())) {
        Commands::Serve(overrides) => {
            let config = effective_config(&cli.config, &overrides)?;
            serve(config).await
        }
        Commands::InitConfig { force } => init_config(&cli.config, force),
        Commands::CheckConfig(overrides) => {
            let config = effective_config(&cli.config, &overrides)?;
            config
                .tls
                .require()
                .context("TLS material is required to serve")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// File values, then command-line overrides, then validation.
fn effective_config(path: &Path, overrides: &Overrides) -> anyhow::Result<MasterConfig> {
    let mut config = read_config(path)?;
    overrides.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn read_config(path: &Path) -> anyhow::Result<MasterConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG_PATH) {
        info!(path = %path.display(), "No configuration file, using defaults");
        return Ok(MasterConfig::default());
    }
    load_master_config(path).with_context(|| format!("reading {}", path.display()))
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to replace it)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, default_config_kdl())
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(())
}

async fn serve(config: MasterConfig) -> anyhow::Result<()> {
    let tls = TlsMaterial::load(&config.tls).context("loading TLS material")?;
    let shutdown = CancellationToken::new();

    let ListenHandle {
        local_addr,
        events,
        links,
        task: accept_task,
    } = ChannelManager::start(ChannelSettings::from_config(&config), &tls, shutdown.clone())
        .await
        .context("starting worker channel")?;
    info!(addr = %local_addr, "Worker channel listening");

    let (coordinator, handle) = Coordinator::new(
        CoordinatorSettings::from_config(&config),
        Arc::new(links),
        events,
        shutdown.clone(),
    );
    let coordinator_task = tokio::spawn(coordinator.run());
    let log_task = tokio::spawn(log_build_events(handle.subscribe(), shutdown.clone()));
    let stats_task = tokio::spawn(report_stats(handle, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("Shutting down");
    shutdown.cancel();

    for (name, task) in [
        ("accept loop", accept_task),
        ("coordinator", coordinator_task),
        ("event log", log_task),
        ("stats", stats_task),
    ] {
        join(name, task).await;
    }
    Ok(())
}

async fn join(name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!(task = name, error = %e, "Task ended abnormally");
    }
}

async fn log_build_events(mut events: broadcast::Receiver<BuildEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(BuildEvent::Finished(session)) => info!(
                build_id = %session.id,
                state = %session.state,
                exit_code = ?session.exit_code,
                retries = session.retry_count,
                "Build finished"
            ),
            Ok(BuildEvent::Log { .. }) => {}
            Ok(other) => debug!(event = ?other, "Build event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Build event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn report_stats(handle: CoordinatorHandle, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match handle.stats().await {
            Ok(stats) => info!(
                queued = stats.queued,
                live_sessions = stats.live_sessions,
                workers = stats.workers,
                eligible_workers = stats.eligible_workers,
                free_slots = stats.free_slots,
                oldest_queued_secs = ?stats.oldest_queued_secs,
                "Coordinator stats"
            ),
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["buildit-master", "--debug"]).unwrap();
        assert!(cli.debug);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let cli = Cli::try_parse_from([
            "buildit-master",
            "serve",
            "--listen",
            "127.0.0.1:4444",
            "--cert",
            "/tmp/m.pem",
            "--ca",
            "/tmp/ca.pem",
        ])
        .unwrap();
        let Some(Commands::Serve(overrides)) = cli.command else {
            panic!("expected serve");
        };

        let mut config = MasterConfig::default();
        config.tls.key = Some(PathBuf::from("/etc/buildit/master.key"));
        overrides.apply(&mut config);

        assert_eq!(config.listen, "127.0.0.1:4444".parse().unwrap());
        assert_eq!(config.tls.cert, Some(PathBuf::from("/tmp/m.pem")));
        assert_eq!(config.tls.key, Some(PathBuf::from("/etc/buildit/master.key")));
        assert_eq!(config.tls.ca, Some(PathBuf::from("/tmp/ca.pem")));
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let path = std::env::temp_dir().join("buildit-master-does-not-exist.kdl");
        assert!(read_config(&path).is_err());
    }

    #[test]
    fn test_init_config_round_trips() {
        let dir = std::env::temp_dir().join(format!("buildit-master-{}", std::process::id()));
        let path = dir.join("master.kdl");
        let _ = std::fs::remove_file(&path);

        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();

        let mut config = effective_config(&path, &Overrides::default()).unwrap();
        assert_eq!(config.tls.cert, Some(PathBuf::from("/etc/buildit/master.pem")));
        config.tls = Default::default();
        assert_eq!(config, MasterConfig::default());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_serve_without_tls_fails() {
        let err = serve(MasterConfig::default()).await.unwrap_err();
        assert!(format!("{err:#}").contains("missing required field"));
    }
}
