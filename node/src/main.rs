use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trustmesh_consensus::{
    register_inbox, sink_from_config, ConsensusBus, ConsensusEngine, ReputationAggregator,
    RoundDriver, RoundOutcome, StateSource, SummarySink, TracingSink,
};
use trustmesh_crypto::{IdentityManager, NodeIdentity};
use trustmesh_network::{serve_tcp, ClientAuthKeypair, DescriptorStore};

mod config;
mod context;
mod source;
mod version;

use config::{BootstrapPeer, NodeConfig};
use context::{DataDirLock, NodeContext};
use source::JsonFileSource;
use version::{git_commit_hash, TRUSTMESH_VERSION};

/// Written by the overlay next to the service key once published.
const HOSTNAME_FILE: &str = "hostname";

#[derive(Debug, Parser)]
#[command(name = "trustmesh-node", version = TRUSTMESH_VERSION, about = "TrustMesh distributed trust node")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Replace an unreadable keystore with a new identity
    #[arg(long, global = true)]
    force_new: bool,

    /// Override the log level
    #[arg(long, value_name = "LEVEL", global = true,
          value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// Select log output format
    #[arg(long, value_name = "FORMAT", global = true, value_parser = ["pretty", "json"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Print the peer id, public keys and a bootstrap entry for this node
    Identity {
        /// Host other nodes should dial
        #[arg(long)]
        host: Option<String>,
    },
    /// Authorize an overlay client and write both of its descriptors
    AuthorizeClient { label: String },
    /// Remove an overlay client's authorization; applied on the next reload
    RevokeClient { label: String },
}

#[derive(Serialize)]
struct PeersSnippet {
    peers: Vec<BootstrapPeer>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = NodeConfig::load(cli.config.as_deref())?;
    apply_overrides(&cli, &mut config);
    config.resolve_paths();
    config.validate()?;
    init_logging(&config)?;

    match cli.command {
        None | Some(Commands::Run) => run_node(config, cli.force_new).await,
        Some(Commands::Identity { host }) => show_identity(&config, cli.force_new, host),
        Some(Commands::AuthorizeClient { label }) => authorize_client(&config, &label),
        Some(Commands::RevokeClient { label }) => revoke_client(&config, &label),
    }
}

fn apply_overrides(cli: &Cli, config: &mut NodeConfig) {
    if let Some(data_dir) = &cli.data_dir {
        config.node.data_dir = data_dir.clone();
    }
    if let Some(log_level) = &cli.log_level {
        config.node.log_level = log_level.clone();
    }
    if let Some(log_format) = &cli.log_format {
        config.node.log_format = log_format.clone();
    }
}

fn init_logging(config: &NodeConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.node.log_level));

    if config.node.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    }

    Ok(())
}

fn read_passphrase(env_name: &str) -> Result<String> {
    let passphrase = match std::env::var(env_name) {
        Ok(value) if !value.is_empty() => value,
        _ => rpassword::prompt_password("Keystore passphrase: ")
            .context("reading keystore passphrase")?,
    };
    if passphrase.is_empty() {
        bail!("keystore passphrase must not be empty (set {env_name} or enter it when prompted)");
    }
    Ok(passphrase)
}

/// Identity failures are the one condition that stops the node.
fn open_identity(config: &NodeConfig, force_new: bool) -> Result<NodeIdentity> {
    let passphrase = read_passphrase(&config.node.passphrase_env)?;
    IdentityManager::new(config.keystore_path())
        .with_force_new(force_new)
        .generate_or_load_identity(&passphrase)
        .with_context(|| {
            format!(
                "unable to open node identity at {}; refusing to start",
                config.keystore_path().display()
            )
        })
}

async fn run_node(config: NodeConfig, force_new: bool) -> Result<()> {
    let _lock = DataDirLock::acquire(&config.node.data_dir, "run")?;
    let identity = Arc::new(open_identity(&config, force_new)?);
    info!(
        version = TRUSTMESH_VERSION,
        commit = git_commit_hash(),
        peer = %identity.peer_id(),
        "starting TrustMesh node"
    );

    let listen = (config.node.listen_host.clone(), config.node.listen_port);
    let context = Arc::new(NodeContext::build(config, identity.clone()).await?);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {}:{}", listen.0, listen.1))?;
    let server = {
        let transport = context.transport.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_tcp(listener, transport).await {
                error!(error = %err, "peer listener stopped");
            }
        })
    };

    let connected = context.connect_bootstrap().await;
    info!(
        connected,
        bootstrap = context.bootstrap_peers().len(),
        "bootstrap complete"
    );
    context.announce();

    let node_config = &context.config;
    let (inbox_tx, inbox) = mpsc::channel(node_config.consensus.inbox_depth);
    register_inbox(&context.transport, inbox_tx);

    let aggregator = match ReputationAggregator::load(node_config.reputation.clone()) {
        Ok(aggregator) => aggregator,
        Err(err) => {
            warn!(error = %err, "reputation table unreadable, starting from defaults");
            ReputationAggregator::new(node_config.reputation.clone())
        }
    };
    aggregator.mirror_into(&context.directory);
    let sink = sink_from_config(&node_config.reputation).unwrap_or_else(|err| {
        warn!(error = %err, "summary sink unavailable, logging summaries instead");
        Box::new(TracingSink) as Box<dyn SummarySink>
    });
    let source = node_config
        .node
        .state_file
        .clone()
        .map(|path| Arc::new(JsonFileSource::new(path)) as Arc<dyn StateSource>);
    if source.is_none() {
        info!("no state file configured, this node only votes");
    }

    let engine = ConsensusEngine::new(
        identity.clone(),
        context.directory.clone(),
        node_config.consensus.clone(),
    );
    let bus: Arc<dyn ConsensusBus> = Arc::new(context.transport.clone());
    let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();
    let driver = RoundDriver::new(engine, aggregator, sink, bus, source, outcomes_tx);

    let (shutdown_tx, shutdown) = watch::channel(false);
    let driver_task = tokio::spawn(driver.run(inbox, shutdown.clone()));
    let maintenance = tokio::spawn(maintain_peers(context.clone(), shutdown));

    info!(peer = %identity.peer_id(), onion = ?context.onion, "TrustMesh node is running");
    let mut reload = ReloadSignal::new()?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for ctrl-c");
                }
                break;
            }
            _ = reload.recv() => {
                info!("reloading overlay client authorizations");
                if let Err(err) = context.gateway.reload().await {
                    warn!(error = %err, "overlay reload failed");
                }
            }
            outcome = outcomes.recv() => match outcome {
                Some(RoundOutcome::Finalized(summary)) => info!(
                    sequence = summary.sequence,
                    view = summary.view,
                    nodes = summary.summary.nodes_count,
                    digest = %summary.digest,
                    "round finalized"
                ),
                Some(RoundOutcome::Unavailable(err)) => error!(error = %err, "consensus unavailable"),
                None => {
                    warn!("round driver exited");
                    break;
                }
            },
        }
    }

    info!("shutting down TrustMesh node");
    let _ = shutdown_tx.send(true);
    if let Err(err) = driver_task.await {
        warn!(error = %err, "round driver task failed");
    }
    if let Err(err) = maintenance.await {
        warn!(error = %err, "maintenance task failed");
    }
    if context.onion.is_some() {
        if let Err(err) = context.gateway.teardown().await {
            warn!(error = %err, "failed to remove onion service");
        }
    }
    context.transport.shutdown();
    server.abort();
    info!("TrustMesh node shutdown complete");
    Ok(())
}

/// Evict silent peers and redial lost bootstrap peers once per round interval.
async fn maintain_peers(context: Arc<NodeContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(context.config.consensus.round_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = context.evict_silent();
                let authorized = context.authorize_overlay_peers().await;
                let reconnected = context.connect_bootstrap().await;
                if reconnected > 0 {
                    context.announce();
                }
                debug!(
                    evicted,
                    authorized,
                    reconnected,
                    live = context.directory.live_count(),
                    "peer maintenance"
                );
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(unix)]
struct ReloadSignal(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl ReloadSignal {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self(Some(signal(SignalKind::hangup())?)))
    }

    /// Resolves on SIGHUP.
    async fn recv(&mut self) {
        match &mut self.0 {
            Some(signal) => {
                if signal.recv().await.is_none() {
                    self.0 = None;
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

fn show_identity(config: &NodeConfig, force_new: bool, host: Option<String>) -> Result<()> {
    let identity = open_identity(config, force_new)?;
    let keys = identity.public_keys();
    let host = host
        .or_else(|| config.node.advertise_host.clone())
        .unwrap_or_else(|| config.node.listen_host.clone());

    println!("peer id:       {}", identity.peer_id());
    println!("signing key:   {}", hex::encode(keys.signing));
    println!("agreement key: {}", hex::encode(keys.agreement));
    println!();
    println!("# bootstrap entry for other nodes");
    let snippet = PeersSnippet {
        peers: vec![BootstrapPeer::from_keys(host, config.node.listen_port, &keys)],
    };
    print!("{}", toml::to_string(&snippet)?);
    Ok(())
}

fn published_address(config: &NodeConfig) -> Result<String> {
    let path = config.overlay.service_dir.join(HOSTNAME_FILE);
    match fs::read_to_string(&path) {
        Ok(address) => Ok(address.trim().to_string()),
        Err(err) if err.kind() == ErrorKind::NotFound => bail!(
            "no onion service published yet ({} is missing); run the node with overlay.mode = \"tor\" first",
            path.display()
        ),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

fn authorize_client(config: &NodeConfig, label: &str) -> Result<()> {
    let address = published_address(config)?;
    let store = DescriptorStore::new(&config.overlay.service_dir);
    let keypair = ClientAuthKeypair::generate();

    let server_path = store.write_server(&keypair.authorize(label))?;
    let client_path = store.write_client(label, &address, &keypair.secret_bytes())?;

    println!("authorized client '{label}' for {address}");
    println!("server descriptor: {}", server_path.display());
    println!("client descriptor: {}", client_path.display());
    println!("Deliver the client descriptor privately, then send SIGHUP to the running node.");
    Ok(())
}

fn revoke_client(config: &NodeConfig, label: &str) -> Result<()> {
    let store = DescriptorStore::new(&config.overlay.service_dir);
    if store.remove_server(label)? {
        println!("revoked client '{label}'; send SIGHUP to the running node to apply it");
    } else {
        println!("no authorization found for client '{label}'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trustmesh_network::gateway::client_auth::descriptors_match;

    fn config_in(dir: &std::path::Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.data_dir = dir.to_path_buf();
        config.resolve_paths();
        config
    }

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::parse_from(["trustmesh-node"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["trustmesh-node", "--log-format", "json", "authorize-client", "laptop"]);
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert!(matches!(cli.command, Some(Commands::AuthorizeClient { ref label }) if label == "laptop"));
    }

    #[test]
    fn test_overrides_win_over_config() {
        let cli = Cli::parse_from(["trustmesh-node", "--data-dir", "/srv/mesh", "--log-level", "debug"]);
        let mut config = NodeConfig::default();
        apply_overrides(&cli, &mut config);
        assert_eq!(config.node.data_dir, PathBuf::from("/srv/mesh"));
        assert_eq!(config.node.log_level, "debug");
    }

    #[test]
    fn test_authorize_requires_published_service() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        let err = authorize_client(&config, "laptop").unwrap_err();
        assert!(err.to_string().contains("no onion service"), "unexpected error: {err}");
    }

    #[test]
    fn test_authorize_then_revoke_client() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        fs::create_dir_all(&config.overlay.service_dir).expect("service dir");
        fs::write(config.overlay.service_dir.join(HOSTNAME_FILE), "abcdefgh.onion\n").expect("hostname");

        authorize_client(&config, "laptop").expect("authorize");
        let store = DescriptorStore::new(&config.overlay.service_dir);
        let server = fs::read_to_string(store.server_path("laptop")).expect("server descriptor");
        let client = fs::read_to_string(store.client_path("laptop")).expect("client descriptor");
        assert!(client.starts_with("abcdefgh:descriptor:x25519:"));
        assert!(descriptors_match(&server, &client).expect("parse"));

        revoke_client(&config, "laptop").expect("revoke");
        assert!(!store.server_path("laptop").exists());
        assert!(store.load_server_descriptors().expect("load").is_empty());
    }

    #[test]
    fn test_invalid_label_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        fs::create_dir_all(&config.overlay.service_dir).expect("service dir");
        fs::write(config.overlay.service_dir.join(HOSTNAME_FILE), "abcdefgh.onion\n").expect("hostname");
        assert!(authorize_client(&config, "../escape").is_err());
    }
}
