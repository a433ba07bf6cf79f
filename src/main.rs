use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use mqtt_relay::broker::Broker;
use mqtt_relay::client::{demo_payload, ManagedSession, PublishScheduler};
use mqtt_relay::config::RelayConfig;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "mqtt-relay")]
#[command(about = "Publish/subscribe relay broker and managed publishing client")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/mqtt-relay/relay.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker until Ctrl-C
    Broker(BrokerArgs),
    /// Run the managed client and its publish scheduler until Ctrl-C
    Client(ClientArgs),
}

#[derive(Args)]
struct BrokerArgs {
    /// Listen address, e.g. 0.0.0.0:707
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long)]
    client_id: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.log_level)?;

    let config = load_config(cli.config.as_deref()).await?;
    match cli.command {
        Command::Broker(args) => run_broker(config, args).await,
        Command::Client(args) => run_client(config, args).await,
    }
}

fn setup(level: Level) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
    Ok(())
}

async fn load_config(path: Option<&std::path::Path>) -> Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::load(Some(path)).await,
        None => {
            let path = RelayConfig::default_path();
            if let Err(e) = RelayConfig::ensure_default_config(&path).await {
                warn!("Could not create default config: {}", e);
            }
            RelayConfig::load(Some(&path)).await
        }
    }
}

async fn run_broker(mut config: RelayConfig, args: BrokerArgs) -> Result<()> {
    if let Some(listen) = args.listen {
        config.broker.listen = listen;
    }

    let broker = Broker::from_config(&config.broker)
        .bind(config.broker.listen.as_str())
        .await?;
    info!("Broker running on {}, press Ctrl-C to stop", broker.local_addr());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    broker.shutdown().await;
    Ok(())
}

async fn run_client(mut config: RelayConfig, args: ClientArgs) -> Result<()> {
    let client = &mut config.client;
    if let Some(client_id) = args.client_id {
        client.client_id = client_id;
    }
    if let Some(host) = args.host {
        client.host = host;
    }
    if let Some(port) = args.port {
        client.port = port;
    }

    let session = ManagedSession::from_config(client);
    let scheduler = PublishScheduler::new(client.publish_period(), client.topic.clone(), |_| {
        demo_payload()
    })?
    .with_qos(client.qos)
    .with_retain(client.retain)
    .spawn(session.publisher());
    info!("Client {} running, press Ctrl-C to stop", session.client_id());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

    let ticks = scheduler.shutdown().await;
    info!("Scheduler stopped after {} ticks, {} messages sent", ticks, session.sent());
    session
        .shutdown()
        .await
        .map_err(|e| eyre!("Session ended with error: {}", e))
}
