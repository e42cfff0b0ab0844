//! # danmu-gateway
//!
//! Gateway binary: loads the config, provisions rooms, connects the broker
//! and serves until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use danmu_gateway::broker::{memory, RedisConsumer, RedisProducer};
use danmu_gateway::{BrokerKind, Consumer, Gateway, GatewayConfig, Result};

/// Danmaku WebSocket gateway.
#[derive(Parser, Debug)]
#[command(name = "danmu-gateway", about = "Danmaku WebSocket gateway")]
struct Cli {
    /// Path to the TOML config file. Defaults apply when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Listen address (overrides `server.listen_addr`).
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();
    log::info!("Starting danmu-gateway with {:?} broker", config.broker.kind);

    match config.broker.kind {
        BrokerKind::Memory => {
            let (producer, consumer) =
                memory::channel(config.broker.topic.clone(), config.broker.queue_capacity);
            run(&config, Arc::new(producer), consumer).await
        }
        BrokerKind::Redis => {
            let broker = &config.broker;
            let producer = RedisProducer::connect(&broker.endpoints, broker.queue_capacity).await?;
            let consumer = RedisConsumer::connect(
                &broker.endpoints,
                broker.topic.clone(),
                broker.group.clone(),
                broker.consumer.clone(),
                broker.block(),
            )
            .await?;
            run(&config, Arc::new(producer), consumer).await
        }
    }
}

async fn run<C>(
    config: &GatewayConfig,
    producer: Arc<dyn danmu_gateway::Producer>,
    consumer: C,
) -> Result<()>
where
    C: Consumer + 'static,
{
    let gateway = Arc::new(Gateway::new(
        config.server.clone(),
        config.broker.topic.clone(),
        producer,
    ));
    for &room_id in &config.rooms.ids {
        gateway.rooms().provision(room_id);
    }
    if gateway.rooms().room_count() == 0 {
        log::warn!("No rooms configured; every connection will be rejected");
    }

    let listener = gateway.bind().await?;

    let signal_gateway = gateway.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_gateway.shutdown(),
            Err(e) => log::error!("Cannot listen for Ctrl-C: {e}"),
        }
    });

    gateway.clone().serve(listener, consumer).await?;

    let stats = gateway.stats();
    log::info!(
        "Served {} connections ({} rejected), {} comments published, {} broadcast",
        stats.total_connections,
        stats.rejected_connections,
        stats.messages_published,
        stats.messages_broadcast
    );
    Ok(())
}
