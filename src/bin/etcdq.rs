//! etcdq CLI: run the HTTP front door, or add and pop items by hand.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use etcdq::config::{Config, DEFAULT_LISTEN};
use etcdq::model::Item;
use etcdq::queue::{AddOptions, PopOptions, Queue};
use etcdq::store::MemoryStore;
use etcdq::telemetry::{TelemetryConfig, init_telemetry};
use etcdq::web::WebServer;

#[derive(Parser)]
#[command(name = "etcdq", about = "Priority job queue backed by etcd")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP front door
    Serve {
        /// Address to listen on (overrides ETCDQ_LISTEN)
        #[arg(long)]
        listen: Option<String>,
        /// Use an in-process store instead of etcd (nothing is persisted)
        #[arg(long)]
        memory: bool,
    },
    /// Add one item to a bucket
    Add {
        bucket: String,
        value: String,
        /// Priority (higher = served first, max 99999)
        #[arg(long, default_value_t = 0)]
        weight: u64,
        /// Expire the item if nobody pops it within this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Pop one item from a bucket, waiting if it is empty
    Pop {
        bucket: String,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { listen, memory } => cmd_serve(listen, memory).await,
        Command::Add {
            bucket,
            value,
            weight,
            ttl,
        } => {
            let config = Config::from_env()?;
            let _guard = init_telemetry(TelemetryConfig::from(&config))?;
            let queue = Queue::connect(&config).await?;
            let result = cmd_add(&queue, bucket, value, weight, ttl).await;
            queue.stop().await;
            result
        }
        Command::Pop { bucket, timeout } => {
            let config = Config::from_env()?;
            let _guard = init_telemetry(TelemetryConfig::from(&config))?;
            let queue = Queue::connect(&config).await?;
            let result = cmd_pop(&queue, &bucket, timeout).await;
            queue.stop().await;
            result
        }
    }
}

async fn cmd_serve(listen: Option<String>, memory: bool) -> anyhow::Result<()> {
    // The memory store needs no etcd settings.
    let config = if memory { None } else { Some(Config::from_env()?) };

    let _guard = init_telemetry(
        config
            .as_ref()
            .map(TelemetryConfig::from)
            .unwrap_or_else(TelemetryConfig::local),
    )?;

    let queue = match &config {
        Some(config) => Queue::connect(config).await?,
        None => Queue::new(Arc::new(MemoryStore::new())).await?,
    };

    let listen = listen
        .or_else(|| config.as_ref().map(|c| c.listen.clone()))
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let default_ttl = config.as_ref().and_then(|c| c.default_ttl);

    let server = WebServer::start(&listen, queue.clone(), default_ttl).await?;
    println!("etcdq listening on {}", server.url());

    tokio::signal::ctrl_c().await.ok();
    server.stop().await?;
    queue.stop().await;
    Ok(())
}

async fn cmd_add(
    queue: &Queue,
    bucket: String,
    value: String,
    weight: u64,
    ttl: Option<u64>,
) -> anyhow::Result<()> {
    let item = Item::new(bucket, weight, value);
    let opts = AddOptions {
        ttl: ttl.map(Duration::from_secs),
    };
    queue.add(&item, opts).await?;
    println!("{}", item.key);
    Ok(())
}

async fn cmd_pop(queue: &Queue, bucket: &str, timeout: Option<u64>) -> anyhow::Result<()> {
    let opts = PopOptions {
        timeout: timeout.map(Duration::from_secs),
    };
    let item = queue.pop(bucket, opts).await.await;
    println!("{}", serde_json::to_string_pretty(&item)?);
    item.into_result().map_err(|error| anyhow::anyhow!("pop failed: {error}"))?;
    Ok(())
}
