//! Courier broker node binary.
//!
//! # Single-Node Mode
//!
//! Without a membership file the node runs standalone:
//!
//! ```bash
//! courier-server --node-id n1 --data-dir /var/lib/courier --topic orders:4
//! ```
//!
//! # Cluster Mode
//!
//! Every node reads the same membership file and binds its peer protocol
//! listener on its own entry's address:
//!
//! ```bash
//! NODE_ID=n1 courier-server --data-dir ./n1 --cluster-config cluster.json
//! NODE_ID=n2 courier-server --data-dir ./n2 --cluster-config cluster.json
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;

use clap::Parser;
use courier_core::{Error, NodeId};
use courier_server::{Node, NodeOptions};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Courier message broker node.
#[derive(Parser, Debug)]
#[command(name = "courier-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node ID for this server. Must match an entry in the cluster config.
    #[arg(long, env = "NODE_ID", default_value = "n1")]
    node_id: String,

    /// Data directory for the keyspace.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Cluster membership file. A missing file means single-node mode.
    #[arg(long, default_value = "cluster.json")]
    cluster_config: PathBuf,

    /// Override for the peer protocol listen address.
    #[arg(long)]
    listen_addr: Option<String>,

    /// Keyspace fsync interval in milliseconds.
    #[arg(long)]
    fsync_ms: Option<u16>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Pre-create a topic at startup in format `name:partitions` (e.g., `orders:4`).
    /// Can be specified multiple times.
    #[arg(long = "topic", value_parser = parse_topic)]
    topics: Vec<TopicSpec>,

    /// Creator recorded for pre-created topics.
    #[arg(long, default_value = "admin")]
    creator: String,
}

/// Topic specification for pre-creation.
#[derive(Debug, Clone)]
struct TopicSpec {
    /// Topic name.
    name: String,
    /// Number of partitions.
    partitions: u32,
}

/// Parses a topic specification in format `name:partitions`.
fn parse_topic(s: &str) -> Result<TopicSpec, String> {
    let Some((name, partitions)) = s.split_once(':') else {
        return Err(format!(
            "invalid topic format '{s}', expected 'name:partitions'"
        ));
    };

    if name.is_empty() {
        return Err("topic name cannot be empty".to_string());
    }

    let partitions: u32 = partitions
        .parse()
        .map_err(|_| format!("invalid partition count '{partitions}' in topic '{s}'"))?;

    if partitions == 0 {
        return Err("partition count must be positive".to_string());
    }

    Ok(TopicSpec {
        name: name.to_string(),
        partitions,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(
        node_id = %args.node_id,
        data_dir = %args.data_dir.display(),
        cluster_config = %args.cluster_config.display(),
        "Starting Courier server"
    );

    let mut options = NodeOptions::new(NodeId::new(args.node_id), args.data_dir)
        .with_cluster_config(args.cluster_config);
    options.fsync_ms = args.fsync_ms;
    if let Some(addr) = args.listen_addr {
        options = options.with_listen_addr(addr);
    }

    let node = Node::start(options).await?;

    for topic in &args.topics {
        match node
            .broker()
            .create_topic(&topic.name, topic.partitions, &args.creator)
        {
            Ok(_) => {
                info!(
                    topic = %topic.name,
                    partitions = topic.partitions,
                    "Pre-created topic"
                );
            }
            Err(Error::AlreadyExists { .. }) => {
                info!(topic = %topic.name, "Topic already exists");
            }
            Err(e) => {
                warn!(topic = %topic.name, error = %e, "Topic creation failed");
            }
        }
    }

    info!(leader = %node.leader().await, "Node ready");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    node.shutdown().await?;

    Ok(())
}
