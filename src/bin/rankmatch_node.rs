//! Single-node matchmaking smoke tool.
//!
//! Boots a node from config, reads `user_id rank` request lines on stdin and
//! prints match notifications as JSON lines on stdout.

use rankmatch::{MatchmakingNode, NodeConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = parse_arg("--config");
    let mut config = NodeConfig::load(config_path.as_deref())?;
    if let Some(node_id) = parse_arg("--node-id") {
        config.node_id = node_id;
    }

    let node = MatchmakingNode::start(config).await?;
    println!(
        "rankmatch node {} serving ranks {}..={} over {} shards",
        node.node_id(),
        node.config().rank_min,
        node.config().rank_max,
        node.config().partition_count
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let (Some(user_id), Some(rank)) = (parts.next(), parts.next()) else {
            eprintln!("expected: <user_id> <rank>");
            continue;
        };
        let rank: i64 = match rank.parse() {
            Ok(rank) => rank,
            Err(_) => {
                eprintln!("rank must be an integer: {rank}");
                continue;
            }
        };

        let mut matches = node.subscribe_matches(user_id);
        match node.add_request(user_id, rank).await {
            Ok(()) => {
                println!("queued {user_id} at {rank}");
                tokio::spawn(async move {
                    if let Some(notification) = matches.next().await {
                        if let Ok(json) = serde_json::to_string(&notification) {
                            println!("{json}");
                        }
                    }
                });
            }
            Err(err) => eprintln!("rejected {user_id}: {err}"),
        }
    }

    node.shutdown().await;
    Ok(())
}
