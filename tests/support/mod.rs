use rankmatch::{MatchmakingConfig, MatchmakingNode, NodeConfig, WideningConfig};
use std::time::Duration;

/// Timers compressed so widening-driven scenarios resolve in well under a
/// second of wall clock.
#[allow(dead_code)]
pub fn fast_config() -> MatchmakingConfig {
    MatchmakingConfig {
        rank_min: 0,
        rank_max: 9_999,
        partition_count: 1,
        immediate_match_allowed_diff: 100,
        widening: WideningConfig {
            step_ms: 50,
            step_diff: 25,
            cap: 1_000,
        },
        tick_interval_ms: 25,
        ..Default::default()
    }
}

#[allow(dead_code)]
pub async fn start_node(mutate: impl FnOnce(&mut MatchmakingConfig)) -> MatchmakingNode {
    let mut matchmaking = fast_config();
    mutate(&mut matchmaking);
    let config = NodeConfig {
        node_id: "node-a".to_string(),
        matchmaking,
    };
    MatchmakingNode::start(config).await.expect("node start")
}

/// Await the next notification on a subscription with a generous deadline.
#[allow(dead_code)]
pub async fn next_match(
    stream: &mut tokio_stream::wrappers::ReceiverStream<rankmatch::MatchNotification>,
) -> rankmatch::MatchNotification {
    use tokio_stream::StreamExt;
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("match within deadline")
        .expect("subscription open")
}
