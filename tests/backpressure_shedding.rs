//! Backpressure shedding and claim hygiene at the edge.

mod support;

use rankmatch::RequestError;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_limit_sheds_and_releases_the_claim() {
    let node = support::start_node(|config| {
        config.partition_count = 1;
        config.immediate_match_allowed_diff = 0;
        config.widening.step_diff = 0;
        config.backpressure.queued_count_limit = 2;
    })
    .await;

    // Distinct ranks far apart so nothing matches; the third fills the queue
    // past the limit, the fourth is shed.
    node.add_request("u1", 1_000).await.unwrap();
    node.add_request("u2", 3_000).await.unwrap();
    node.add_request("u3", 5_000).await.unwrap();
    assert_eq!(
        node.add_request("u4", 7_000).await,
        Err(RequestError::Overloaded)
    );

    // The shed request's claim was released, not leaked.
    assert!(!node.claims().is_claimed("u4"));
    assert_eq!(
        node.add_request("u4", 7_000).await,
        Err(RequestError::Overloaded)
    );

    let stats = node.worker_stats().await;
    assert_eq!(stats.iter().map(|s| s.queued_count).sum::<usize>(), 3);
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shedding_is_per_shard() {
    let node = support::start_node(|config| {
        config.partition_count = 2;
        config.immediate_match_allowed_diff = 0;
        config.widening.step_diff = 0;
        config.backpressure.queued_count_limit = 1;
    })
    .await;

    node.add_request("a1", 1_000).await.unwrap();
    node.add_request("a2", 2_000).await.unwrap();
    // Left shard (0..4999) is past its limit.
    assert_eq!(
        node.add_request("a3", 3_000).await,
        Err(RequestError::Overloaded)
    );
    // The right shard still admits.
    node.add_request("b1", 9_000).await.unwrap();
    node.shutdown().await;
}
