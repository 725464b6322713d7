mod fixtures;

use std::time::Duration;

use anyhow::Result;
use maplit::btreemap;

use fixtures::Router;

/// Cluster causal_sync test.
///
/// What does this test do?
///
/// - brings 3 causal replicas online and cuts one off.
/// - commits writes on the connected majority; they deliver and leave the
///   pending set, so nothing will ever retransmit them.
/// - reconnects the replica and asserts it still converges, via the
///   periodic full-state sync alone.
///
/// RUST_LOG=replikv,causal_sync=debug cargo test -p replikv --test causal_sync
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn causal_sync() -> Result<()> {
    fixtures::init_tracing();

    let ids = [0, 1, 2];
    let config = fixtures::test_config(&ids);
    let router = Router::new(config);
    router.spawn_causal_cluster().await;

    router.isolate(2).await;

    tracing::info!("--- writing on the connected majority");

    router.patch(0, btreemap! { "a".to_owned() => Some(1) }).await?;
    router.patch(0, btreemap! { "b".to_owned() => Some(2) }).await?;
    router.patch(1, btreemap! { "a".to_owned() => None }).await?;
    router.wait_for_delivered(&[0, 1], 3, Duration::from_secs(5), "all writes delivered on the majority").await?;

    // The isolated replica saw none of the events.
    let metrics = router.causal(2).await.metrics().borrow().clone();
    assert_eq!(metrics.delivered, 0, "the isolated replica must not have delivered anything");

    tracing::info!("--- reconnecting; anti-entropy alone must converge the stores");

    router.restore(2).await;
    router.wait_for_agreement("a", None, Duration::from_secs(10)).await?;
    router.wait_for_agreement("b", Some(2), Duration::from_secs(10)).await?;

    Ok(())
}
