mod fixtures;

use std::time::Duration;

use anyhow::Result;
use maplit::btreemap;

use fixtures::Router;

/// Cluster causal_convergence test.
///
/// What does this test do?
///
/// - brings 3 causal replicas online.
/// - has replicas 1 and 2 write the same key concurrently (arranged via
///   isolation, so neither write is in the other's causal history).
/// - asserts every replica converges on one value: the write from the
///   replica with the higher ID, since the clocks are concurrent.
///
/// RUST_LOG=replikv,causal_convergence=debug cargo test -p replikv --test causal_convergence
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn causal_convergence() -> Result<()> {
    fixtures::init_tracing();

    let ids = [0, 1, 2];
    let config = fixtures::test_config(&ids);
    let router = Router::new(config);
    router.spawn_causal_cluster().await;

    tracing::info!("--- concurrent writes to x from replicas 1 and 2");

    // While replica 2 is cut off, replica 1's write reaches the majority
    // {0, 1} and delivers there.
    router.isolate(2).await;
    router.patch(1, btreemap! { "x".to_owned() => Some(1) }).await?;
    router.wait_for_delivered(&[0, 1], 1, Duration::from_secs(5), "first write delivered on the majority").await?;

    // Now cut off replica 1 instead; replica 2 has seen nothing, so its
    // write carries a clock concurrent with replica 1's.
    router.isolate(1).await;
    router.restore(2).await;
    router.patch(2, btreemap! { "x".to_owned() => Some(2) }).await?;
    router.wait_for_delivered(&[0, 2], 1, Duration::from_secs(5), "second write delivered on the majority").await?;

    tracing::info!("--- reconnecting; all replicas must agree on the higher origin's value");

    router.restore(1).await;
    router.wait_for_agreement("x", Some(2), Duration::from_secs(10)).await?;

    Ok(())
}
