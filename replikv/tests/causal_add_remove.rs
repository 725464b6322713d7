mod fixtures;

use std::time::Duration;

use anyhow::Result;
use maplit::btreemap;

use fixtures::Router;

/// Cluster causal_add_remove test.
///
/// What does this test do?
///
/// - brings 3 causal replicas online.
/// - has replica 1 insert x and delete y while replica 2, concurrently,
///   deletes x and inserts y (arranged via isolation).
/// - asserts every replica agrees: for each key, the record from the
///   higher-ID originator dominates, whether it is the insert or the
///   tombstone.
///
/// RUST_LOG=replikv,causal_add_remove=debug cargo test -p replikv --test causal_add_remove
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn causal_add_remove() -> Result<()> {
    fixtures::init_tracing();

    let ids = [0, 1, 2];
    let config = fixtures::test_config(&ids);
    let router = Router::new(config);
    router.spawn_causal_cluster().await;

    tracing::info!("--- replica 1 writes {{x: 7, y: null}} while replica 2 is cut off");

    router.isolate(2).await;
    router
        .patch(1, btreemap! { "x".to_owned() => Some(7), "y".to_owned() => None })
        .await?;
    router.wait_for_delivered(&[0, 1], 1, Duration::from_secs(5), "first patch delivered on the majority").await?;

    tracing::info!("--- replica 2 concurrently writes {{x: null, y: 9}}");

    router.isolate(1).await;
    router.restore(2).await;
    router
        .patch(2, btreemap! { "x".to_owned() => None, "y".to_owned() => Some(9) })
        .await?;
    router.wait_for_delivered(&[0, 2], 1, Duration::from_secs(5), "second patch delivered on the majority").await?;

    tracing::info!("--- reconnecting; the higher originator wins each key");

    router.restore(1).await;
    // x: insert from 1 vs concurrent tombstone from 2 — the tombstone wins.
    router.wait_for_agreement("x", None, Duration::from_secs(10)).await?;
    // y: tombstone from 1 vs concurrent insert from 2 — the insert wins.
    router.wait_for_agreement("y", Some(9), Duration::from_secs(10)).await?;

    Ok(())
}
