//! Basic walk-through of the router over in-memory collaborators.
//!
//! Writes enough records to split the first partition, kills a primary to
//! show promotion, and prints the metrics at the end.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic

use shardmap::{MemoryKv, MemoryStore, Monitor, Router, RouterConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shardmap=info")),
        )
        .init();

    let store = Arc::new(MemoryStore::new());
    let config = RouterConfig::new(vec!["node-0".into(), "node-1".into(), "node-2".into()])
        .with_replicas(1)
        .with_batch_size(16)
        .with_max_shard_size(64)
        .with_monitor_interval(Duration::from_millis(100));
    let router = Router::new(Arc::new(MemoryKv::new()), store.clone(), config)?;
    let monitor = Arc::new(Monitor::new(router.clone()));
    let monitor_task = monitor.start();

    println!("--- Writes ---");
    let mut last = None;
    for key in 0..200u64 {
        last = Some(router.submit_write(key * 10, format!("value-{}", key).into_bytes()).await?);
    }
    router.flush().await?;
    if let Some(request) = last {
        println!("Last request: {:?}", router.get_request_status(request).await?.status);
    }

    println!("\n--- Partitions ---");
    for partition in router.map().partitions().await? {
        println!(
            "  {} {} {} primary={} records={}",
            partition.id, partition.range, partition.status, partition.primary, partition.record_count
        );
    }

    println!("\n--- Failover ---");
    let owner = router
        .map()
        .lookup(0)
        .await?
        .ok_or("key 0 has no owner")?;
    println!("Killing {}", owner.primary.node);
    store.set_node_down(&owner.primary.node, true);
    router.submit_write(0, &b"after failover"[..]).await?;
    router.flush().await?;
    let owner = router.map().get(owner.id).await?;
    println!("New primary: {}", owner.primary);
    let record = router.read_by_key(0).await?;
    println!("Read key 0: {}", String::from_utf8_lossy(&record.payload));

    store.set_node_down(&owner.replicas[0].node, false);
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("\n--- Metrics ---");
    print!("{}", router.metrics().to_prometheus());

    println!("\nShutting down...");
    router.shutdown().await;
    monitor_task.await?;
    Ok(())
}
