//! Write queue behavior through the router: one drainer per partition,
//! retries ending in the dead-letter list, and request status expiry.

#[cfg(test)]
mod tests {
    use crate::batch::DrainOutcome;
    use crate::config::BatchConfig;
    use crate::error::Error;
    use crate::status::RequestStatus;
    use crate::testing::TestHarness;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn unbatched(nodes: usize) -> TestHarness {
        TestHarness::with_config(
            TestHarness::config(nodes)
                .with_batch_config(BatchConfig::new(100).with_retries(3, Duration::from_millis(1))),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_drain_per_partition() {
        let harness = Arc::new(unbatched(2));
        for node in 0..2 {
            harness
                .store
                .set_latency(&TestHarness::node(node), Some(Duration::from_millis(1)));
        }
        let mut ids = Vec::new();
        for key in 0..60u64 {
            ids.push(harness.router.submit_write(key, &b"x"[..]).await.unwrap());
        }
        let partition_id = harness.router.map().lookup(0).await.unwrap().unwrap().id;

        let mut drainers = Vec::new();
        for _ in 0..6 {
            let harness = harness.clone();
            drainers.push(tokio::spawn(async move {
                let queue = harness.router.queue();
                let cancel = CancellationToken::new();
                let mut persisted = 0;
                while queue.depth(partition_id).await.unwrap() > 0 {
                    match queue.drain(partition_id, &cancel).await.unwrap() {
                        DrainOutcome::Drained(report) => persisted += report.persisted,
                        _ => tokio::time::sleep(Duration::from_millis(1)).await,
                    }
                }
                persisted
            }));
        }

        let mut persisted = 0;
        for drainer in drainers {
            persisted += drainer.await.unwrap();
        }
        let metrics = harness.router.metrics();
        assert_eq!(persisted, 60);
        assert_eq!(metrics.writes_persisted.get(), 60);
        assert_eq!(metrics.active_drains.peak(), 1);
        assert_eq!(metrics.active_drains.get(), 0);
        for id in ids {
            assert_eq!(
                harness.router.get_request_status(id).await.unwrap().status,
                RequestStatus::Completed
            );
        }
    }

    #[tokio::test]
    async fn test_repeated_writes_keep_submission_order() {
        let harness = unbatched(2);
        for i in 1..=10 {
            harness
                .router
                .submit_write(42, format!("v{}", i).into_bytes())
                .await
                .unwrap();
        }
        assert_eq!(harness.flush().await, 10);
        assert_eq!(harness.router.read_by_key(42).await.unwrap().payload, &b"v10"[..]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_the_write() {
        let harness = unbatched(2);
        harness.write_and_flush(1, "ok").await;
        let partition = harness.router.map().lookup(1).await.unwrap().unwrap();

        harness.store.fail_next_inserts(&partition.primary.node, 3);
        let id = harness.router.submit_write(2, &b"doomed"[..]).await.unwrap();
        assert_eq!(harness.flush().await, 0);

        let snapshot = harness.router.get_request_status(id).await.unwrap();
        let error = snapshot.status.error().unwrap().to_string();
        assert!(error.contains("3 attempts"), "unexpected error: {}", error);

        let dead = harness.router.queue().dead_letters(partition.id).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].entry.request_id, id);
        assert_eq!(harness.router.queue().depth(partition.id).await.unwrap(), 0);
        assert_eq!(harness.router.metrics().dead_letters.get(), 1);
        assert!(matches!(
            harness.router.read_by_key(2).await,
            Err(Error::RecordNotFound(2))
        ));

        // The next write to the partition is unaffected.
        harness.write_and_flush(3, "fine").await;
        assert_eq!(harness.router.read_by_key(3).await.unwrap().payload, &b"fine"[..]);
    }

    #[tokio::test]
    async fn test_background_drains_complete_every_request() {
        let harness = TestHarness::new(2);
        let mut ids = Vec::new();
        for key in 0..12u64 {
            ids.push(harness.router.submit_write(key, &b"x"[..]).await.unwrap());
            harness.router.wait_idle().await;
        }

        // Batches of 4: three drains ran without an explicit flush.
        assert_eq!(harness.router.metrics().writes_persisted.get(), 12);
        assert_eq!(harness.router.metrics().drains_started.get(), 3);
        for id in ids {
            assert_eq!(
                harness.router.get_request_status(id).await.unwrap().status,
                RequestStatus::Completed
            );
        }
    }

    #[tokio::test]
    async fn test_request_status_expires() {
        let harness = TestHarness::with_config(
            TestHarness::config(2).with_request_status_ttl(Duration::from_millis(50)),
        );
        let id = harness.write_and_flush(9, "x").await;
        assert_eq!(
            harness.router.get_request_status(id).await.unwrap().status,
            RequestStatus::Completed
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(matches!(
            harness.router.get_request_status(id).await,
            Err(Error::RequestNotFound(found)) if found == id
        ));
        // The record itself outlives its status.
        assert_eq!(harness.router.read_by_key(9).await.unwrap().key, 9);
    }
}
