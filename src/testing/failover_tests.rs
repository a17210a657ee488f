//! Failover through the router: a dead primary is replaced on the next
//! write, no queued write is lost when the primary dies mid-batch, and the
//! old primary is repaired once it returns.

#[cfg(test)]
mod tests {
    use crate::config::BatchConfig;
    use crate::error::Error;
    use crate::failover::FailoverState;
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

    #[tokio::test]
    async fn test_next_write_promotes_replica() {
        let harness = unbatched(2);
        harness.write_and_flush(7, "first").await;
        let before = harness.router.map().lookup(7).await.unwrap().unwrap();
        let (a, b) = (before.primary.clone(), before.replicas[0].clone());

        harness.kill_node(&a.node);
        let id = harness.write_and_flush(7, "second").await;
        assert_eq!(
            harness.router.get_request_status(id).await.unwrap().status,
            RequestStatus::Completed
        );

        let after = harness.router.map().get(before.id).await.unwrap();
        assert_eq!(after.primary, b);
        assert_eq!(after.replicas, vec![a.clone()]);
        assert!(after.is_lagging(&a));
        assert!(after.last_failover_at_ms.is_some());
        assert_eq!(
            harness.router.failover().state(before.id),
            FailoverState::HealthyPrimary
        );
        assert_eq!(
            harness.router.failover().current_write_target(before.id).await.unwrap(),
            b
        );
        assert_eq!(harness.router.read_by_key(7).await.unwrap().payload, &b"second"[..]);
        assert_eq!(harness.router.metrics().promotions.get(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_write_lost_when_primary_dies_mid_batch() {
        let harness = Arc::new(unbatched(2));
        harness.write_and_flush(0, "seed").await;
        let partition = harness.router.map().lookup(0).await.unwrap().unwrap();
        let primary = partition.primary.clone();
        harness
            .store
            .set_latency(&primary.node, Some(Duration::from_millis(5)));

        let mut ids = Vec::new();
        for key in 1..=20u64 {
            ids.push(
                harness
                    .router
                    .submit_write(key, format!("v{}", key).into_bytes())
                    .await
                    .unwrap(),
            );
        }

        let flusher = {
            let harness = harness.clone();
            tokio::spawn(async move { harness.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(25)).await;
        harness.kill_node(&primary.node);
        assert_eq!(flusher.await.unwrap(), 20);

        for id in ids {
            assert_eq!(
                harness.router.get_request_status(id).await.unwrap().status,
                RequestStatus::Completed
            );
        }
        let after = harness.router.map().get(partition.id).await.unwrap();
        assert_ne!(after.primary, primary);
        for key in 1..=20u64 {
            let record = harness.router.read_by_key(key).await.unwrap();
            assert_eq!(record.payload, format!("v{}", key).into_bytes());
        }
        assert_eq!(harness.store.keys_at(&after.primary).len(), 21);
    }

    #[tokio::test]
    async fn test_old_primary_is_repaired_after_rejoin() {
        let harness = unbatched(2);
        for key in 0..5u64 {
            harness.router.submit_write(key, &b"old"[..]).await.unwrap();
        }
        harness.flush().await;
        let before = harness.router.map().lookup(0).await.unwrap().unwrap();
        let old_primary = before.primary.clone();

        harness.kill_node(&old_primary.node);
        for key in 5..10u64 {
            harness.router.submit_write(key, &b"new"[..]).await.unwrap();
        }
        harness.flush().await;

        harness.revive_node(&old_primary.node);
        let cancel = CancellationToken::new();
        let report = harness.monitor.run_once(&cancel).await.unwrap();
        assert_eq!(report.repairs, 1);

        let after = harness.router.map().get(before.id).await.unwrap();
        assert!(!after.is_lagging(&old_primary));
        assert_eq!(
            harness.store.keys_at(&old_primary),
            harness.store.keys_at(&after.primary)
        );
        assert_eq!(harness.store.keys_at(&old_primary).len(), 10);
    }

    #[tokio::test]
    async fn test_every_copy_down_is_surfaced() {
        let harness = unbatched(2);
        harness.write_and_flush(1, "x").await;
        harness.kill_node(&TestHarness::node(0));
        harness.kill_node(&TestHarness::node(1));

        assert!(matches!(
            harness.router.read_by_key(1).await,
            Err(Error::AllReplicasUnavailable { .. })
        ));

        // Queued writes wait for the partition to come back.
        let id = harness.router.submit_write(1, &b"y"[..]).await.unwrap();
        assert!(harness.router.flush().await.is_err());
        assert_eq!(
            harness.router.get_request_status(id).await.unwrap().status,
            RequestStatus::Pending
        );

        harness.revive_node(&TestHarness::node(0));
        harness.revive_node(&TestHarness::node(1));
        harness.flush().await;
        assert_eq!(
            harness.router.get_request_status(id).await.unwrap().status,
            RequestStatus::Completed
        );
        assert_eq!(harness.router.read_by_key(1).await.unwrap().payload, &b"y"[..]);
    }
}
