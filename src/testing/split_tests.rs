//! Splits driven through the router: the worked example with a batch size
//! of one, record conservation, writes racing a split, and a split resumed
//! by the monitor after it was interrupted.

#[cfg(test)]
mod tests {
    use crate::batch::DrainOutcome;
    use crate::config::{BatchConfig, SplitConfig};
    use crate::error::Error;
    use crate::partition::{KeyRange, PartitionStatus};
    use crate::split::{RecoveryAction, SplitOutcome};
    use crate::status::RequestStatus;
    use crate::store::PartitionStore;
    use crate::testing::{wait_for, TestHarness};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn unbatched(max_shard_size: u64) -> TestHarness {
        TestHarness::with_config(
            TestHarness::config(2)
                .with_batch_config(BatchConfig::new(1_000).with_retries(3, Duration::from_millis(1)))
                .with_max_shard_size(max_shard_size),
        )
    }

    #[tokio::test]
    async fn test_split_after_third_write() {
        let harness = TestHarness::with_config(
            TestHarness::config(2)
                .with_default_span(1_000_001)
                .with_batch_size(1)
                .with_max_shard_size(3),
        );
        let original = harness.router.map().resolve(0).await.unwrap();
        assert_eq!(original.range, KeyRange::new(0, 1_000_000));

        for key in [10u64, 20, 30] {
            harness.router.submit_write(key, &b"v"[..]).await.unwrap();
            harness.router.wait_idle().await;
        }

        let parent = harness.router.map().get(original.id).await.unwrap();
        assert_eq!(parent.range, KeyRange::new(0, 20));
        assert!(parent.is_active());
        let child = harness.router.map().lookup(21).await.unwrap().unwrap();
        assert_ne!(child.id, original.id);
        assert_eq!(child.range, KeyRange::new(21, 1_000_000));
        assert!(child.is_active());
        assert_eq!(harness.router.metrics().splits_committed.get(), 1);

        let id = harness.router.submit_write(40, &b"v"[..]).await.unwrap();
        harness.router.wait_idle().await;
        assert_eq!(
            harness.router.get_request_status(id).await.unwrap().status,
            RequestStatus::Completed
        );
        assert_eq!(harness.router.map().lookup(40).await.unwrap().unwrap().id, child.id);
        assert_eq!(harness.store.keys_at(&child.primary), vec![30, 40]);
        assert_eq!(harness.store.keys_at(&parent.primary), vec![10, 20]);
        for key in [10u64, 20, 30, 40] {
            assert_eq!(harness.router.read_by_key(key).await.unwrap().key, key);
        }
    }

    #[tokio::test]
    async fn test_split_preserves_every_record() {
        let harness = unbatched(100);
        let keys: Vec<u64> = (0..150u64).map(|i| i * 7).collect();
        for key in &keys {
            harness
                .router
                .submit_write(*key, format!("k{}", key).into_bytes())
                .await
                .unwrap();
        }
        assert_eq!(harness.flush().await, 150);
        let before = harness.router.map().lookup(0).await.unwrap().unwrap();

        let cancel = CancellationToken::new();
        let outcome = harness
            .router
            .splitter()
            .check_and_split(before.id, &cancel)
            .await
            .unwrap();
        let SplitOutcome::Split(report) = outcome else {
            panic!("expected a split, got {:?}", outcome);
        };
        assert_eq!(report.pivot, keys[74]);
        assert_eq!(report.parent_count, 75);
        assert_eq!(report.child_count, 75);
        assert_eq!(report.migrated, 75);

        let parent = harness.router.map().get(report.parent).await.unwrap();
        let child = harness.router.map().get(report.child).await.unwrap();
        assert_eq!(parent.record_count, 75);
        assert_eq!(child.record_count, 75);
        assert!(!parent.range.overlaps(&child.range));
        for replica in &parent.replicas {
            assert!(harness.store.keys_at(replica).iter().all(|k| *k <= report.pivot));
        }
        for replica in &child.replicas {
            assert_eq!(harness.store.keys_at(replica), harness.store.keys_at(&child.primary));
        }

        for key in &keys {
            let owner = harness.router.map().lookup(*key).await.unwrap().unwrap();
            let expected = if *key <= report.pivot { parent.id } else { child.id };
            assert_eq!(owner.id, expected);
            let record = harness.router.read_by_key(*key).await.unwrap();
            assert_eq!(record.payload, format!("k{}", key).into_bytes());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writes_during_split_are_not_lost() {
        let harness = Arc::new(TestHarness::with_config(
            TestHarness::config(2)
                .with_batch_config(BatchConfig::new(1_000).with_retries(3, Duration::from_millis(1)))
                .with_split_config(SplitConfig::new(50).with_chunk_size(5)),
        ));
        let mut latest: HashMap<u64, String> = HashMap::new();
        for key in 0..60u64 {
            let payload = format!("p{}", key);
            harness.router.submit_write(key, payload.clone().into_bytes()).await.unwrap();
            latest.insert(key, payload);
        }
        harness.flush().await;
        let partition = harness.router.map().lookup(0).await.unwrap().unwrap();
        for node in 0..2 {
            harness
                .store
                .set_latency(&TestHarness::node(node), Some(Duration::from_millis(1)));
        }

        let splitter = {
            let harness = harness.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                harness
                    .router
                    .splitter()
                    .check_and_split(partition.id, &cancel)
                    .await
            })
        };

        let mut ids = Vec::new();
        for i in 0..40u64 {
            let key = (i * 37) % 120;
            let payload = format!("w{}", i);
            ids.push(
                harness
                    .router
                    .submit_write(key, payload.clone().into_bytes())
                    .await
                    .unwrap(),
            );
            latest.insert(key, payload);
            if i % 5 == 4 {
                harness.flush().await;
            }
        }
        let split = splitter.await.unwrap();
        assert!(split.is_ok(), "split failed: {:?}", split);
        harness.flush().await;

        let cancel = CancellationToken::new();
        harness.monitor.run_once(&cancel).await.unwrap();
        let partitions = harness.live_partitions().await;
        assert!(partitions.len() >= 2);
        assert!(partitions.iter().all(|p| p.status == PartitionStatus::Active));

        for id in ids {
            assert_eq!(
                harness.router.get_request_status(id).await.unwrap().status,
                RequestStatus::Completed
            );
        }
        for (key, payload) in &latest {
            let record = harness.router.read_by_key(*key).await.unwrap();
            assert_eq!(record.payload, payload.clone().into_bytes(), "key {}", key);
        }
    }

    #[tokio::test]
    async fn test_monitor_resumes_interrupted_split() {
        let harness = unbatched(15);
        for key in 1..=20u64 {
            harness.router.submit_write(key, &b"v"[..]).await.unwrap();
        }
        harness.flush().await;
        let parent = harness.router.map().lookup(1).await.unwrap().unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            harness
                .router
                .splitter()
                .check_and_split(parent.id, &cancelled)
                .await,
            Err(Error::Cancelled)
        ));
        let splitting = harness.router.map().get(parent.id).await.unwrap();
        let (child_id, pivot) = splitting.split_plan().unwrap();
        assert_eq!(pivot, 10);

        // Both halves stay readable while the move is unfinished.
        for key in 1..=20u64 {
            assert_eq!(harness.router.read_by_key(key).await.unwrap().key, key);
        }

        let report = harness.monitor.run_once(&CancellationToken::new()).await.unwrap();
        assert!(matches!(report.recovery.as_slice(), [RecoveryAction::Resumed(_)]));
        let parent = harness.router.map().get(parent.id).await.unwrap();
        let child = harness.router.map().get(child_id).await.unwrap();
        assert_eq!(parent.range.end, 10);
        assert!(parent.is_active() && child.is_active());
        assert_eq!(
            harness.store.count(&parent.primary).await.unwrap()
                + harness.store.count(&child.primary).await.unwrap(),
            20
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_split_outliving_lease_ttl_keeps_drains_out() {
        let harness = Arc::new(TestHarness::with_config(
            TestHarness::config(2)
                .with_batch_config(BatchConfig::new(1_000).with_retries(3, Duration::from_millis(1)))
                .with_split_config(SplitConfig {
                    lease_ttl: Duration::from_millis(40),
                    ..SplitConfig::new(40).with_chunk_size(1)
                }),
        ));
        for key in 0..40u64 {
            harness.router.submit_write(key, &b"v"[..]).await.unwrap();
        }
        harness.flush().await;
        let parent_id = harness.router.map().lookup(0).await.unwrap().unwrap().id;
        for node in 0..2 {
            harness
                .store
                .set_latency(&TestHarness::node(node), Some(Duration::from_millis(3)));
        }

        let split = {
            let harness = harness.clone();
            tokio::spawn(async move {
                harness
                    .router
                    .splitter()
                    .check_and_split(parent_id, &CancellationToken::new())
                    .await
            })
        };
        let splitting = wait_for(
            || {
                let harness = harness.clone();
                async move {
                    harness
                        .router
                        .map()
                        .get(parent_id)
                        .await
                        .is_ok_and(|p| p.status == PartitionStatus::Splitting)
                }
            },
            Duration::from_secs(2),
        )
        .await;
        assert!(splitting);

        // Well past one ttl into the migration.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let id = harness.router.submit_write(1, &b"late"[..]).await.unwrap();
        let still_running = !split.is_finished();
        let outcome = harness
            .router
            .queue()
            .drain(parent_id, &CancellationToken::new())
            .await
            .unwrap();
        assert!(still_running, "split finished before the drain could overlap it");
        assert!(matches!(outcome, DrainOutcome::Contended), "{:?}", outcome);

        let report = split.await.unwrap().unwrap();
        assert!(matches!(report, SplitOutcome::Split(_)), "{:?}", report);
        harness.flush().await;
        assert_eq!(
            harness.router.get_request_status(id).await.unwrap().status,
            RequestStatus::Completed
        );
        assert_eq!(harness.router.read_by_key(1).await.unwrap().payload, b"late".to_vec());
    }
}
