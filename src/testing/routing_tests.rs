//! Routing properties across concurrent writers: every routed key has exactly
//! one owner, ranges never overlap, and failed creation leaves no state.

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::partition::Partition;
    use crate::testing::TestHarness;
    use rand::Rng;
    use std::collections::HashMap;

    fn assert_disjoint(partitions: &[Partition]) {
        for (i, a) in partitions.iter().enumerate() {
            for b in &partitions[i + 1..] {
                assert!(
                    !a.range.overlaps(&b.range),
                    "{} overlaps {}",
                    a.range,
                    b.range
                );
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_covers_every_key_once() {
        let harness = TestHarness::with_config(TestHarness::config(3).with_default_span(1_000));
        let keys: Vec<u64> = {
            let mut rng = rand::rng();
            (0..400).map(|_| rng.random_range(0..50_000)).collect()
        };

        let mut handles = Vec::new();
        for chunk in keys.chunks(50) {
            let map = harness.router.map().clone();
            let chunk = chunk.to_vec();
            handles.push(tokio::spawn(async move {
                let mut owners = Vec::new();
                for key in chunk {
                    let partition = map.resolve(key).await.unwrap();
                    assert!(partition.range.contains(key));
                    owners.push((key, partition.id));
                }
                owners
            }));
        }

        let mut owners = HashMap::new();
        for handle in handles {
            for (key, id) in handle.await.unwrap() {
                if let Some(previous) = owners.insert(key, id) {
                    assert_eq!(previous, id, "key {} resolved to two partitions", key);
                }
            }
        }

        let partitions = harness.live_partitions().await;
        assert_disjoint(&partitions);
        for key in &keys {
            let covering = partitions.iter().filter(|p| p.range.contains(*key)).count();
            assert_eq!(covering, 1, "key {} covered {} times", key, covering);
        }
        assert_eq!(
            harness.router.metrics().partitions_created.get(),
            partitions.len() as u64
        );
    }

    #[tokio::test]
    async fn test_new_range_stops_before_existing_partition() {
        let harness = TestHarness::with_config(TestHarness::config(2).with_default_span(100));
        let upper = harness.router.map().resolve(150).await.unwrap();
        let lower = harness.router.map().resolve(100).await.unwrap();

        assert_eq!(upper.range.start, 150);
        assert_eq!(lower.range.start, 100);
        assert_eq!(lower.range.end, 149);
        assert_disjoint(&harness.live_partitions().await);
    }

    #[tokio::test]
    async fn test_failed_provisioning_creates_nothing() {
        let harness = TestHarness::new(2);
        harness.store.set_fail_provision(&TestHarness::node(1), true);

        let result = harness.router.submit_write(5, &b"x"[..]).await;
        assert!(matches!(result, Err(Error::Provisioning { .. })));
        assert!(harness.live_partitions().await.is_empty());
        assert_eq!(harness.router.metrics().partitions_created.get(), 0);

        harness.store.set_fail_provision(&TestHarness::node(1), false);
        let id = harness.write_and_flush(5, "x").await;
        assert!(harness.router.get_request_status(id).await.unwrap().status.is_final());
        assert_eq!(harness.live_partitions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_map_outage_fails_fast_and_recovers() {
        let harness = TestHarness::new(2);
        harness.write_and_flush(1, "before").await;

        harness.kv.set_available(false);
        assert!(matches!(
            harness.router.submit_write(2, &b"x"[..]).await,
            Err(Error::MapUnavailable(_))
        ));
        assert!(matches!(
            harness.router.read_by_key(1).await,
            Err(Error::MapUnavailable(_))
        ));

        harness.kv.set_available(true);
        assert_eq!(harness.router.read_by_key(1).await.unwrap().payload, &b"before"[..]);
        harness.write_and_flush(2, "after").await;
        assert_eq!(harness.router.read_by_key(2).await.unwrap().payload, &b"after"[..]);
    }
}
