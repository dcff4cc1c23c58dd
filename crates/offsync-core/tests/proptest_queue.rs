//! Property-based tests for the pending queue.
//!
//! Covers FIFO ordering under arbitrary timestamps, retry accounting that
//! never loses records, idempotent acknowledgement, distinct ids under
//! concurrent enqueue, and the pending-record ceiling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use offsync_core::clock::ManualClock;
use offsync_core::error::StorageError;
use offsync_core::queue::{PendingQueue, QueueConfig};
use offsync_core::store::MemoryRecordStore;

// =============================================================================
// Strategies
// =============================================================================

fn arb_kind() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("activity-event".to_string()),
        Just("widget-create".to_string()),
        "[a-z]{1,8}-[a-z]{1,8}",
    ]
}

/// Millisecond offsets from a fixed base, with plenty of ties.
fn arb_offsets() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..20, 1..40)
}

#[derive(Debug, Clone)]
enum QueueOp {
    Fail(usize),
    Ack(usize),
}

fn arb_ops(records: usize) -> impl Strategy<Value = Vec<QueueOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => (0..records).prop_map(QueueOp::Fail),
            1 => (0..records).prop_map(QueueOp::Ack),
        ],
        0..60,
    )
}

// =============================================================================
// Helpers
// =============================================================================

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn queue_with_clock(config: QueueConfig) -> (PendingQueue<MemoryRecordStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(base()));
    let queue = PendingQueue::with_clock(MemoryRecordStore::new(), config, clock.clone());
    (queue, clock)
}

// =============================================================================
// Ordering
// =============================================================================

proptest! {
    #[test]
    fn get_all_is_ordered_by_time_then_insertion(offsets in arb_offsets(), kind in arb_kind()) {
        runtime().block_on(async {
            let (queue, clock) = queue_with_clock(QueueConfig::default());
            let mut expected = Vec::new();
            for (index, offset) in offsets.iter().enumerate() {
                clock.set(base() + chrono::Duration::milliseconds(*offset));
                let record = queue.enqueue(&kind, json!({ "n": index })).await.unwrap();
                expected.push((*offset, index, record.id));
            }
            expected.sort_by_key(|(offset, index, _)| (*offset, *index));

            let stored = queue.list_unresolved(None).await.unwrap();
            let ids: Vec<String> = stored.iter().map(|r| r.id.clone()).collect();
            let expected_ids: Vec<String> = expected.into_iter().map(|(_, _, id)| id).collect();
            prop_assert_eq!(ids, expected_ids);

            for pair in stored.windows(2) {
                prop_assert!(pair[0].created_at <= pair[1].created_at);
            }
            Ok(())
        })?;
    }

    #[test]
    fn drain_candidates_preserve_queue_order(offsets in arb_offsets()) {
        runtime().block_on(async {
            let (queue, clock) = queue_with_clock(QueueConfig::default());
            for offset in &offsets {
                clock.set(base() + chrono::Duration::milliseconds(*offset));
                queue.enqueue("widget-create", json!({})).await.unwrap();
            }
            let all = queue.list_unresolved(None).await.unwrap();
            let candidates = queue.drain_candidates(None).await.unwrap();
            prop_assert_eq!(all, candidates);
            Ok(())
        })?;
    }
}

// =============================================================================
// Retry accounting
// =============================================================================

proptest! {
    #[test]
    fn failures_only_grow_retries_and_never_drop_records(
        (count, ops) in (1usize..8).prop_flat_map(|n| (Just(n), arb_ops(n)))
    ) {
        runtime().block_on(async {
            let config = QueueConfig { max_retries: 2, max_pending: 100 };
            let (queue, _clock) = queue_with_clock(config);
            let mut ids = Vec::new();
            for n in 0..count {
                ids.push(queue.enqueue("widget-create", json!({ "n": n })).await.unwrap().id);
            }

            let mut model: HashMap<String, u32> = ids.iter().map(|id| (id.clone(), 0)).collect();
            for op in ops {
                match op {
                    QueueOp::Fail(i) => {
                        let updated = queue.mark_failed_attempt(&ids[i]).await.unwrap();
                        match model.get_mut(&ids[i]) {
                            Some(retries) => {
                                *retries += 1;
                                prop_assert_eq!(updated.map(|r| r.retries), Some(*retries));
                            }
                            None => prop_assert!(updated.is_none()),
                        }
                    }
                    QueueOp::Ack(i) => {
                        queue.acknowledge(&ids[i]).await.unwrap();
                        model.remove(&ids[i]);
                    }
                }

                let stored: HashMap<String, u32> = queue
                    .list_unresolved(None)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|r| (r.id, r.retries))
                    .collect();
                prop_assert_eq!(&stored, &model);
            }

            let exhausted: HashSet<String> = queue
                .exhausted(None)
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.id)
                .collect();
            let candidates: HashSet<String> = queue
                .drain_candidates(None)
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.id)
                .collect();
            prop_assert!(exhausted.is_disjoint(&candidates));
            prop_assert_eq!(exhausted.len() + candidates.len(), model.len());
            for id in &exhausted {
                prop_assert!(model[id] > config.max_retries);
            }
            Ok(())
        })?;
    }

    #[test]
    fn acknowledge_is_idempotent(count in 1usize..10, target in 0usize..10, repeats in 1usize..4) {
        runtime().block_on(async {
            let (queue, _clock) = queue_with_clock(QueueConfig::default());
            let mut ids = Vec::new();
            for _ in 0..count {
                ids.push(queue.enqueue("activity-event", json!({})).await.unwrap().id);
            }
            let id = &ids[target % count];
            for _ in 0..repeats {
                queue.acknowledge(id).await.unwrap();
            }
            prop_assert_eq!(queue.pending_count().await.unwrap(), count - 1);
            prop_assert!(queue.list_unresolved(None).await.unwrap().iter().all(|r| &r.id != id));
            Ok(())
        })?;
    }

    #[test]
    fn enqueue_stops_at_max_pending(limit in 1usize..12, extra in 1usize..5) {
        runtime().block_on(async {
            let config = QueueConfig { max_retries: 3, max_pending: limit };
            let (queue, _clock) = queue_with_clock(config);
            let mut accepted = 0;
            let mut rejected = 0;
            for _ in 0..(limit + extra) {
                match queue.enqueue("widget-create", json!({})).await {
                    Ok(_) => accepted += 1,
                    Err(StorageError::QueueFull { limit: l }) => {
                        prop_assert_eq!(l, limit);
                        rejected += 1;
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {other}"),
                }
            }
            prop_assert_eq!(accepted, limit);
            prop_assert_eq!(rejected, extra);
            Ok(())
        })?;
    }
}

// =============================================================================
// Concurrency
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn concurrent_enqueues_get_distinct_records(tasks in 2usize..24) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            // Same instant for everyone, so ids must not depend on the clock alone
            let (queue, _clock) = queue_with_clock(QueueConfig::default());
            let queue = Arc::new(queue);
            let mut handles = Vec::new();
            for n in 0..tasks {
                let queue = Arc::clone(&queue);
                handles.push(tokio::spawn(async move {
                    queue.enqueue("activity-event", json!({ "n": n })).await.unwrap()
                }));
            }
            let mut ids = HashSet::new();
            for handle in handles {
                ids.insert(handle.await.unwrap().id);
            }
            prop_assert_eq!(ids.len(), tasks);
            prop_assert_eq!(queue.pending_count().await.unwrap(), tasks);
            Ok(())
        })?;
    }
}
