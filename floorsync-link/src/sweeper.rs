//! Periodic expiry of unanswered mutations.

use std::time::{Duration, Instant};

use floorsync_store::StoreHandle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Drive `prune_expired` every `period` until the returned task is aborted.
///
/// Without this task an overlay whose ack never arrives would only be
/// rolled back on the next store write.
pub fn spawn_expiry_sweep(store: StoreHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = store.prune_expired(Instant::now());
            if expired > 0 {
                log::debug!("Expiry sweep rolled back {expired} mutations");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use floorsync_store::{
        FailureKind, Fields, MutationStatus, ServerVersion, StoreConfig, StoreEvent,
    };
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_sweep_expires_unanswered_mutation() {
        let config = StoreConfig::default().with_timeout(Duration::from_millis(50));
        let store = StoreHandle::new(config);
        store.apply_server_update("E1", fields(json!({"speed": 10})), ServerVersion(1));
        let mut sub = store.subscribe();
        let tx = store.begin_mutation("E1", fields(json!({"speed": 20}))).unwrap();

        let sweep = spawn_expiry_sweep(store.clone(), Duration::from_millis(10));

        let failure = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match sub.recv().await {
                    Some(StoreEvent::MutationFailed(f)) => return f,
                    Some(_) => continue,
                    None => panic!("Subscription closed"),
                }
            }
        })
        .await
        .expect("Sweep should expire the mutation");
        sweep.abort();

        assert_eq!(failure.tx_id, tx);
        assert_eq!(failure.kind, FailureKind::TimedOut);
        assert_eq!(store.mutation_status(tx), Some(MutationStatus::Expired));
        assert_eq!(store.view("E1").unwrap().data["speed"], 10);
    }

    #[tokio::test]
    async fn test_sweep_leaves_fresh_mutations() {
        let store = StoreHandle::new(StoreConfig::default());
        store.apply_server_update("E1", fields(json!({"speed": 10})), ServerVersion(1));
        let tx = store.begin_mutation("E1", fields(json!({"speed": 20}))).unwrap();

        let sweep = spawn_expiry_sweep(store.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(40)).await;
        sweep.abort();

        assert_eq!(store.mutation_status(tx), Some(MutationStatus::Pending));
    }
}
