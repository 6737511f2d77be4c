//! End-to-end synchronization between a legacy side and a WebExtension side controller.

use n0_future::time::{self, Duration};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use storage_migration::{
    SettingsMigration, SyncConfig, SyncController,
    config::RetryConfig,
    connection::memory::{MemoryConnection, pair},
    error::StorageError,
    settings_migration::OBSOLETE_KEYS,
    storage::{
        LAST_STORAGE_CHANGE_KEY, MemoryStorage, StampedStorage, StorageArea, StorageSnapshot,
    },
    test_utils::{NEWER_STAMP, OLDER_STAMP, RecordingStorage, wait_until},
};
use tracing_test::traced_test;

fn test_config(config: SyncConfig) -> SyncConfig {
    config
        .with_request_timeout(Duration::from_secs(1))
        .with_startup_retry_interval(Duration::from_millis(50))
        .with_retry(RetryConfig {
            max_attempts: 2,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        })
}

fn snapshot(value: Value) -> StorageSnapshot {
    serde_json::from_value(value).unwrap()
}

struct Sides {
    legacy: SyncController,
    legacy_storage: MemoryStorage,
    webext: SyncController,
    webext_storage: RecordingStorage<MemoryStorage>,
    link: MemoryConnection,
}

impl Sides {
    /// Spawns both controllers, the legacy one first if `legacy_first`.
    async fn spawn(legacy: Value, webext: Value, legacy_first: bool) -> Self {
        let (legacy_end, webext_end) = pair();
        let link = legacy_end.clone();
        let legacy_storage = MemoryStorage::new(snapshot(legacy));
        let webext_storage = RecordingStorage::new(MemoryStorage::new(snapshot(webext)));

        let spawn_legacy = || {
            SyncController::spawn_connected(
                test_config(SyncConfig::legacy_side()),
                legacy_storage.clone(),
                legacy_end.clone(),
            )
        };
        let spawn_webext = || {
            SyncController::spawn_connected(
                test_config(SyncConfig::webext_side()),
                webext_storage.clone(),
                webext_end.clone(),
            )
        };
        let (legacy, webext) = if legacy_first {
            let legacy = spawn_legacy();
            legacy.waiting_for_peer().wait().await.unwrap();
            (legacy, spawn_webext())
        } else {
            let webext = spawn_webext();
            webext.waiting_for_peer().wait().await.unwrap();
            (spawn_legacy(), webext)
        };
        Self {
            legacy,
            legacy_storage,
            webext,
            webext_storage,
            link,
        }
    }

    async fn synced(self) -> Self {
        for controller in [&self.legacy, &self.webext] {
            controller.storage_ready_for_access().wait().await.unwrap();
            controller.started().wait().await.unwrap();
        }
        self
    }

    fn webext_snapshot(&self) -> StorageSnapshot {
        self.webext_storage.inner().snapshot()
    }

    /// Waits until both sides hold the same contents.
    async fn converged(&self) {
        wait_until("both sides hold the same storage", || {
            self.legacy_storage.snapshot() == self.webext_snapshot()
        })
        .await;
    }
}

#[tokio::test]
#[traced_test]
async fn legacy_first_pulls_newer_webext_storage() {
    let webext = json!({"a": 2, "b": 3, LAST_STORAGE_CHANGE_KEY: NEWER_STAMP});
    let sides = Sides::spawn(
        json!({"a": 1, "stale": true, LAST_STORAGE_CHANGE_KEY: OLDER_STAMP}),
        webext.clone(),
        true,
    )
    .await
    .synced()
    .await;

    assert_eq!(sides.legacy_storage.snapshot(), snapshot(webext.clone()));
    assert_eq!(sides.webext_snapshot(), snapshot(webext));
    assert!(sides.webext_storage.sets().is_empty());
    assert!(!sides.legacy.should_send_full_storage());
    assert!(!sides.webext.should_send_full_storage());
}

#[tokio::test]
#[traced_test]
async fn webext_first_receives_legacy_storage() {
    let legacy = json!({
        "a": 1,
        "policy": {"allow": ["x"]},
        LAST_STORAGE_CHANGE_KEY: NEWER_STAMP,
    });
    let sides = Sides::spawn(
        legacy.clone(),
        json!({"a": 0, "left-over": 1, LAST_STORAGE_CHANGE_KEY: OLDER_STAMP}),
        false,
    )
    .await
    .synced()
    .await;

    assert_eq!(sides.webext_snapshot(), snapshot(legacy.clone()));
    assert_eq!(sides.legacy_storage.snapshot(), snapshot(legacy));
    assert_eq!(
        sides.webext_storage.removes(),
        vec![vec!["left-over".to_string()]]
    );
}

#[tokio::test]
#[traced_test]
async fn fresh_webext_is_overwritten() {
    let legacy = json!({"a": 1});
    let sides = Sides::spawn(legacy.clone(), json!({"b": 2}), true)
        .await
        .synced()
        .await;
    assert_eq!(sides.webext_snapshot(), snapshot(legacy));
}

#[tokio::test]
#[traced_test]
async fn startup_order_does_not_matter() {
    let stamped = |key: &str, stamp: &str| json!({ key: 1, LAST_STORAGE_CHANGE_KEY: stamp });
    let cases = [
        (stamped("a", OLDER_STAMP), stamped("b", NEWER_STAMP)),
        (stamped("a", NEWER_STAMP), stamped("b", OLDER_STAMP)),
        (stamped("a", NEWER_STAMP), stamped("b", NEWER_STAMP)),
        (json!({"a": 1}), stamped("b", OLDER_STAMP)),
        (json!({"a": 1}), json!({"b": 1})),
    ];
    for (legacy, webext) in cases {
        let mut outcomes = Vec::new();
        for legacy_first in [true, false] {
            let sides = Sides::spawn(legacy.clone(), webext.clone(), legacy_first)
                .await
                .synced()
                .await;
            assert_eq!(sides.legacy_storage.snapshot(), sides.webext_snapshot());
            outcomes.push(sides.webext_snapshot());
        }
        assert_eq!(outcomes[0], outcomes[1], "{legacy} / {webext}");
    }
}

#[tokio::test]
#[traced_test]
async fn changes_flow_both_ways() {
    let sides = Sides::spawn(json!({"a": 1}), json!({}), true)
        .await
        .synced()
        .await;
    let legacy = StampedStorage::new(sides.legacy_storage.clone());
    let webext = StampedStorage::new(sides.webext_storage.clone());

    legacy.set(snapshot(json!({"x": 1}))).await.unwrap();
    wait_until("x reaches the webext side", || {
        sides.webext_snapshot().contains_key("x")
    })
    .await;
    sides.converged().await;

    webext.set(snapshot(json!({"y": [1, 2]}))).await.unwrap();
    wait_until("y reaches the legacy side", || {
        sides.legacy_storage.snapshot().contains_key("y")
    })
    .await;
    sides.converged().await;

    legacy.remove(vec!["a".into()]).await.unwrap();
    wait_until("a is removed on the webext side", || {
        !sides.webext_snapshot().contains_key("a")
    })
    .await;
    sides.converged().await;

    // applied remote changes are not relayed back
    let calls = sides.webext_storage.calls().len();
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sides.webext_storage.calls().len(), calls);
    assert!(!sides.legacy.should_send_full_storage());
    assert!(!sides.webext.should_send_full_storage());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn concurrent_changes_converge() {
    let sides = Sides::spawn(json!({}), json!({}), false)
        .await
        .synced()
        .await;
    let legacy = sides.legacy_storage.clone();
    let webext = sides.webext_storage.clone();

    let (a, b) = tokio::join!(
        async {
            for i in 0..10 {
                legacy
                    .set(snapshot(json!({ format!("legacy-{i}"): i })))
                    .await?;
            }
            Ok::<_, StorageError>(())
        },
        async {
            for i in 0..10 {
                webext
                    .set(snapshot(json!({ format!("webext-{i}"): i })))
                    .await?;
            }
            Ok::<_, StorageError>(())
        },
    );
    a.unwrap();
    b.unwrap();

    wait_until("all keys reach both sides", || {
        sides.legacy_storage.snapshot().len() == 20 && sides.webext_snapshot().len() == 20
    })
    .await;
    sides.converged().await;
}

#[tokio::test]
#[traced_test]
async fn disconnect_recovers_with_full_storage() {
    let sides = Sides::spawn(json!({"a": 1}), json!({}), true)
        .await
        .synced()
        .await;

    sides.link.disconnect();
    sides
        .legacy_storage
        .set(snapshot(json!({"x": 1})))
        .await
        .unwrap();
    wait_until("the failed change is noticed", || {
        sides.legacy.should_send_full_storage()
    })
    .await;
    assert!(!sides.webext_snapshot().contains_key("x"));

    sides.link.reconnect();
    sides
        .legacy_storage
        .set(snapshot(json!({"y": 2})))
        .await
        .unwrap();
    sides.converged().await;
    assert_eq!(
        sides.webext_snapshot(),
        snapshot(json!({"a": 1, "x": 1, "y": 2}))
    );
    wait_until("the full storage was acknowledged", || {
        !sides.legacy.should_send_full_storage()
    })
    .await;
}

#[tokio::test]
#[traced_test]
async fn settings_migration_after_initial_sync() {
    let mut legacy = json!({
        "defaultPolicy.allow": false,
        LAST_STORAGE_CHANGE_KEY: NEWER_STAMP,
    });
    for key in OBSOLETE_KEYS {
        legacy[*key] = json!(true);
    }
    let sides = Sides::spawn(legacy, json!({}), false).await;

    let migration = SettingsMigration::new(StampedStorage::new(sides.webext_storage.clone()))
        .after(&sides.webext);
    migration.run().await.unwrap();

    wait_until("obsolete keys are gone on both sides", || {
        let legacy = sides.legacy_storage.snapshot();
        OBSOLETE_KEYS.iter().all(|key| !legacy.contains_key(*key))
    })
    .await;
    sides.converged().await;
    assert_eq!(
        sides.webext_snapshot()["defaultPolicy.allow"],
        json!(false)
    );
}
