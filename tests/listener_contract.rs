//! Listener contract tests
//!
//! Drives a ListenerSet with an IdentityView attached the way an IP cache
//! would, through the public API only.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lattice_netcore::ipcache::{
    CacheListener, ChangeEvent, Identity, IdentityView, ListenerSet, ModificationKind, Prefix,
};
use lattice_netcore::Error;
use parking_lot::RwLock;

fn prefix(s: &str) -> Prefix {
    s.parse().unwrap()
}

fn id(n: u32) -> Identity {
    Identity::new(n)
}

fn setup() -> (ListenerSet, Arc<IdentityView>, Arc<RwLock<HashMap<Prefix, Identity>>>) {
    let source = Arc::new(RwLock::new(HashMap::new()));
    let view = Arc::new(IdentityView::new(source.clone()));
    let set = ListenerSet::new();
    set.add(view.clone());
    (set, view, source)
}

#[test]
fn replayed_upsert_update_delete_leaves_no_mapping() {
    let (set, view, _) = setup();
    let a = prefix("10.0.0.0/24");

    set.notify(&ChangeEvent::upsert(a, None, id(5)).unwrap())
        .unwrap();
    set.notify(&ChangeEvent::upsert(a, Some(id(5)), id(9)).unwrap())
        .unwrap();
    set.notify(&ChangeEvent::delete(a, id(9)).unwrap()).unwrap();

    assert_eq!(view.get(&a), None);
    assert_eq!(set.delivered_identity(&a), None);
}

#[test]
fn delete_old_id_always_equals_last_delivered_new_id() {
    #[derive(Default)]
    struct Checker {
        last: RwLock<HashMap<Prefix, Identity>>,
        violations: RwLock<Vec<String>>,
    }

    impl CacheListener for Checker {
        fn on_change(&self, event: &ChangeEvent) {
            let mut last = self.last.write();
            match event.kind() {
                ModificationKind::Upsert => {
                    if event.new_id().is_none() {
                        self.violations.write().push(format!("{} without new id", event));
                    }
                    last.insert(event.cidr(), event.new_id().unwrap_or(Identity::UNKNOWN));
                }
                ModificationKind::Delete => {
                    if last.remove(&event.cidr()) != event.old_id() {
                        self.violations.write().push(event.to_string());
                    }
                }
            }
        }

        fn on_full_sync(&self) {}
    }

    let set = ListenerSet::new();
    let checker = Arc::new(Checker::default());
    set.add(checker.clone());

    let a = prefix("10.0.0.1");
    let b = prefix("fd00::/64");
    let attempts = [
        ChangeEvent::upsert(a, None, id(5)),
        ChangeEvent::upsert(b, None, id(6)),
        ChangeEvent::delete(a, id(6)),
        ChangeEvent::upsert(a, Some(id(5)), id(7)),
        ChangeEvent::delete(b, id(6)),
        ChangeEvent::delete(a, id(5)),
        ChangeEvent::delete(a, id(7)),
    ];

    let mut rejected = 0;
    for attempt in attempts {
        if let Err(Error::InvalidEvent { .. }) = set.notify(&attempt.unwrap()) {
            rejected += 1;
        }
    }

    assert_eq!(rejected, 2);
    assert!(checker.violations.read().is_empty());
    assert!(checker.last.read().is_empty());
}

#[test]
fn full_sync_without_prior_changes_leaves_empty_view() {
    let (set, view, source) = setup();
    source.write().insert(prefix("10.0.0.1"), id(5));

    set.notify_full_sync();

    assert!(view.is_empty());
}

#[test]
fn full_sync_discards_what_the_cache_no_longer_confirms() {
    let (set, view, source) = setup();
    let a = prefix("10.0.0.1");
    let b = prefix("10.0.0.2");

    set.notify(&ChangeEvent::upsert(a, None, id(5)).unwrap())
        .unwrap();
    set.notify(&ChangeEvent::upsert(b, None, id(6)).unwrap())
        .unwrap();
    // The cache lost b while the listener was disconnected
    source.write().insert(a, id(5));

    set.notify_full_sync();

    assert_eq!(view.get(&a), Some(id(5)));
    assert_eq!(view.get(&b), None);
}

#[test]
fn concurrent_notifiers_keep_per_prefix_order() {
    let (set, view, _) = setup();
    let set = Arc::new(set);

    let handles: Vec<_> = (0..8u32)
        .map(|i| {
            let set = set.clone();
            thread::spawn(move || {
                let p = prefix(&format!("10.1.{}.0/24", i));
                let mut current = None;
                for n in 1..=50u32 {
                    let next = id(i * 1000 + n);
                    set.notify(&ChangeEvent::upsert(p, current, next).unwrap())
                        .unwrap();
                    current = Some(next);
                }
                set.notify(&ChangeEvent::delete(p, current.unwrap()).unwrap())
                    .unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(view.is_empty());
}

#[test]
fn full_sync_runs_while_producer_holds_the_cache_lock() {
    let (set, view, source) = setup();
    let set = Arc::new(set);
    let seeded = prefix("10.0.0.1");
    {
        let mut cache = source.write();
        cache.insert(seeded, id(1));
        set.notify(&ChangeEvent::upsert(seeded, None, id(1)).unwrap())
            .unwrap();
    }

    let (done_tx, done_rx) = mpsc::channel();

    // The cache notifies listeners while holding its own write lock
    let producer = {
        let set = set.clone();
        let source = source.clone();
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            for n in 0..200u32 {
                let p = prefix(&format!("10.2.{}.{}", n / 256, n % 256));
                let mut cache = source.write();
                cache.insert(p, id(100 + n));
                set.notify(&ChangeEvent::upsert(p, None, id(100 + n)).unwrap())
                    .unwrap();
            }
            let _ = done_tx.send("producer");
        })
    };

    // Reconciliation reads that same lock through the identity source
    let syncer = {
        let set = set.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                set.notify_full_sync();
            }
            let _ = done_tx.send("syncer");
        })
    };

    let mut finished = Vec::new();
    for _ in 0..2 {
        finished.push(
            done_rx
                .recv_timeout(Duration::from_secs(10))
                .expect("full sync and producer should both finish"),
        );
    }
    producer.join().unwrap();
    syncer.join().unwrap();

    finished.sort();
    assert_eq!(finished, vec!["producer", "syncer"]);
    // Everything was confirmed by the cache, so nothing was discarded
    assert_eq!(view.len(), 201);
}
