//! Integration Tests for the Reactive Core
//!
//! These tests verify that states, computed values, collections and
//! subscriptions work together through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use pulse_core::{
    AddMethod, AddOptions, CollectionConfig, ComponentId, Integration, MemoryStorage, NotifyMode,
    Patch, PrimaryKey, Pulse, PulseConfig, Reactive, ValueType,
};

fn immediate() -> Pulse {
    Pulse::with_config(PulseConfig {
        notify: NotifyMode::Immediate,
        ..PulseConfig::default()
    })
}

#[derive(Default, Clone)]
struct Recorder {
    calls: Arc<Mutex<Vec<(ComponentId, Patch)>>>,
}

impl Integration for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn update_method(&self, component: ComponentId, patch: &Patch) {
        self.calls.lock().push((component, patch.clone()));
    }
}

/// A type-locked state rejects writes of another type.
#[test]
fn type_lock_rejects_mismatched_writes() {
    let pulse = immediate();
    let flag = pulse.state(false);
    flag.lock_type(ValueType::Bool);

    flag.set(true);
    flag.set(123);
    assert_eq!(flag.value(), json!(true));
    assert_eq!(flag.previous_value(), json!(false));
    assert!(flag.try_set("yes").is_err());

    flag.set(false);
    assert_eq!(flag.value(), json!(false));
}

/// A computed value follows its sources without an explicit recompute.
#[test]
fn computed_propagates_writes() {
    let pulse = immediate();
    let a = pulse.state(1);
    let b = pulse.computed({
        let a = a.clone();
        move || a.get::<i64>().unwrap_or(0) + 2
    });

    assert_eq!(b.value(), json!(3));
    a.set(5);
    assert_eq!(b.value(), json!(7));
}

/// A diamond settles with one recompute per cell.
#[test]
fn diamond_dependencies_settle_once() {
    let pulse = immediate();
    let root = pulse.state(1);
    let left = pulse.computed({
        let root = root.clone();
        move || root.get::<i64>().unwrap_or(0) * 2
    });
    let right = pulse.computed({
        let root = root.clone();
        move || root.get::<i64>().unwrap_or(0) * 3
    });

    let runs = Arc::new(AtomicUsize::new(0));
    let sum = pulse.computed({
        let (left, right, runs) = (left.clone(), right.clone(), runs.clone());
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            left.get::<i64>().unwrap_or(0) + right.get::<i64>().unwrap_or(0)
        }
    });

    assert_eq!(sum.value(), json!(5));
    let before = runs.load(Ordering::SeqCst);
    root.set(2);
    assert_eq!(sum.value(), json!(10));
    assert_eq!(runs.load(Ordering::SeqCst) - before, 1);
}

/// Collecting into a group keeps insertion order and never duplicates keys.
#[test]
fn collect_populates_group_in_order() {
    let pulse = immediate();
    let posts = pulse.collection(CollectionConfig::new("posts"));

    posts.collect(json!([{"id": "x"}, {"id": "y"}]), "g");
    let group = posts.get_group("g").unwrap();
    assert_eq!(group.output().len(), 2);
    assert_eq!(group.index(), vec![PrimaryKey::from("x"), PrimaryKey::from("y")]);

    posts.collect(json!({"id": "x"}), "g");
    assert_eq!(group.index(), vec![PrimaryKey::from("x"), PrimaryKey::from("y")]);
    assert_eq!(group.output().len(), 2);
}

/// A placeholder handed out before the data arrives is the entity itself.
#[test]
fn provisional_entity_keeps_identity() {
    let pulse = immediate();
    let posts = pulse.collection(CollectionConfig::new("posts"));

    let d1 = posts.get_data("z").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    d1.watch("log", {
        let seen = seen.clone();
        move |value| seen.lock().push(value.clone())
    });

    posts.collect(json!({"id": "z", "val": 1}), ());

    let d2 = posts.get_data("z").unwrap();
    assert_eq!(d1, d2);
    assert_eq!(d1.value()["val"], json!(1));
    assert_eq!(*seen.lock(), vec![json!({"id": "z", "val": 1})]);
}

/// Three writes within one synchronous call reach a component once.
#[test]
fn notifications_are_coalesced() {
    let recorder = Recorder::default();
    let pulse = Pulse::builder().integration(recorder.clone()).build();

    let a = pulse.state(0);
    let b = pulse.state(0);
    let c = pulse.state(0);
    pulse.subscribe_props(ComponentId(1), &[("a", &a), ("b", &b), ("c", &c)]);

    a.set(1);
    b.set(2);
    c.set(3);
    assert!(pulse.has_pending_updates());
    assert!(recorder.calls.lock().is_empty());

    assert_eq!(pulse.flush_updates(), 1);
    let calls = recorder.calls.lock();
    assert_eq!(calls.len(), 1);
    let (component, patch) = &calls[0];
    assert_eq!(*component, ComponentId(1));
    assert_eq!(patch["a"], json!(1));
    assert_eq!(patch["b"], json!(2));
    assert_eq!(patch["c"], json!(3));
}

/// A batch in immediate mode also produces one delivery.
#[test]
fn batch_produces_one_delivery() {
    let recorder = Recorder::default();
    let pulse = Pulse::builder()
        .config(PulseConfig {
            notify: NotifyMode::Immediate,
            ..PulseConfig::default()
        })
        .integration(recorder.clone())
        .build();

    let a = pulse.state(0);
    let b = pulse.state(0);
    pulse.subscribe_props(ComponentId(1), &[("a", &a), ("b", &b)]);

    pulse.batch(|| {
        a.set(1);
        b.set(1);
        a.set(2);
    });

    let calls = recorder.calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["a"], json!(2));
    assert_eq!(calls[0].1["b"], json!(1));
}

/// The feed walk-through: create, collect twice, remove.
#[test]
fn feed_end_to_end() {
    let pulse = immediate();
    let posts = pulse.collection(CollectionConfig::new("posts"));

    let g = posts.create_group("feed", ());
    posts.collect(json!({"id": 1, "title": "a"}), "feed");
    posts.collect(json!({"id": 2, "title": "b"}), "feed");
    g.remove(1);

    assert_eq!(g.output(), vec![json!({"id": 2, "title": "b"})]);
    assert_eq!(g.index(), vec![PrimaryKey::Int(2)]);
}

/// Group subscribers receive the rendered output, not the raw index.
#[test]
fn group_subscribers_receive_output() {
    let recorder = Recorder::default();
    let pulse = Pulse::builder()
        .config(PulseConfig {
            notify: NotifyMode::Immediate,
            ..PulseConfig::default()
        })
        .integration(recorder.clone())
        .build();

    let posts = pulse.collection(CollectionConfig::new("posts"));
    let feed = posts.create_group("feed", ());
    pulse.subscribe_props(ComponentId(9), &[("feed", &feed)]);

    posts.collect(json!([{"id": 1, "title": "a"}, {"id": 2, "title": "b"}]), "feed");

    let calls = recorder.calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].1["feed"],
        json!([{"id": 1, "title": "a"}, {"id": 2, "title": "b"}])
    );
}

/// Entity writes reach a tracked subscription that read a group's output.
#[test]
fn tracked_subscription_follows_group_output() {
    let recorder = Recorder::default();
    let pulse = Pulse::builder()
        .config(PulseConfig {
            notify: NotifyMode::Immediate,
            ..PulseConfig::default()
        })
        .integration(recorder.clone())
        .build();

    let posts = pulse.collection(CollectionConfig::new("posts"));
    posts.collect(json!([{"id": 1, "title": "a"}]), "feed");
    let feed = posts.get_group("feed").unwrap();

    let rendered = Arc::new(Mutex::new(Vec::new()));
    pulse.subscribe_tracked(ComponentId(3), {
        let (feed, rendered) = (feed.clone(), rendered.clone());
        move || rendered.lock().push(feed.output().len())
    });

    posts.update(1, json!({"title": "edited"}));
    assert_eq!(feed.output()[0]["title"], json!("edited"));
    assert_eq!(recorder.calls.lock().len(), 1);
    assert_eq!(*rendered.lock(), vec![1, 1]);
}

/// Unshifted keys keep their batch order at the front of the group.
#[test]
fn unshift_keeps_batch_order() {
    let pulse = immediate();
    let posts = pulse.collection(CollectionConfig::new("posts"));
    posts.collect(json!([{"id": 1}, {"id": 2}]), "feed");

    let feed = posts.get_group("feed").unwrap();
    posts.collect(json!([{"id": 3}, {"id": 4}]), ());
    feed.add_with(
        [3, 4],
        AddOptions {
            method: AddMethod::Unshift,
            ..AddOptions::default()
        },
    );

    let ids: Vec<Value> = feed.output().iter().map(|item| item["id"].clone()).collect();
    assert_eq!(ids, vec![json!(3), json!(4), json!(1), json!(2)]);
}

/// Background writes skip subscribers but dependents still settle.
#[test]
fn background_writes_are_silent() {
    let recorder = Recorder::default();
    let pulse = Pulse::builder()
        .config(PulseConfig {
            notify: NotifyMode::Immediate,
            ..PulseConfig::default()
        })
        .integration(recorder.clone())
        .build();

    let count = pulse.state(1);
    let doubled = pulse.computed({
        let count = count.clone();
        move || count.get::<i64>().unwrap_or(0) * 2
    });
    pulse.subscribe_props(ComponentId(1), &[("count", &count)]);

    pulse.in_background(|| {
        count.set(4);
    });
    assert_eq!(doubled.value(), json!(8));
    assert!(recorder.calls.lock().is_empty());
}

/// Persisted states survive into a new instance sharing the backend.
#[test]
fn persisted_state_restores() {
    let storage = MemoryStorage::new();

    let first = Pulse::builder().storage(storage.clone()).build();
    let theme = first.state("light");
    theme.persist("theme");
    theme.set("dark");
    assert_eq!(storage.raw("_pulse_theme").as_deref(), Some("\"dark\""));

    let second = Pulse::builder().storage(storage.clone()).build();
    let restored = second.state("light");
    restored.persist("theme");
    assert_eq!(restored.value(), json!("dark"));
}

/// Server state taken from one instance hydrates another.
#[test]
fn server_state_round_trip() {
    let server = immediate();
    server.state(3).key("count");
    let posts = server.collection(CollectionConfig::new("posts"));
    posts.collect(json!([{"id": 1}, {"id": 2}]), "feed");
    posts.create_selector("current", 2);

    let bytes = server.server_state().to_msgpack().unwrap();

    let client = immediate();
    client.hydrate(&pulse_core::ServerState::from_msgpack(&bytes).unwrap());
    assert_eq!(client.get_state("count").unwrap().value(), json!(3));
    let posts = client.get_collection("posts").unwrap();
    assert_eq!(posts.get_group("feed").unwrap().output().len(), 2);
    assert_eq!(posts.get_selector("current").unwrap().value(), json!({"id": 2}));
}

/// Dropping the instance turns every handle into a no-op.
#[test]
fn handles_outlive_instance_safely() {
    let pulse = immediate();
    let state = pulse.state(1);
    let posts = pulse.collection(CollectionConfig::new("posts"));
    drop(pulse);

    state.set(2);
    assert_eq!(state.value(), Value::Null);
    assert_eq!(posts.size(), 0);
    assert!(posts.get_data(1).is_none());
}

/// The update loop flushes deferred notifications on a tokio runtime.
#[tokio::test]
async fn update_loop_delivers_deferred_patches() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let pulse = Pulse::new();
    let count = pulse.state(0);
    pulse.subscribe_callback(&[("count", &count)], move |patch| {
        let _ = tx.send(patch.clone());
    });
    let handle = pulse.spawn_update_loop();

    count.set(1);
    count.set(2);
    let patch = rx.recv().await.unwrap();
    assert_eq!(patch["count"], json!(2));

    drop(count);
    drop(pulse);
    handle.await.unwrap();
}
