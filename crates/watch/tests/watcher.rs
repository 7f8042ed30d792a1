#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_core::{Error, Event, EventOperation, ObjectKey, Outcome};
use keel_kv::{BucketConfig, KeyValue, MemoryKv};
use keel_watch::{classify, spawn_cache, FnHandler, Watcher, WatcherConfig};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn bucket() -> Arc<MemoryKv> {
    Arc::new(MemoryKv::new(BucketConfig::new("objects")))
}

fn body(name: &str, deleting: bool) -> Vec<u8> {
    let mut v = json!({ "kind": "widget", "metadata": { "name": name, "account": "t" }, "spec": {} });
    if deleting {
        v["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
    }
    serde_json::to_vec(&v).unwrap()
}

fn config() -> WatcherConfig {
    let mut c = WatcherConfig::new("widget");
    c.backoff = Duration::from_millis(10);
    c
}

#[tokio::test]
async fn classify_derives_three_states() {
    let kv = bucket();
    kv.put("widget.t.a", body("a", false)).await.unwrap();
    kv.put("widget.t.b", body("b", true)).await.unwrap();
    kv.put("widget.t.c", body("c", false)).await.unwrap();
    kv.delete("widget.t.c").await.unwrap();
    let c = kv.consumer(keel_kv::ConsumerConfig::new("widget.*.*")).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let d = c.next().await;
        seen.push(classify(d.entry()).unwrap());
        d.ack();
    }
    assert_eq!(seen[0].operation, EventOperation::Put);
    assert_eq!(seen[0].data["metadata"]["revision"], 1);
    assert_eq!(seen[1].operation, EventOperation::Delete);
    assert_eq!(seen[2].operation, EventOperation::Purge);
    assert_eq!(seen[2].key, ObjectKey::new("widget", "t", "c"));
}

#[tokio::test]
async fn init_fires_after_backlog_is_handled() {
    let kv = bucket();
    for n in ["a", "b", "c"] {
        kv.put(&format!("widget.t.{}", n), body(n, false)).await.unwrap();
    }
    kv.put("gadget.t.x", body("x", false)).await.unwrap();

    let seen: Arc<Mutex<Vec<Event>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let handler = FnHandler(move |_cancel: CancellationToken, ev: Event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(ev);
            Ok::<_, Error>(Outcome::Done)
        }
    });
    let w = Watcher::start(kv.clone(), config(), Arc::new(handler)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), w.wait_until_init()).await.expect("init");
    assert!(w.is_initialized());
    assert_eq!(seen.lock().unwrap().len(), 3);
    w.stop().await;
}

#[tokio::test]
async fn empty_bucket_is_initialized_immediately() {
    let kv = bucket();
    let handler = FnHandler(|_c: CancellationToken, _e: Event| async { Ok::<_, Error>(Outcome::Done) });
    let w = Watcher::start(kv, config(), Arc::new(handler)).await.unwrap();
    assert!(w.is_initialized());
    w.stop().await;
}

#[tokio::test]
async fn handler_errors_are_retried_with_backoff() {
    let kv = bucket();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let handler = FnHandler(move |_c: CancellationToken, _e: Event| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Internal("transient".into()))
            } else {
                Ok::<_, Error>(Outcome::Done)
            }
        }
    });
    let w = Watcher::start(kv.clone(), config(), Arc::new(handler)).await.unwrap();
    kv.put("widget.t.a", body("a", false)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while attempts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("retried");
    w.stop().await;
}

#[tokio::test]
async fn requeue_after_redelivers_later() {
    let kv = bucket();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let handler = FnHandler(move |_c: CancellationToken, _e: Event| {
        let counter = Arc::clone(&counter);
        async move {
            Ok::<_, Error>(match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Outcome::RequeueAfter(Duration::from_millis(20)),
                1 => Outcome::Requeue,
                _ => Outcome::Done,
            })
        }
    });
    let w = Watcher::start(kv.clone(), config(), Arc::new(handler)).await.unwrap();
    kv.put("widget.t.a", body("a", false)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while attempts.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("three attempts");
    w.stop().await;
}

#[tokio::test]
async fn cache_tracks_objects() {
    let kv = bucket();
    kv.put("widget.t.a", body("a", false)).await.unwrap();
    let cache = spawn_cache(kv.clone(), &ObjectKey::kind_pattern("widget"), 1024).await.unwrap();
    cache.wait_ready().await;
    assert_eq!(cache.current().len(), 1);

    let mut epochs = cache.subscribe_epoch();
    kv.delete("widget.t.a").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cache.current().is_empty() {
            let _ = epochs.changed().await;
        }
    })
    .await
    .expect("delete observed");
    cache.stop();
}

#[tokio::test]
async fn cache_holds_a_backlog_larger_than_its_queue() {
    let kv = bucket();
    for i in 0..50 {
        let name = format!("w{}", i);
        kv.put(&format!("widget.t.{}", name), body(&name, false)).await.unwrap();
    }
    let cache = spawn_cache(kv.clone(), &ObjectKey::kind_pattern("widget"), 10).await.unwrap();
    cache.wait_ready().await;
    assert_eq!(cache.current().len(), 50);

    let mut epochs = cache.subscribe_epoch();
    for i in 0..25 {
        kv.delete(&format!("widget.t.w{}", i)).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(2), async {
        while cache.current().len() != 25 {
            let _ = epochs.changed().await;
        }
    })
    .await
    .expect("deletes observed");
    assert!(cache.current().get(&ObjectKey::new("widget", "t", "w0")).is_none());
    assert!(cache.current().get(&ObjectKey::new("widget", "t", "w49")).is_some());
    cache.stop();
}

#[tokio::test(start_paused = true)]
async fn slow_handler_keeps_its_delivery() {
    let kv = bucket();
    let calls = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (c, a, p) = (Arc::clone(&calls), Arc::clone(&active), Arc::clone(&peak));
    let handler = FnHandler(move |_c: CancellationToken, _e: Event| {
        let (calls, active, peak) = (Arc::clone(&c), Arc::clone(&a), Arc::clone(&p));
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(12)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, Error>(Outcome::Done)
        }
    });
    let mut cfg = config();
    cfg.ack_wait = Duration::from_secs(5);
    let w = Watcher::start(kv.clone(), cfg, Arc::new(handler)).await.unwrap();
    kv.put("widget.t.a", body("a", false)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    w.stop().await;
}
