#![forbid(unsafe_code)]

use std::time::Duration;

use keel_kv::{BucketConfig, ConsumerConfig, DeliverPolicy, KeyValue, MemoryKv, Operation};

fn bucket() -> MemoryKv {
    MemoryKv::new(BucketConfig::new("objects"))
}

#[tokio::test]
async fn last_per_key_seeds_latest_values_in_revision_order() {
    let kv = bucket();
    kv.put("w.t.a", b"1".to_vec()).await.unwrap();
    kv.put("w.t.b", b"1".to_vec()).await.unwrap();
    kv.put("w.t.a", b"2".to_vec()).await.unwrap();
    kv.put("x.t.a", b"1".to_vec()).await.unwrap();

    let c = kv.consumer(ConsumerConfig::new("w.*.*")).await.unwrap();
    assert_eq!(c.seeded_through(), 3);
    let first = c.next().await;
    assert_eq!(first.entry().key, "w.t.b");
    first.ack();
    let second = c.next().await;
    assert_eq!((second.entry().key.as_str(), second.entry().value.as_slice()), ("w.t.a", b"2".as_slice()));
    assert!(!c.backlog_cleared(3));
    second.ack();
    assert!(c.backlog_cleared(3));
    assert!(c.try_next().is_none());
}

#[tokio::test]
async fn new_policy_skips_history() {
    let kv = bucket();
    kv.put("w.t.a", b"1".to_vec()).await.unwrap();
    let c = kv.consumer(ConsumerConfig::new("w.*.*").deliver(DeliverPolicy::New)).await.unwrap();
    assert!(c.try_next().is_none());
    kv.delete("w.t.a").await.unwrap();
    let d = c.next().await;
    assert_eq!(d.entry().operation, Operation::Delete);
}

#[tokio::test]
async fn nak_redelivers_and_counts_attempts() {
    let kv = bucket();
    let c = kv.consumer(ConsumerConfig::new(">")).await.unwrap();
    kv.put("w.t.a", b"1".to_vec()).await.unwrap();
    let d = c.next().await;
    assert_eq!(d.num_delivered(), 1);
    d.nak();
    let again = c.next().await;
    assert_eq!(again.num_delivered(), 2);
    // settling a superseded attempt has no effect
    d.ack();
    assert_eq!(c.outstanding(), 1);
    again.ack();
    assert_eq!(c.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn nak_with_delay_holds_the_entry_back() {
    let kv = bucket();
    let c = kv.consumer(ConsumerConfig::new(">").ack_wait(Duration::from_secs(60))).await.unwrap();
    kv.put("w.t.a", b"1".to_vec()).await.unwrap();
    c.next().await.nak_with_delay(Duration::from_secs(5));
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(c.try_next().is_none());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(c.try_next().map(|d| d.num_delivered()), Some(2));
}

#[tokio::test(start_paused = true)]
async fn ack_wait_expiry_redelivers_unless_in_progress() {
    let kv = bucket();
    let c = kv.consumer(ConsumerConfig::new(">").ack_wait(Duration::from_secs(10))).await.unwrap();
    kv.put("w.t.a", b"1".to_vec()).await.unwrap();
    let d = c.next().await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    d.in_progress();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(c.try_next().is_none(), "heartbeat should hold the delivery");
    tokio::time::sleep(Duration::from_secs(5)).await;
    let re = c.try_next().expect("redelivered after ack wait");
    assert_eq!(re.num_delivered(), 2);
}

#[tokio::test]
async fn durable_consumers_share_one_queue() {
    let kv = bucket();
    let cfg = ConsumerConfig::new("w.*.*").durable("rc_w");
    let a = kv.consumer(cfg.clone()).await.unwrap();
    let b = kv.consumer(cfg).await.unwrap();
    kv.put("w.t.a", b"1".to_vec()).await.unwrap();
    let d = a.next().await;
    assert!(b.try_next().is_none());
    d.ack();
    assert_eq!(a.name(), "rc_w");
    assert_eq!(b.outstanding(), 0);
}
