use std::sync::Arc;
use std::time::Duration;

use keel_bus::{respond, respond_error, Bus, MemoryBus};
use keel_core::{Error, MetaOnly, ObjectKey};
use keel_kv::{BucketConfig, KeyValue, KvError, MemoryKv};
use keel_store::{Store, StoreConfig, ValidateRequest, STORE_MANAGER};
use serde_json::{json, Value as Json};

fn store() -> Store {
    Store::new(Arc::new(MemoryKv::new(BucketConfig::new("objects")))).with_config(StoreConfig::default())
}

fn key() -> ObjectKey {
    ObjectKey::new("widget", "t", "a")
}

fn owners(obj: &Json) -> Vec<(String, Vec<String>)> {
    let meta = MetaOnly::from_json(obj).unwrap();
    meta.metadata
        .managed_fields
        .iter()
        .map(|m| {
            let spec = m.fields_v1.get_fields("spec").map(|s| {
                s.children.keys().map(|k| k.to_string()).collect::<Vec<_>>()
            });
            (m.manager.clone(), spec.unwrap_or_default())
        })
        .collect()
}

#[tokio::test]
async fn two_managers_then_conflict() {
    let s = store();
    s.apply(&key(), json!({ "metadata": { "name": "a", "account": "t" }, "spec": { "x": 1 } }), "m1", false)
        .await
        .unwrap();
    let got = s.get(&key()).await.unwrap();
    assert_eq!(got["spec"], json!({ "x": 1 }));
    assert_eq!(owners(&got), vec![("m1".to_string(), vec!["x".to_string()])]);

    s.apply(&key(), json!({ "spec": { "y": 2 } }), "m2", false).await.unwrap();
    let got = s.get(&key()).await.unwrap();
    assert_eq!(got["spec"], json!({ "x": 1, "y": 2 }));
    assert_eq!(
        owners(&got),
        vec![("m1".to_string(), vec!["x".to_string()]), ("m2".to_string(), vec!["y".to_string()])]
    );

    let err = s.apply(&key(), json!({ "spec": { "x": 2 } }), "m2", false).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(err.message().contains("spec.x"), "{}", err);
    let after = s.get(&key()).await.unwrap();
    assert_eq!(after["spec"]["x"], 1);
    assert_eq!(after["metadata"]["revision"], got["metadata"]["revision"]);
}

#[tokio::test]
async fn identity_only_apply_keeps_other_managers_fields() {
    let s = store();
    s.apply(
        &key(),
        json!({ "metadata": { "labels": { "tier": "web" }, "finalizers": ["keep"] }, "spec": { "x": 1 } }),
        "m1",
        false,
    )
    .await
    .unwrap();
    let out = s
        .apply(&key(), json!({ "kind": "widget", "metadata": { "name": "a", "account": "t" } }), "m2", false)
        .await
        .unwrap();
    assert_eq!(out["spec"]["x"], 1);
    assert_eq!(out["metadata"]["labels"]["tier"], "web");
    assert_eq!(out["metadata"]["finalizers"], json!(["keep"]));
    let got = s.get(&key()).await.unwrap();
    assert_eq!(got["spec"], json!({ "x": 1 }));
    assert_eq!(got["metadata"]["finalizers"], json!(["keep"]));
}

#[tokio::test]
async fn force_moves_ownership() {
    let s = store();
    s.apply(&key(), json!({ "spec": { "x": 1 } }), "m1", false).await.unwrap();
    let out = s.apply(&key(), json!({ "spec": { "x": 2 } }), "m2", true).await.unwrap();
    assert_eq!(out["spec"]["x"], 2);
    assert_eq!(owners(&out), vec![("m2".to_string(), vec!["x".to_string()])]);
}

#[tokio::test]
async fn reapply_is_idempotent() {
    let s = store();
    let payload = json!({ "spec": { "x": 1, "ports": [ { "id": "http", "port": 80 } ] } });
    let first = s.apply(&key(), payload.clone(), "m1", false).await.unwrap();
    let second = s.apply(&key(), payload, "m1", false).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn apply_leaves_unmentioned_fields_alone() {
    let s = store();
    s.apply(&key(), json!({ "spec": { "x": 1, "nested": { "a": true } } }), "m1", false).await.unwrap();
    s.apply(&key(), json!({ "spec": { "nested": { "b": false } } }), "m2", false).await.unwrap();
    let got = s.get(&key()).await.unwrap();
    assert_eq!(got["spec"], json!({ "x": 1, "nested": { "a": true, "b": false } }));
}

#[tokio::test]
async fn dropped_fields_disappear() {
    let s = store();
    s.apply(&key(), json!({ "spec": { "x": 1, "y": 2 } }), "m1", false).await.unwrap();
    let out = s.apply(&key(), json!({ "spec": { "x": 1 } }), "m1", false).await.unwrap();
    assert_eq!(out["spec"], json!({ "x": 1 }));
}

#[tokio::test]
async fn keyed_list_elements_merge_by_id() {
    let s = store();
    s.apply(&key(), json!({ "spec": { "ports": [ { "id": "http", "port": 80 } ] } }), "m1", false).await.unwrap();
    let out = s
        .apply(&key(), json!({ "spec": { "ports": [ { "id": "grpc", "port": 9090 } ] } }), "m2", false)
        .await
        .unwrap();
    let ids: Vec<&str> = out["spec"]["ports"].as_array().unwrap().iter().map(|p| p["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["http", "grpc"]);
}

#[tokio::test]
async fn revisions_strictly_increase() {
    let s = store();
    let mut last = 0;
    for i in 0..5 {
        let out = s.apply(&key(), json!({ "spec": { "n": i } }), "m1", false).await.unwrap();
        let rev = out["metadata"]["revision"].as_u64().unwrap();
        assert!(rev > last);
        last = rev;
    }
}

#[tokio::test]
async fn stale_revision_update_fails() {
    let kv = Arc::new(MemoryKv::new(BucketConfig::new("objects")));
    let s = Store::new(kv.clone()).with_config(StoreConfig::default());
    let created = s.apply(&key(), json!({ "spec": { "x": 1 } }), "m1", false).await.unwrap();
    let rev = created["metadata"]["revision"].as_u64().unwrap();
    s.apply(&key(), json!({ "spec": { "x": 2 } }), "m1", false).await.unwrap();
    let err = kv.update("widget.t.a", b"{}".to_vec(), rev).await.unwrap_err();
    assert!(matches!(err, KvError::WrongLastRevision { .. }));
}

#[tokio::test]
async fn update_checks_revision_and_keeps_ledger() {
    let s = store();
    let created = s.apply(&key(), json!({ "spec": { "x": 1 } }), "m1", false).await.unwrap();
    let rev = created["metadata"]["revision"].as_u64().unwrap();

    let updated = s.update(&key(), json!({ "spec": { "x": 5 } }), rev).await.unwrap();
    assert_eq!(updated["spec"]["x"], 5);
    assert!(updated["metadata"]["revision"].as_u64().unwrap() > rev);
    assert_eq!(owners(&updated), vec![("m1".to_string(), vec!["x".to_string()])]);

    let err = s.update(&key(), json!({ "spec": { "x": 6 } }), rev).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(s.get(&key()).await.unwrap()["spec"]["x"], 5);
    assert!(s.update(&ObjectKey::new("widget", "t", "missing"), json!({}), 1).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn create_refuses_existing_key() {
    let s = store();
    s.create(&key(), json!({ "spec": {} })).await.unwrap();
    assert!(s.create(&key(), json!({ "spec": {} })).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn delete_marks_once_and_purge_removes() {
    let s = store();
    s.apply(&key(), json!({ "spec": { "x": 1 } }), "m1", false).await.unwrap();
    s.delete(&key(), Duration::from_secs(60)).await.unwrap();
    let marked = s.get(&key()).await.unwrap();
    let meta = MetaOnly::from_json(&marked).unwrap().metadata;
    assert!(meta.is_marked_for_deletion());
    assert!(meta.managed_fields.iter().any(|m| m.manager == STORE_MANAGER));

    s.delete(&key(), Duration::ZERO).await.unwrap();
    let again = s.get(&key()).await.unwrap();
    assert_eq!(again["metadata"]["deletionTimestamp"], marked["metadata"]["deletionTimestamp"]);

    s.purge(&key()).await.unwrap();
    assert!(s.get(&key()).await.unwrap_err().is_not_found());
    s.purge(&key()).await.unwrap();
    assert!(s.delete(&key(), Duration::ZERO).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn list_injects_revisions() {
    let s = store();
    for n in ["a", "b"] {
        s.apply(&ObjectKey::new("widget", "t", n), json!({ "spec": {} }), "m1", false).await.unwrap();
    }
    s.apply(&ObjectKey::new("gadget", "t", "c"), json!({ "spec": {} }), "m1", false).await.unwrap();
    let items = s.list(&ObjectKey::kind_pattern("widget")).await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|o| o["metadata"]["revision"].is_u64()));
    assert_eq!(s.list(&ObjectKey::all()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn validator_can_reject_writes() {
    let bus = Arc::new(MemoryBus::new());
    let mut create = bus.subscribe("keel.validate.create.widget").await.unwrap();
    let mut update = bus.subscribe("keel.validate.update.widget").await.unwrap();
    let vbus = Arc::clone(&bus);
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(m) = create.next() => m,
                Some(m) = update.next() => m,
                else => break,
            };
            let req: ValidateRequest = serde_json::from_slice(&msg.payload).unwrap();
            if req.new["spec"]["x"].as_i64().unwrap_or(0) < 0 {
                respond_error(vbus.as_ref(), &msg, &Error::Validation("x must not be negative".into())).await;
            } else {
                respond(vbus.as_ref(), &msg, 200, Vec::new()).await;
            }
        }
    });

    let s = store().with_bus(bus);
    let err = s.apply(&key(), json!({ "spec": { "x": -1 } }), "m1", false).await.unwrap_err();
    assert_eq!(err, Error::Validation("x must not be negative".into()));
    s.apply(&key(), json!({ "spec": { "x": 1 } }), "m1", false).await.unwrap();
    let err = s.apply(&key(), json!({ "spec": { "x": -5 } }), "m1", false).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(s.get(&key()).await.unwrap()["spec"]["x"], 1);
}

#[tokio::test]
async fn writes_proceed_without_validators() {
    let s = store().with_bus(Arc::new(MemoryBus::new()));
    s.apply(&key(), json!({ "spec": { "x": 1 } }), "m1", false).await.unwrap();
}
