use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keel_broker::{Action, Actor, AdvertiseReply, Broker, BrokerClient, BrokerConfig, RunRequest};
use keel_bus::{respond_json, Bus, MemoryBus};
use keel_core::{Error, LabelSelector, Object, ObjectKey, Result};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn vm() -> ObjectKey {
    ObjectKey::new("vm", "t", "web")
}

fn input() -> serde_json::Value {
    json!({ "kind": "vm", "metadata": { "account": "t", "name": "web" }, "spec": { "size": 2 } })
}

async fn broker(bus: &Arc<dyn Bus>, cancel: &CancellationToken) {
    let config = BrokerConfig { advertise_timeout: Duration::from_millis(100), default_timeout: Duration::from_secs(5) };
    Broker::new(Arc::clone(bus)).with_config(config).start(cancel.clone()).await.unwrap();
}

/// Stamps which actor ran it into the status.
struct Tag(&'static str);

#[async_trait]
impl Action for Tag {
    async fn run(&self, _cancel: CancellationToken, mut input: Object) -> Result<Object> {
        input.status = json!({ "ranOn": self.0 });
        Ok(input)
    }
}

struct Stuck;

#[async_trait]
impl Action for Stuck {
    async fn run(&self, cancel: CancellationToken, input: Object) -> Result<Object> {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        }
        Ok(input)
    }
}

struct Refuse;

#[async_trait]
impl Action for Refuse {
    async fn run(&self, _cancel: CancellationToken, _input: Object) -> Result<Object> {
        Err(Error::Validation("size must be odd".into()))
    }
}

fn labels(zone: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("zone".to_string(), zone.to_string())])
}

#[tokio::test]
async fn no_actor_fails_within_the_advertise_window() {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let cancel = CancellationToken::new();
    broker(&bus, &cancel).await;

    let started = Instant::now();
    let err = BrokerClient::new(Arc::clone(&bus))
        .run(&vm(), "restart", input(), None, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoResponders(_)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(2));
    cancel.cancel();
}

#[tokio::test]
async fn silent_actors_count_as_none() {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let cancel = CancellationToken::new();
    broker(&bus, &cancel).await;
    let actor = Actor::new(Arc::clone(&bus), labels("a"));
    actor.register("vm", "restart", Arc::new(Tag("a"))).await.unwrap();

    let selector = LabelSelector::default().with_label("zone", "elsewhere");
    let err = BrokerClient::new(Arc::clone(&bus))
        .run(&vm(), "restart", input(), Some(selector), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err, Error::NoResponders("no actor available".into()));
    actor.stop().await;
    cancel.cancel();
}

#[tokio::test]
async fn run_reaches_the_matching_actor() {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let cancel = CancellationToken::new();
    broker(&bus, &cancel).await;
    let a = Actor::new(Arc::clone(&bus), labels("a"));
    a.register("vm", "restart", Arc::new(Tag("a"))).await.unwrap();
    let b = Actor::new(Arc::clone(&bus), labels("b"));
    b.register("vm", "restart", Arc::new(Tag("b"))).await.unwrap();
    assert_ne!(a.id(), b.id());

    let client = BrokerClient::new(Arc::clone(&bus));
    for _ in 0..3 {
        let selector = LabelSelector::default().with_label("zone", "b");
        let out = client.run(&vm(), "restart", input(), Some(selector), Duration::from_secs(5)).await.unwrap();
        assert_eq!(out["status"]["ranOn"], "b");
        assert_eq!(out["spec"]["size"], 2);
    }

    let os = LabelSelector::default().with_label("os", std::env::consts::OS);
    let out = client.run(&vm(), "restart", input(), Some(os), Duration::from_secs(5)).await.unwrap();
    assert!(out["status"]["ranOn"] == "a" || out["status"]["ranOn"] == "b");

    a.stop().await;
    b.stop().await;
    cancel.cancel();
}

#[tokio::test]
async fn other_actions_are_not_answered() {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let cancel = CancellationToken::new();
    broker(&bus, &cancel).await;
    let actor = Actor::new(Arc::clone(&bus), BTreeMap::new());
    actor.register("vm", "restart", Arc::new(Tag("a"))).await.unwrap();

    let err = BrokerClient::new(Arc::clone(&bus))
        .run(&vm(), "resize", input(), None, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoResponders(_)));
    actor.stop().await;
    cancel.cancel();
}

#[tokio::test]
async fn stuck_actor_times_out() {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let cancel = CancellationToken::new();
    broker(&bus, &cancel).await;
    let actor = Actor::new(Arc::clone(&bus), BTreeMap::new());
    actor.register("vm", "restart", Arc::new(Stuck)).await.unwrap();

    let started = Instant::now();
    let err = BrokerClient::new(Arc::clone(&bus))
        .run(&vm(), "restart", input(), None, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(2));
    actor.stop().await;
    cancel.cancel();
}

#[tokio::test]
async fn actor_errors_are_relayed() {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let cancel = CancellationToken::new();
    broker(&bus, &cancel).await;
    let actor = Actor::new(Arc::clone(&bus), BTreeMap::new());
    actor.register("vm", "resize", Arc::new(Refuse)).await.unwrap();

    let err = BrokerClient::new(Arc::clone(&bus))
        .run(&vm(), "resize", input(), None, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Validation("size must be odd".into()));
    actor.stop().await;
    cancel.cancel();
}

#[tokio::test]
async fn invalid_registration_is_rejected() {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let actor = Actor::new(bus, BTreeMap::new());
    let err = actor.register("vm", "re.start", Arc::new(Tag("a"))).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));
}

#[tokio::test]
async fn actor_deadline_excludes_advertise_time() {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let cancel = CancellationToken::new();
    let config = BrokerConfig { advertise_timeout: Duration::from_secs(2), default_timeout: Duration::from_secs(5) };
    Broker::new(Arc::clone(&bus)).with_config(config).start(cancel.clone()).await.unwrap();

    // An actor that takes 300ms to advertise and echoes the deadline it was handed.
    let mut adv = bus.subscribe("keel.actor.advertise.vm.*.*.restart").await.unwrap();
    let mut runs = bus.subscribe("keel.actor.run.vm.*.*.restart.slow").await.unwrap();
    let abus = Arc::clone(&bus);
    tokio::spawn(async move {
        if let Some(msg) = adv.next().await {
            tokio::time::sleep(Duration::from_millis(300)).await;
            respond_json(abus.as_ref(), &msg, &AdvertiseReply { id: "slow".into() }).await;
        }
        if let Some(msg) = runs.next().await {
            let req: RunRequest = serde_json::from_slice(&msg.payload).unwrap();
            respond_json(abus.as_ref(), &msg, &json!({ "timeoutMs": req.timeout_ms })).await;
        }
    });

    let out = BrokerClient::new(Arc::clone(&bus))
        .run(&vm(), "restart", input(), None, Duration::from_millis(1000))
        .await
        .unwrap();
    let handed = out["timeoutMs"].as_u64().unwrap();
    assert!(handed > 0 && handed <= 700, "actor was handed {}ms", handed);
    cancel.cancel();
}
