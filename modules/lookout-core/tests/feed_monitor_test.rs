//! Contract tests for the HTTP feed monitor: conditional requests,
//! adaptive intervals, de-duplication and first-run priming, against a
//! mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lookout_core::{
    EntityState, FeedEntity, FeedMonitor, FeedMonitorConfig, FeedSource, MessageBus, PollEntry,
    Poller, Record,
};

/// Line-oriented test source: each body line is `<id> <text>`; the first
/// token is the record id.
struct LineSource;

impl FeedSource for LineSource {
    fn parse(&self, _entity: &FeedEntity, body: &str) -> anyhow::Result<Vec<Record>> {
        Ok(body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(Record::text)
            .collect())
    }

    fn record_id(&self, record: &Record) -> String {
        record
            .display()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// Same parser, but updated records are stored without re-emitting.
struct QuietLineSource;

impl FeedSource for QuietLineSource {
    fn parse(&self, entity: &FeedEntity, body: &str) -> anyhow::Result<Vec<Record>> {
        LineSource.parse(entity, body)
    }

    fn record_id(&self, record: &Record) -> String {
        LineSource.record_id(record)
    }

    fn emit_updates(&self) -> bool {
        false
    }
}

async fn monitor_for<S: FeedSource>(
    server: &MockServer,
    interval: f64,
    source: S,
) -> (Arc<FeedMonitor<S>>, EntityState) {
    let bus = Arc::new(MessageBus::new());
    let conf: FeedMonitorConfig = serde_json::from_value(serde_json::json!({
        "name": "mon",
    }))
    .unwrap();
    let entity: FeedEntity = serde_json::from_value(serde_json::json!({
        "name": "feed",
        "url": format!("{}/feed", server.uri()),
        "update_interval": interval,
    }))
    .unwrap();
    let monitor = FeedMonitor::create(bus, conf, vec![entity], source)
        .await
        .unwrap();
    let state = monitor.initial_state(&PollEntry {
        name: "feed".to_string(),
        interval: Duration::from_secs_f64(interval),
    });
    (monitor, state)
}

async fn respond_with(server: &MockServer, template: ResponseTemplate) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(template)
        .mount(server)
        .await;
}

#[tokio::test]
async fn new_and_updated_records() {
    // S1: one entry polled twice emits once; a content change emits again
    // and leaves two rows sharing the uid.
    let server = MockServer::start().await;
    let (monitor, mut state) = monitor_for(&server, 60.0, LineSource).await;

    respond_with(&server, ResponseTemplate::new(200).set_body_string("x A")).await;
    let first = monitor.poll("feed", &mut state).await.unwrap();
    assert_eq!(first.len(), 1);

    let second = monitor.poll("feed", &mut state).await.unwrap();
    assert!(second.is_empty());

    respond_with(&server, ResponseTemplate::new(200).set_body_string("x B")).await;
    let third = monitor.poll("feed", &mut state).await.unwrap();
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].display(), "x B");

    let store = monitor.record_store();
    assert_eq!(store.size(Some("feed")).await.unwrap(), 2);
    let row = store.fetch("feed:x", None).await.unwrap().unwrap();
    assert_eq!(row.uid, "feed:x");
}

#[tokio::test]
async fn updates_stay_quiet_when_source_opts_out() {
    let server = MockServer::start().await;
    let (monitor, mut state) = monitor_for(&server, 60.0, QuietLineSource).await;

    respond_with(&server, ResponseTemplate::new(200).set_body_string("x A")).await;
    assert_eq!(monitor.poll("feed", &mut state).await.unwrap().len(), 1);

    respond_with(&server, ResponseTemplate::new(200).set_body_string("x B")).await;
    assert!(monitor.poll("feed", &mut state).await.unwrap().is_empty());
    // The new version was still persisted.
    assert_eq!(
        monitor.record_store().size(Some("feed")).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn store_and_filter_dedups_by_uid_and_hash() {
    // P3 directly against the dedup pipeline, no HTTP involved.
    let server = MockServer::start().await;
    let (monitor, _state) = monitor_for(&server, 60.0, LineSource).await;

    let r1 = Record::text("x same");
    assert_eq!(
        monitor.store_and_filter(&[r1.clone()], "feed").await.unwrap().len(),
        1
    );
    assert!(monitor
        .store_and_filter(&[r1.clone()], "feed")
        .await
        .unwrap()
        .is_empty());

    let r2 = Record::text("x changed");
    assert_eq!(
        monitor.store_and_filter(&[r2.clone()], "feed").await.unwrap(),
        vec![r2.clone()]
    );
    assert!(monitor
        .store_and_filter(&[r2], "feed")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn conditional_get_uses_etag_and_returns_early_on_304() {
    // S2: the second poll carries If-None-Match and a 304 produces nothing.
    let server = MockServer::start().await;
    let (monitor, mut state) = monitor_for(&server, 60.0, LineSource).await;

    respond_with(
        &server,
        ResponseTemplate::new(200)
            .set_body_string("x A")
            .insert_header("ETag", "\"v1\""),
    )
    .await;
    assert_eq!(monitor.poll("feed", &mut state).await.unwrap().len(), 1);
    assert_eq!(state.etag.as_deref(), Some("\"v1\""));

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    assert!(monitor.poll("feed", &mut state).await.unwrap().is_empty());
    // Cache headers are untouched by a 304.
    assert_eq!(state.etag.as_deref(), Some("\"v1\""));
    server.verify().await;
}

#[tokio::test]
async fn interval_follows_cache_ttl_and_backs_off_on_failure() {
    // S3: max-age drives the interval up, failures double it capped at
    // base × 10, recovery returns to the TTL.
    let server = MockServer::start().await;
    let (monitor, mut state) = monitor_for(&server, 60.0, LineSource).await;

    respond_with(
        &server,
        ResponseTemplate::new(200)
            .set_body_string("x A")
            .insert_header("Cache-Control", "max-age=300"),
    )
    .await;
    monitor.poll("feed", &mut state).await.unwrap();
    assert_eq!(state.update_interval, Duration::from_secs(300));

    respond_with(&server, ResponseTemplate::new(500)).await;
    monitor.poll("feed", &mut state).await.unwrap();
    assert_eq!(state.update_interval, Duration::from_secs(600));
    monitor.poll("feed", &mut state).await.unwrap();
    assert_eq!(state.update_interval, Duration::from_secs(600));

    respond_with(
        &server,
        ResponseTemplate::new(200)
            .set_body_string("x A")
            .insert_header("Cache-Control", "max-age=300"),
    )
    .await;
    monitor.poll("feed", &mut state).await.unwrap();
    assert_eq!(state.update_interval, Duration::from_secs(300));
}

#[tokio::test]
async fn first_run_priming_stores_without_emitting() {
    // P4: a fresh entity's endpoint returns three records; priming stores
    // them all and the next poll emits nothing.
    let server = MockServer::start().await;
    let (monitor, mut state) = monitor_for(&server, 60.0, LineSource).await;

    respond_with(
        &server,
        ResponseTemplate::new(200).set_body_string("a one\nb two\nc three"),
    )
    .await;

    monitor.prime().await.unwrap();
    assert_eq!(monitor.record_store().size(Some("feed")).await.unwrap(), 3);

    let emitted = monitor.poll("feed", &mut state).await.unwrap();
    assert!(emitted.is_empty());
}

#[tokio::test]
async fn parse_failure_drops_batch_but_keeps_polling() {
    struct PickySource;

    impl FeedSource for PickySource {
        fn parse(&self, _entity: &FeedEntity, body: &str) -> anyhow::Result<Vec<Record>> {
            if body.contains("garbage") {
                anyhow::bail!("malformed response");
            }
            LineSource.parse(_entity, body)
        }

        fn record_id(&self, record: &Record) -> String {
            LineSource.record_id(record)
        }
    }

    let server = MockServer::start().await;
    let (monitor, mut state) = monitor_for(&server, 60.0, PickySource).await;

    respond_with(&server, ResponseTemplate::new(200).set_body_string("garbage")).await;
    let records = monitor.poll("feed", &mut state).await.unwrap();
    assert!(records.is_empty());

    respond_with(&server, ResponseTemplate::new(200).set_body_string("x ok")).await;
    assert_eq!(monitor.poll("feed", &mut state).await.unwrap().len(), 1);
}
