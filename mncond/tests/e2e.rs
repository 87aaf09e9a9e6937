//! End-to-end tests against a running connector wired to a MongoDB replica
//! set and a NATS server with JetStream enabled, configured as in the
//! repository's `connector.yaml`:
//!
//! ```sh
//! MONGO_URI=... NATS_URL=... CONNECTOR_URL=... \
//!     cargo test -p mncond --test e2e -- --ignored
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use async_nats::jetstream::consumer::{pull, DeliverPolicy};
use async_nats::jetstream::stream::StorageType;
use async_nats::jetstream::{self, Context};
use futures_util::StreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Document};
use mongodb::results::CollectionSpecification;
use mongodb::Client;

const WATCHED_DB: &str = "test-connector";
const TOKENS_DB: &str = "resume-tokens";
const EVENT_DEADLINE: Duration = Duration::from_secs(10);
const TOKEN_DEADLINE: Duration = Duration::from_secs(5);

fn mongo_uri() -> String {
    std::env::var("MONGO_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017/?replicaSet=rs0".to_owned())
}

fn nats_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_owned())
}

fn connector_url() -> String {
    std::env::var("CONNECTOR_URL").unwrap_or_else(|_| "http://localhost:8080".to_owned())
}

fn unique_marker() -> String {
    ObjectId::new().to_hex()
}

async fn await_true<F, Fut>(deadline: Duration, what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if probe().await {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "{what} did not happen within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Scan every message on `subject` until one matches, or panic at the
/// deadline.
async fn await_event<P>(
    js: &Context,
    stream_name: &str,
    subject: &str,
    predicate: P,
) -> serde_json::Value
where
    P: Fn(&serde_json::Value) -> bool,
{
    let stream = js.get_stream(stream_name).await.expect("stream exists");
    let consumer = stream
        .create_consumer(pull::Config {
            deliver_policy: DeliverPolicy::All,
            filter_subject: subject.to_owned(),
            ..Default::default()
        })
        .await
        .expect("create consumer");
    let mut messages = consumer.messages().await.expect("consumer messages");

    let start = Instant::now();
    while start.elapsed() < EVENT_DEADLINE {
        if let Ok(Some(Ok(message))) =
            tokio::time::timeout(Duration::from_secs(1), messages.next()).await
        {
            let _ = message.ack().await;
            if let Ok(event) = serde_json::from_slice::<serde_json::Value>(&message.payload) {
                if predicate(&event) {
                    return event;
                }
            }
        }
    }
    panic!("no matching event on {subject} within {EVENT_DEADLINE:?}");
}

async fn last_token(mongo: &Client, coll_name: &str) -> Option<String> {
    mongo
        .database(TOKENS_DB)
        .collection::<Document>(coll_name)
        .find_one(doc! {})
        .sort(doc! { "$natural": -1 })
        .await
        .ok()
        .flatten()
        .and_then(|record| record.get_str("value").ok().map(str::to_owned))
}

async fn await_last_token(mongo: &Client, coll_name: &str, expected: &str) {
    await_true(TOKEN_DEADLINE, "resume token append", || async {
        last_token(mongo, coll_name).await.as_deref() == Some(expected)
    })
    .await;
}

async fn healthz_reports_up() {
    await_true(EVENT_DEADLINE, "healthz turning UP", || async {
        match reqwest::get(format!("{}/healthz", connector_url())).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    })
    .await;

    let response = reqwest::get(format!("{}/healthz", connector_url()))
        .await
        .expect("healthz request");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("healthz body");
    assert_eq!(body["status"], "UP");
    assert_eq!(body["components"]["mongo"]["status"], "UP");
    assert_eq!(body["components"]["nats"]["status"], "UP");
}

async fn resources_are_created(mongo: &Client, js: &Context) {
    let watched = mongo
        .database(WATCHED_DB)
        .list_collection_names()
        .await
        .expect("list watched collections");
    assert!(watched.contains(&"coll1".to_owned()));
    assert!(watched.contains(&"coll2".to_owned()));

    let mut specs = mongo
        .database(TOKENS_DB)
        .list_collections()
        .await
        .expect("list token collections");
    let mut tokens: HashMap<String, CollectionSpecification> = HashMap::new();
    while let Some(spec) = specs.next().await {
        let spec = spec.expect("token collection spec");
        tokens.insert(spec.name.clone(), spec);
    }
    let coll1 = tokens.get("coll1").expect("coll1 token collection");
    assert_ne!(coll1.options.capped, Some(true));
    let coll2 = tokens.get("coll2").expect("coll2 token collection");
    assert_eq!(coll2.options.capped, Some(true));
    assert_eq!(coll2.options.size, Some(4096));

    for name in ["COLL1", "COLL2"] {
        let mut stream = js.get_stream(name).await.expect("stream exists");
        let info = stream.info().await.expect("stream info");
        assert!(info.config.subjects.contains(&format!("{name}.*")));
        assert_eq!(info.config.storage, StorageType::File);
    }
}

async fn insert_is_forwarded(mongo: &Client, js: &Context, coll_name: &str) {
    let marker = unique_marker();
    let coll = mongo.database(WATCHED_DB).collection::<Document>(coll_name);
    coll.insert_one(doc! { "message": &marker })
        .await
        .expect("insert");

    let stream = coll_name.to_uppercase();
    let event = await_event(js, &stream, &format!("{stream}.insert"), |event| {
        event["operationType"] == "insert" && event["fullDocument"]["message"] == marker.as_str()
    })
    .await;

    let data = event["_id"]["_data"].as_str().expect("resume token data");
    assert!(!data.is_empty());
    await_last_token(mongo, coll_name, data).await;
}

async fn update_is_forwarded(mongo: &Client, js: &Context, coll_name: &str) {
    let before = unique_marker();
    let after = unique_marker();
    let coll = mongo.database(WATCHED_DB).collection::<Document>(coll_name);
    let inserted = coll
        .insert_one(doc! { "message": &before })
        .await
        .expect("insert");
    coll.update_one(
        doc! { "_id": inserted.inserted_id.clone() },
        doc! { "$set": { "message": &after } },
    )
    .await
    .expect("update");

    let stream = coll_name.to_uppercase();
    let event = await_event(js, &stream, &format!("{stream}.update"), |event| {
        event["operationType"] == "update" && event["fullDocument"]["message"] == after.as_str()
    })
    .await;

    let data = event["_id"]["_data"].as_str().expect("resume token data");
    await_last_token(mongo, coll_name, data).await;
}

async fn delete_is_forwarded(mongo: &Client, js: &Context, coll_name: &str) {
    let marker = unique_marker();
    let coll = mongo.database(WATCHED_DB).collection::<Document>(coll_name);
    let inserted = coll
        .insert_one(doc! { "message": &marker })
        .await
        .expect("insert");
    coll.delete_one(doc! { "_id": inserted.inserted_id.clone() })
        .await
        .expect("delete");

    let stream = coll_name.to_uppercase();
    let event = await_event(js, &stream, &format!("{stream}.delete"), |event| {
        event["operationType"] == "delete"
            && event["fullDocumentBeforeChange"]["message"] == marker.as_str()
    })
    .await;

    let data = event["_id"]["_data"].as_str().expect("resume token data");
    await_last_token(mongo, coll_name, data).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires a running connector with a MongoDB replica set and NATS JetStream"]
async fn connector_end_to_end() {
    let mongo = Client::with_uri_str(mongo_uri())
        .await
        .expect("mongo client");
    let nats = async_nats::connect(nats_url()).await.expect("nats client");
    let js = jetstream::new(nats);

    healthz_reports_up().await;
    resources_are_created(&mongo, &js).await;

    insert_is_forwarded(&mongo, &js, "coll1").await;
    update_is_forwarded(&mongo, &js, "coll1").await;
    delete_is_forwarded(&mongo, &js, "coll1").await;

    // Same pipeline against the capped token collection.
    insert_is_forwarded(&mongo, &js, "coll2").await;
    update_is_forwarded(&mongo, &js, "coll2").await;
    delete_is_forwarded(&mongo, &js, "coll2").await;
}
