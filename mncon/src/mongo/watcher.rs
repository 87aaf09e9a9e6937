use std::time::Duration;

use futures_util::stream::StreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentBeforeChangeType, FullDocumentType};
use mongodb::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Collection;
use crate::metrics::Metrics;
use crate::mongo::resume_tokens::TokenStore;
use crate::nats::Publisher;

const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("NATS error: {0}")]
    Nats(#[from] crate::nats::Error),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

type EventStream = ChangeStream<ChangeStreamEvent<Document>>;

/// Tails one collection's change stream and forwards every event to the bus.
///
/// The loop is strictly serial per event: publish, then append the resume
/// token. A token is never appended for an event the bus has not durably
/// accepted, so a crash or failure at any point replays at most the events
/// whose tokens were still unwritten (at-least-once; the bus deduplicates on
/// the token within its window).
pub struct CollectionWatcher {
    client: Client,
    collection: Collection,
    tokens: TokenStore,
    publisher: Publisher,
    metrics: Metrics,
}

impl CollectionWatcher {
    pub fn new(
        client: Client,
        collection: Collection,
        publisher: Publisher,
        metrics: Metrics,
    ) -> Self {
        let tokens = TokenStore::new(
            &client,
            &collection.tokens_db_name,
            &collection.tokens_coll_name,
        );
        Self {
            client,
            collection,
            tokens,
            publisher,
            metrics,
        }
    }

    /// Run until cancelled. Everything short of a source authentication
    /// failure is handled locally by reopening the stream after a backoff;
    /// the stream is reopened from the last appended token, so events whose
    /// token never landed are replayed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut attempt: u32 = 0;
        while !cancel.is_cancelled() {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                opened = self.open() => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) if crate::mongo::is_fatal(&e) => {
                    error!(coll = %self.collection.coll_name, error = %e, "Unrecoverable source error");
                    return Err(e.into());
                }
                Err(e) => {
                    error!(coll = %self.collection.coll_name, error = %e, "Failed to open change stream");
                    self.restart("open_error");
                    attempt += 1;
                    if !backoff(&self.collection.coll_name, attempt, &cancel).await {
                        break;
                    }
                    continue;
                }
            };
            info!(db = %self.collection.db_name, coll = %self.collection.coll_name, "Started watching collection");
            attempt = 0;

            match self.consume(&mut stream, &cancel).await? {
                Consumed::Cancelled => break,
                Consumed::StreamEnded => {
                    // Graceful end; reopen from the last token right away.
                    warn!(coll = %self.collection.coll_name, "Change stream ended, reopening");
                    self.restart("stream_ended");
                }
                Consumed::Failed(reason) => {
                    self.restart(reason);
                    attempt += 1;
                    if !backoff(&self.collection.coll_name, attempt, &cancel).await {
                        break;
                    }
                }
            }
        }
        debug!(coll = %self.collection.coll_name, "Watcher stopped");
        Ok(())
    }

    /// Pump events until the stream ends, an error forces a reopen, or the
    /// scope is cancelled.
    async fn consume(
        &self,
        stream: &mut EventStream,
        cancel: &CancellationToken,
    ) -> Result<Consumed, Error> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Consumed::Cancelled),
                next = stream.next() => next,
            };
            match next {
                None => return Ok(Consumed::StreamEnded),
                Some(Err(e)) if crate::mongo::is_fatal(&e) => {
                    error!(coll = %self.collection.coll_name, error = %e, "Unrecoverable change stream error");
                    return Err(e.into());
                }
                Some(Err(e)) => {
                    error!(coll = %self.collection.coll_name, error = %e, "Change stream error");
                    return Ok(Consumed::Failed("stream_error"));
                }
                Some(Ok(event)) => {
                    // Publish and append run to completion even when the
                    // scope is cancelled mid-event: once the bus accepted
                    // the payload its token must land too.
                    match self.forward(&event).await {
                        Ok(()) => {
                            if cancel.is_cancelled() {
                                return Ok(Consumed::Cancelled);
                            }
                        }
                        Err(Error::Nats(e)) => {
                            error!(coll = %self.collection.coll_name, error = %e, "Failed to publish change event");
                            return Ok(Consumed::Failed("publish_error"));
                        }
                        Err(Error::Mongo(e)) => {
                            error!(coll = %self.collection.coll_name, error = %e, "Failed to append resume token");
                            return Ok(Consumed::Failed("token_append_error"));
                        }
                        Err(e) => {
                            error!(coll = %self.collection.coll_name, error = %e, "Failed to encode change event");
                            return Ok(Consumed::Failed("encode_error"));
                        }
                    }
                }
            }
        }
    }

    /// Publish one event on `STREAM.<operationType>` with the token as the
    /// dedup id, then append the token.
    async fn forward(&self, event: &ChangeStreamEvent<Document>) -> Result<(), Error> {
        let Some(token) = token_data(&event.id) else {
            // Empty token data is a protocol violation; skip the event
            // without advancing any state.
            warn!(coll = %self.collection.coll_name, "Change event carries no resume token data, skipping");
            return Ok(());
        };
        let stream = self.collection.stream();
        let operation = operation_name(&event.operation_type);
        let subject = subject(&stream, &operation);
        let payload = serde_json::to_vec(event)?;

        self.publisher.publish(&subject, payload, &token).await?;
        self.metrics.record_event_published(&stream, &operation);

        self.tokens.append(&token).await?;
        self.metrics.record_token_persisted(&self.collection.coll_name);

        debug!(subject = %subject, "Forwarded change event");
        Ok(())
    }

    async fn open(&self) -> mongodb::error::Result<EventStream> {
        let start_after = match self.tokens.last().await? {
            Some(data) => {
                let token = resume_token_from_data(&data);
                if token.is_none() {
                    warn!(coll = %self.collection.coll_name, "Stored resume token is malformed, resuming from now");
                }
                token
            }
            None => None,
        };

        match self.watch_from(start_after.clone()).await {
            Err(e) if start_after.is_some() && crate::mongo::token_invalidated(&e) => {
                warn!(
                    coll = %self.collection.coll_name, error = %e,
                    "Stored resume token is no longer valid, resuming from now; intervening changes are not replayed"
                );
                self.watch_from(None).await
            }
            other => other,
        }
    }

    async fn watch_from(
        &self,
        start_after: Option<ResumeToken>,
    ) -> mongodb::error::Result<EventStream> {
        let mut options = ChangeStreamOptions::default();
        options.full_document = Some(FullDocumentType::UpdateLookup);
        options.full_document_before_change = Some(FullDocumentBeforeChangeType::WhenAvailable);
        options.start_after = start_after;

        self.client
            .database(&self.collection.db_name)
            .collection::<Document>(&self.collection.coll_name)
            .watch()
            .with_options(options)
            .await
    }

    fn restart(&self, reason: &str) {
        self.metrics
            .record_watcher_restart(&self.collection.coll_name, &self.collection.db_name, reason);
    }
}

enum Consumed {
    Cancelled,
    StreamEnded,
    Failed(&'static str),
}

/// Sleep with exponential backoff and full jitter; false when cancelled
/// during the sleep.
async fn backoff(coll_name: &str, attempt: u32, cancel: &CancellationToken) -> bool {
    let delay = backoff_delay(attempt);
    warn!(
        coll = %coll_name,
        attempt,
        delay_ms = delay.as_millis() as u64,
        "Backing off before reopening change stream"
    );
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_INITIAL
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_CAP);
    base.mul_f64(rand::random::<f64>())
}

fn subject(stream: &str, operation: &str) -> String {
    format!("{stream}.{operation}")
}

/// Wire name of the operation type, unknown values passed through verbatim.
fn operation_name(operation_type: &OperationType) -> String {
    serde_json::to_value(operation_type)
        .ok()
        .and_then(|value| value.as_str().map(str::to_owned))
        .unwrap_or_else(|| "unknown".to_owned())
}

/// The `_data` payload of a resume token; `None` for the empty string,
/// which the server never legitimately produces.
fn token_data(token: &ResumeToken) -> Option<String> {
    let raw = bson::to_bson(token).ok()?;
    let data = raw.as_document()?.get_str("_data").ok()?;
    if data.is_empty() {
        return None;
    }
    Some(data.to_owned())
}

fn resume_token_from_data(data: &str) -> Option<ResumeToken> {
    bson::from_bson(Bson::Document(doc! { "_data": data })).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_is_stream_dot_operation() {
        assert_eq!(subject("COLL1", "insert"), "COLL1.insert");
        assert_eq!(subject("COLL1", "dropDatabase"), "COLL1.dropDatabase");
    }

    #[test]
    fn operation_names_match_the_wire() {
        assert_eq!(operation_name(&OperationType::Insert), "insert");
        assert_eq!(operation_name(&OperationType::Update), "update");
        assert_eq!(operation_name(&OperationType::Delete), "delete");
        assert_eq!(operation_name(&OperationType::DropDatabase), "dropDatabase");
    }

    #[test]
    fn token_data_round_trips() {
        let data = "82649C5AF3000000012B0229296E04";
        let token = resume_token_from_data(data).expect("token from _data");
        assert_eq!(token_data(&token).as_deref(), Some(data));
    }

    #[test]
    fn empty_token_data_is_a_protocol_violation() {
        let token = resume_token_from_data("").expect("token from _data");
        assert_eq!(token_data(&token), None);
    }

    #[test]
    fn backoff_is_capped_with_full_jitter() {
        assert!(backoff_delay(1) <= BACKOFF_INITIAL);
        for attempt in 1..64 {
            assert!(backoff_delay(attempt) <= BACKOFF_CAP);
        }
    }
}
