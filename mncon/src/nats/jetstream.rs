use async_nats::connection::State;
use async_nats::jetstream::stream::StorageType;
use async_nats::jetstream::{self, Context};
use async_nats::HeaderMap;
use tracing::{debug, info, trace, warn};

use super::publish::Publish;
use super::Error;

/// NATS client plus its JetStream context. Cheap to clone; one instance is
/// shared by every watcher in the process.
#[derive(Clone)]
pub struct Client {
    client: async_nats::Client,
    jetstream: Context,
}

impl Client {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = async_nats::connect(url).await?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    /// Create the stream if it is missing: subjects `<name>.*`, file-backed
    /// storage, server defaults for everything else. An existing stream is
    /// used as-is, whatever its configuration.
    pub async fn ensure_stream(&self, name: &str) -> Result<(), Error> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: name.to_string(),
                subjects: vec![format!("{name}.*")],
                storage: StorageType::File,
                ..Default::default()
            })
            .await?;
        info!(stream = %name, "Stream ready");
        Ok(())
    }

    pub async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_id: &str,
    ) -> Result<(), Error> {
        let mut headers = HeaderMap::new();
        headers.insert("Nats-Msg-Id", dedup_id);
        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await?
            .await?;
        if ack.duplicate {
            debug!(subject = %subject, sequence = ack.sequence, "Server deduplicated message");
        } else {
            trace!(subject = %subject, stream = %ack.stream, sequence = ack.sequence, "Published change event");
        }
        Ok(())
    }

    pub fn ping(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    pub async fn close(&self) {
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection");
        }
    }
}

#[async_trait::async_trait]
impl Publish for Client {
    async fn publish(&self, subject: &str, payload: Vec<u8>, dedup_id: &str) -> Result<(), Error> {
        Client::publish(self, subject, payload, dedup_id).await
    }
}
