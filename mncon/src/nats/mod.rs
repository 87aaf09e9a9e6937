//! NATS side of the connector: JetStream provisioning and publishing.

pub mod error;
pub mod jetstream;
pub mod publish;

pub use error::Error;

use std::sync::Arc;

use crate::nats::publish::Publish;

/// Publisher handle handed to each watcher; the backend is behind a trait so
/// tests can swap in a fake.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<dyn Publish>,
}

impl Publisher {
    pub fn new(inner: Arc<dyn Publish>) -> Self {
        Self { inner }
    }

    pub async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_id: &str,
    ) -> Result<(), Error> {
        self.inner.publish(subject, payload, dedup_id).await
    }
}
