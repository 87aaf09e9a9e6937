use async_trait::async_trait;

use super::Error;

#[async_trait]
pub trait Publish: Send + Sync {
    /// Publish `payload` on `subject`, returning once the bus has durably
    /// accepted it. `dedup_id` is the server-side deduplication key.
    async fn publish(&self, subject: &str, payload: Vec<u8>, dedup_id: &str) -> Result<(), Error>;
}
