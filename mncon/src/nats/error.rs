use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("NATS connection error: {0}")]
    Connect(#[from] async_nats::ConnectError),
    #[error("Stream create error: {0}")]
    CreateStream(#[from] async_nats::jetstream::context::CreateStreamError),
    #[error("Publish error: {0}")]
    Publish(#[from] async_nats::jetstream::context::PublishError),
}
