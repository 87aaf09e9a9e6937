//! Supervisor: provisions resources, then runs one watcher per collection
//! plus the HTTP endpoint under a shared cancellation scope.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Collection, Settings};
use crate::health::{self, AppState};
use crate::metrics::Metrics;
use crate::mongo::watcher::CollectionWatcher;
use crate::mongo::{self, CollectionSpec};
use crate::nats::publish::Publish;
use crate::nats::{jetstream, Publisher};

const RETRY_DELAY: Duration = Duration::from_secs(5);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum Error {
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("NATS error: {0}")]
    Nats(#[from] crate::nats::Error),
    #[error("Watcher error in collection '{collection}': {source}")]
    Watcher {
        #[source]
        source: crate::mongo::watcher::Error,
        collection: String,
    },
    #[error("HTTP server error: {0}")]
    Http(#[from] std::io::Error),
    #[error("Task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs the connector: connects both clients, ensures the watched
/// collection, token collection, and stream for every configured
/// collection, then supervises the watcher tasks and the HTTP endpoint
/// until a fatal error or a shutdown signal.
pub struct Server {
    settings: Settings,
    metrics: Metrics,
}

impl Server {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            metrics: Metrics::new(),
        }
    }

    pub fn with_metrics(settings: Settings, metrics: Metrics) -> Self {
        Self { settings, metrics }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Generic retry function with timeout for connection operations.
    async fn retry_with_timeout<T, F, Fut, E>(
        operation: F,
        timeout: Duration,
        retry_delay: Duration,
        operation_name: &str,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Debug,
    {
        let start_time = std::time::Instant::now();

        loop {
            match operation().await {
                Ok(result) => {
                    info!("{} successful", operation_name);
                    return Ok(result);
                }
                Err(e) => {
                    error!(error = ?e, "Failed {}", operation_name);

                    if start_time.elapsed() >= timeout {
                        error!("{} attempts timed out after {:?}", operation_name, timeout);
                        return Err(e);
                    }

                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    async fn connect_to_mongo(settings: &Settings) -> Result<mongodb::Client, Error> {
        let uri = settings.mongo.uri.clone();

        Self::retry_with_timeout(
            || async {
                let client = mongodb::Client::with_uri_str(&uri).await?;
                mongo::ping(&client).await?;
                Ok::<_, mongodb::error::Error>(client)
            },
            CONNECTION_TIMEOUT,
            RETRY_DELAY,
            "MongoDB connection initialization",
        )
        .await
        .map_err(Error::Mongo)
    }

    async fn connect_to_nats(settings: &Settings) -> Result<jetstream::Client, Error> {
        let url = settings.nats.url.clone();

        Self::retry_with_timeout(
            || async { jetstream::Client::connect(&url).await },
            CONNECTION_TIMEOUT,
            RETRY_DELAY,
            "NATS connection initialization",
        )
        .await
        .map_err(Error::Nats)
    }

    async fn connect_clients(
        settings: &Settings,
    ) -> Result<(mongodb::Client, jetstream::Client), Error> {
        tokio::try_join!(
            Self::connect_to_mongo(settings),
            Self::connect_to_nats(settings)
        )
    }

    /// Ensure the watched collection, the token collection, and the stream,
    /// in that order. The watcher relies on all three existing.
    async fn ensure_resources(
        mongo_client: &mongodb::Client,
        nats_client: &jetstream::Client,
        collection: &Collection,
    ) -> Result<(), Error> {
        mongo::ensure_collection(
            mongo_client,
            &collection.db_name,
            &collection.coll_name,
            &CollectionSpec {
                pre_and_post_images: collection.change_stream_pre_and_post_images,
                ..Default::default()
            },
        )
        .await?;

        mongo::ensure_collection(
            mongo_client,
            &collection.tokens_db_name,
            &collection.tokens_coll_name,
            &CollectionSpec {
                capped: collection.capped(),
                size_in_bytes: collection.tokens_coll_size,
                ..Default::default()
            },
        )
        .await?;

        nats_client.ensure_stream(&collection.stream()).await?;
        Ok(())
    }

    /// Run the connector until a fatal error or a shutdown signal.
    pub async fn serve(&self) -> Result<(), Error> {
        let (mongo_client, nats_client) = Self::connect_clients(&self.settings).await?;

        for collection in &self.settings.collections {
            Self::ensure_resources(&mongo_client, &nats_client, collection).await?;
        }

        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone());

        let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();

        let state = Arc::new(AppState {
            mongo: mongo_client.clone(),
            nats: nats_client.clone(),
            metrics: self.metrics.clone(),
        });
        let app = Router::new()
            .route("/healthz", get(health::healthz))
            .route("/metrics", get(health::metrics))
            .with_state(state);
        let addr = listen_addr(&self.settings.addr);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr = %addr, "Connector started");
        {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(cancel.cancelled_owned())
                    .await
                    .map_err(Error::Http)
            });
        }

        let backend: Arc<dyn Publish> = Arc::new(nats_client.clone());
        for collection in &self.settings.collections {
            info!(collection = %collection.coll_name, "Starting watcher for collection");
            let watcher = CollectionWatcher::new(
                mongo_client.clone(),
                collection.clone(),
                Publisher::new(backend.clone()),
                self.metrics.clone(),
            );
            let coll_name = collection.coll_name.clone();
            let child = cancel.child_token();
            tasks.spawn(async move {
                watcher.run(child).await.map_err(|source| Error::Watcher {
                    source,
                    collection: coll_name,
                })
            });
        }
        self.metrics
            .set_running_watchers(self.settings.collections.len());

        let result = self.supervise(&mut tasks, &cancel).await;
        self.metrics.set_running_watchers(0);

        nats_client.close().await;
        mongo_client.shutdown().await;

        result
    }

    /// Wait for tasks; the first failure cancels the scope and becomes the
    /// exit reason, a shutdown signal drains everything cleanly.
    async fn supervise(
        &self,
        tasks: &mut JoinSet<Result<(), Error>>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let grace = self.settings.shutdown_grace();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Connector gracefully shutting down");
                    drain(tasks, grace).await;
                    return Ok(());
                }
                next = tasks.join_next() => match next {
                    None => return Ok(()),
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Task failed, shutting down");
                        cancel.cancel();
                        drain(tasks, grace).await;
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Task panicked, shutting down");
                        cancel.cancel();
                        drain(tasks, grace).await;
                        return Err(e.into());
                    }
                }
            }
        }
    }
}

/// Join the remaining tasks, aborting whatever outlives the grace window.
async fn drain(tasks: &mut JoinSet<Result<(), Error>>, grace: Duration) {
    let drained = timeout(grace, async {
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Task failed during shutdown"),
                Err(e) => warn!(error = %e, "Task panicked during shutdown"),
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!("Shutdown grace period elapsed, aborting remaining tasks");
        tasks.abort_all();
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "Failed to listen for shutdown signals");
            return;
        }
        info!("Shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Accepts Go-style `":8080"` listen addresses by binding all interfaces.
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_owned()
    }
}
