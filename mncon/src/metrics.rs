//! Prometheus metrics for the connector.

use std::sync::Arc;

use prometheus::{CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

/// Metrics collector shared by the supervisor and every watcher.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    events_published: Arc<CounterVec>,
    tokens_persisted: Arc<CounterVec>,
    watcher_restarts: Arc<CounterVec>,
    running_watchers: Arc<Gauge>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let events_published = Arc::new(
            CounterVec::new(
                Opts::new(
                    "mncon_events_published_total",
                    "Change events durably accepted by the bus",
                ),
                &["stream", "operation"],
            )
            .expect("Failed to create events_published counter"),
        );

        let tokens_persisted = Arc::new(
            CounterVec::new(
                Opts::new(
                    "mncon_resume_tokens_persisted_total",
                    "Resume tokens appended after a successful publish",
                ),
                &["collection"],
            )
            .expect("Failed to create tokens_persisted counter"),
        );

        let watcher_restarts = Arc::new(
            CounterVec::new(
                Opts::new(
                    "mncon_watcher_restarts_total",
                    "Change stream reopens per collection and reason",
                ),
                &["collection", "database", "reason"],
            )
            .expect("Failed to create watcher_restarts counter"),
        );

        let running_watchers = Arc::new(
            Gauge::with_opts(Opts::new(
                "mncon_running_watchers",
                "Number of collection watchers currently running",
            ))
            .expect("Failed to create running_watchers gauge"),
        );

        registry
            .register(Box::new((*events_published).clone()))
            .expect("Failed to register events_published metric");
        registry
            .register(Box::new((*tokens_persisted).clone()))
            .expect("Failed to register tokens_persisted metric");
        registry
            .register(Box::new((*watcher_restarts).clone()))
            .expect("Failed to register watcher_restarts metric");
        registry
            .register(Box::new((*running_watchers).clone()))
            .expect("Failed to register running_watchers metric");

        Self {
            registry,
            events_published,
            tokens_persisted,
            watcher_restarts,
            running_watchers,
        }
    }

    pub fn record_event_published(&self, stream: &str, operation: &str) {
        self.events_published
            .with_label_values(&[stream, operation])
            .inc();
    }

    pub fn record_token_persisted(&self, collection: &str) {
        self.tokens_persisted.with_label_values(&[collection]).inc();
    }

    pub fn record_watcher_restart(&self, collection: &str, database: &str, reason: &str) {
        self.watcher_restarts
            .with_label_values(&[collection, database, reason])
            .inc();
    }

    pub fn set_running_watchers(&self, count: usize) {
        self.running_watchers.set(count as f64);
    }

    pub fn running_watchers(&self) -> usize {
        self.running_watchers.get() as usize
    }

    /// Export all metrics in Prometheus text format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}
