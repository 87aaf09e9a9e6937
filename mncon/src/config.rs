//! Settings model and loading for the connector.

use std::collections::HashSet;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Mongo {
    pub uri: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Nats {
    pub url: String,
}

/// One watched collection: where to tail changes, where to persist resume
/// tokens, and which stream receives the events.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub db_name: String,
    pub coll_name: String,
    pub change_stream_pre_and_post_images: bool,
    pub tokens_db_name: String,
    pub tokens_coll_name: String,
    pub tokens_coll_capped: Option<bool>,
    pub tokens_coll_size: Option<i64>,
    pub stream_name: String,
}

impl Collection {
    pub fn capped(&self) -> bool {
        self.tokens_coll_capped.unwrap_or(false)
    }

    /// Stream name as published on the bus.
    pub fn stream(&self) -> String {
        self.stream_name.to_uppercase()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub addr: String,
    pub log: Log,
    pub mongo: Mongo,
    pub nats: Nats,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    pub collections: Vec<Collection>,
}

fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

#[derive(Debug, Deserialize)]
struct Root {
    connector: Settings,
}

/// Load settings from a YAML file, with `MNCON_`-prefixed environment
/// variables layered on top (`MNCON_CONNECTOR__MONGO__URI` and friends).
pub fn load(path: &str) -> Result<Settings, Error> {
    let config = Config::builder()
        .add_source(File::with_name(path))
        .add_source(Environment::with_prefix("MNCON").separator("__"))
        .build()?;
    let root: Root = config.try_deserialize()?;
    root.connector.validate()?;
    Ok(root.connector)
}

impl Settings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.collections.is_empty() {
            return Err(Error::Invalid("no collections configured".into()));
        }
        let mut streams = HashSet::new();
        let mut watched = HashSet::new();
        for coll in &self.collections {
            for (field, value) in [
                ("dbName", &coll.db_name),
                ("collName", &coll.coll_name),
                ("tokensDbName", &coll.tokens_db_name),
                ("tokensCollName", &coll.tokens_coll_name),
                ("streamName", &coll.stream_name),
            ] {
                if value.is_empty() {
                    return Err(Error::Invalid(format!(
                        "{} must not be empty (collection '{}')",
                        field, coll.coll_name
                    )));
                }
            }
            if !streams.insert(coll.stream()) {
                return Err(Error::Invalid(format!(
                    "duplicate stream name '{}'",
                    coll.stream()
                )));
            }
            if !watched.insert((coll.db_name.clone(), coll.coll_name.clone())) {
                return Err(Error::Invalid(format!(
                    "collection '{}.{}' is configured more than once",
                    coll.db_name, coll.coll_name
                )));
            }
            match (coll.capped(), coll.tokens_coll_size) {
                (true, None) => {
                    return Err(Error::Invalid(format!(
                        "tokensCollSize is required when tokensCollCapped is set ('{}')",
                        coll.tokens_coll_name
                    )));
                }
                (true, Some(size)) if size <= 0 => {
                    return Err(Error::Invalid(format!(
                        "tokensCollSize must be positive ('{}')",
                        coll.tokens_coll_name
                    )));
                }
                (false, Some(_)) => {
                    return Err(Error::Invalid(format!(
                        "tokensCollSize is only valid for capped collections ('{}')",
                        coll.tokens_coll_name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
