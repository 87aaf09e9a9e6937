use mongodb::bson::doc;
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};

/// Append-only log of change-stream resume tokens for one watched
/// collection. The newest record marks the last event that was durably
/// published, and is the only state consulted on restart.
pub struct TokenStore {
    collection: Collection<TokenRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenRecord {
    value: String,
}

impl TokenStore {
    pub fn new(client: &Client, db_name: &str, coll_name: &str) -> Self {
        let collection = client.database(db_name).collection(coll_name);
        Self { collection }
    }

    /// Append a token. On capped collections the oldest records are evicted
    /// by the server; that is expected.
    pub async fn append(&self, value: &str) -> mongodb::error::Result<()> {
        self.collection
            .insert_one(TokenRecord {
                value: value.to_owned(),
            })
            .await?;
        Ok(())
    }

    /// The most recently inserted token, by natural order.
    pub async fn last(&self) -> mongodb::error::Result<Option<String>> {
        let newest = self
            .collection
            .find_one(doc! {})
            .sort(doc! { "$natural": -1 })
            .await?;
        Ok(newest.map(|record| record.value))
    }
}
