//! MongoDB side of the connector: collection provisioning, health, and the
//! change-stream watcher.

pub mod resume_tokens;
pub mod watcher;

use mongodb::bson::doc;
use mongodb::error::ErrorKind;
use mongodb::Client;
use tracing::{debug, info};

const NAMESPACE_EXISTS: i32 = 48;

// Command error codes after which a stored resume token is unusable:
// InvalidResumeToken, ChangeStreamFatalError, ChangeStreamHistoryLost.
const NON_RESUMABLE: [i32; 3] = [260, 280, 286];

/// Options for collections created by the ensurer. Watched collections ask
/// for pre-/post-images, token collections may be capped.
#[derive(Debug, Default, Clone)]
pub struct CollectionSpec {
    pub capped: bool,
    pub size_in_bytes: Option<i64>,
    pub pre_and_post_images: bool,
}

/// Create `db.coll` with the requested options if it does not exist yet.
/// A pre-existing collection is accepted as-is, whatever its options.
pub async fn ensure_collection(
    client: &Client,
    db_name: &str,
    coll_name: &str,
    spec: &CollectionSpec,
) -> mongodb::error::Result<()> {
    let mut command = doc! { "create": coll_name };
    if spec.capped {
        command.insert("capped", true);
        command.insert("size", spec.size_in_bytes.unwrap_or(4096));
    }
    if spec.pre_and_post_images {
        command.insert("changeStreamPreAndPostImages", doc! { "enabled": true });
    }

    match client.database(db_name).run_command(command).await {
        Ok(_) => {
            info!(db = %db_name, coll = %coll_name, "Created collection");
            Ok(())
        }
        Err(e) if command_error_code(&e) == Some(NAMESPACE_EXISTS) => {
            debug!(db = %db_name, coll = %coll_name, "Collection already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub async fn ping(client: &Client) -> mongodb::error::Result<()> {
    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await?;
    Ok(())
}

fn command_error_code(err: &mongodb::error::Error) -> Option<i32> {
    match *err.kind {
        ErrorKind::Command(ref command) => Some(command.code),
        _ => None,
    }
}

/// The server rejected the resume token itself; reopening with the same
/// token will never succeed.
pub(crate) fn token_invalidated(err: &mongodb::error::Error) -> bool {
    command_error_code(err).is_some_and(|code| NON_RESUMABLE.contains(&code))
}

/// Errors that reconnecting cannot fix.
pub(crate) fn is_fatal(err: &mongodb::error::Error) -> bool {
    matches!(*err.kind, ErrorKind::Authentication { .. })
}
