pub mod auth;
pub mod error;
pub mod friends;
pub mod groups;
pub mod messages;
pub mod middleware;

use chatline_db::Database;
use tracing::error;

use crate::auth::AppState;
use crate::error::ApiError;

/// Run a blocking database call off the async runtime.
pub(crate) async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("worker failed"))
        })?
        .map_err(ApiError::from)
}
