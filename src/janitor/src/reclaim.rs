//! Remote storage reclamation.
//!
//! Deleting remote content is the only irreversible thing this service
//! does, and the remote side is the flaky one, so every deletion retries a
//! configured number of times with a fixed delay. Only the final attempt's
//! error surfaces; earlier ones are logged. An object that is already gone
//! counts as reclaimed, which is what keeps re-runs convergent after a
//! partial failure.

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{Error as StoreError, ObjectStore};
use url::Url;

/// Path segment marking a repo that was built for one specific update
/// transaction rather than for an image.
const UPDATE_PATH_MARKER: &str = "upd";

/// Storage location (object key or prefix) addressed by an artifact URL:
/// the URL path with the leading separator stripped. Unparseable URLs yield
/// `None`; content that cannot be addressed is left alone.
pub fn storage_location_from_url(url: &str) -> Option<String> {
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::warn!(url, %error, "artifact url is not parseable, leaving storage alone");
            return None;
        }
    };
    let path = parsed.path().trim_start_matches('/');
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

/// Storage prefix of a repo built for an update transaction, or `None` when
/// the URL does not carry the update marker segment (an image build repo,
/// which outlives its update).
pub fn update_storage_prefix(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let is_update_build = parsed
        .path_segments()
        .is_some_and(|mut segments| segments.any(|segment| segment == UPDATE_PATH_MARKER));
    if !is_update_build {
        return None;
    }
    storage_location_from_url(url)
}

/// Retrying deleter for the artifact store. Knows nothing about the fleet
/// database.
pub struct StorageReclaimer {
    store: Arc<dyn ObjectStore>,
    attempts: u32,
    retry_delay: Duration,
}

impl StorageReclaimer {
    pub fn new(store: Arc<dyn ObjectStore>, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    /// Delete a single object, retrying on failure. An object that does not
    /// exist is treated as already reclaimed.
    pub async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let location = ObjectPath::from(key.trim_start_matches('/'));

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.delete(&location).await {
                Ok(()) => return Ok(()),
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(error) if attempt >= self.attempts => {
                    tracing::error!(
                        key,
                        attempts = self.attempts,
                        %error,
                        "object deletion exhausted all attempts"
                    );
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(
                        key,
                        attempt,
                        max_attempts = self.attempts,
                        %error,
                        "object deletion attempt failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Delete every object under a path prefix, retrying on failure. An
    /// empty prefix listing is a success.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let prefix = ObjectPath::from(prefix.trim_start_matches('/'));

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.delete_all_under(&prefix).await {
                Ok(deleted) => {
                    tracing::debug!(prefix = %prefix, deleted, "prefix reclaimed");
                    return Ok(());
                }
                Err(error) if attempt >= self.attempts => {
                    tracing::error!(
                        prefix = %prefix,
                        attempts = self.attempts,
                        %error,
                        "prefix deletion exhausted all attempts"
                    );
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(
                        prefix = %prefix,
                        attempt,
                        max_attempts = self.attempts,
                        %error,
                        "prefix deletion attempt failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn delete_all_under(&self, prefix: &ObjectPath) -> Result<usize, StoreError> {
        let locations = self
            .store
            .list(Some(prefix))
            .map_ok(|meta| meta.location)
            .boxed();
        let deleted = self
            .store
            .delete_stream(locations)
            .try_collect::<Vec<ObjectPath>>()
            .await?;
        Ok(deleted.len())
    }
}
