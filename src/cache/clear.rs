//! Full cache sweep.

use tracing::info;

use super::error::CacheError;
use super::store::CacheStore;

/// Remove every entry from `store`, reporting progress lines to `sink`.
///
/// Stores that can enumerate their keys are cleared one key at a time;
/// others are flushed wholesale. Returns the number of keys removed, or 0
/// after a wholesale flush.
pub async fn clear_cache(
    store: &dyn CacheStore,
    sink: &mut (dyn FnMut(&str) + Send),
) -> Result<usize, CacheError> {
    let Some(keys) = store.keys().await? else {
        sink("Flushing all cache entries");
        store.flush_all().await?;
        sink("Cache flushed");
        info!(mode = "flush_all", "cache cleared");
        return Ok(0);
    };

    sink(&format!("Clearing {} cache entries", keys.len()));
    let mut removed = 0;
    for key in &keys {
        if store.delete(key).await? {
            removed += 1;
            sink(&format!("Deleted {key}"));
        }
    }
    sink(&format!("Cleared {removed} cache entries"));
    info!(mode = "sweep", removed, "cache cleared");
    Ok(removed)
}
