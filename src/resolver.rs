// Key resolver - maps a message's api key to its tenant's index name
//
// DESIGN: Process-lifetime cache in front of the user directory.
// - Keyed by api key, value is the index name
// - No eviction, no expiry: a rotated key stays cached until restart
// - Only successful lookups are cached; unknown keys and directory errors
//   go back to the directory next time
// - Concurrent first lookups of one key share a single directory query

use crate::directory::UserDirectory;
use crate::envelope::Envelope;
use crate::error::PipelineError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// A message whose tenant is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<'a> {
    pub index: String,
    pub envelope: Envelope<'a>,
}

pub struct KeyResolver {
    directory: Arc<dyn UserDirectory>,
    cache: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
}

impl KeyResolver {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            directory,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve<'a>(&self, raw: &'a str) -> Result<Resolved<'a>, PipelineError> {
        let envelope = Envelope::parse(raw)?;
        let index = self.index_for(envelope.api_key).await?;
        Ok(Resolved { index, envelope })
    }

    async fn index_for(&self, api_key: &str) -> Result<String, PipelineError> {
        let cell = self.cell_for(api_key);
        if let Some(index) = cell.get() {
            return Ok(index.clone());
        }

        let result = cell
            .get_or_try_init(|| async move {
                match self.directory.find_index_by_api_key(api_key).await {
                    Ok(Some(index)) => {
                        tracing::debug!(api_key, index = %index, "api key resolved");
                        Ok(index)
                    }
                    Ok(None) => Err(PipelineError::UserNotFound(api_key.to_string())),
                    Err(e) => Err(PipelineError::DirectoryUnavailable(e)),
                }
            })
            .await
            .cloned();

        if result.is_err() {
            self.forget_unresolved(api_key, &cell);
        }
        result
    }

    fn cell_for(&self, api_key: &str) -> Arc<OnceCell<String>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(api_key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    // Unknown keys must not pile up as empty cells. A cell other lookups
    // still wait on stays: one of them may resolve it next.
    fn forget_unresolved(&self, api_key: &str, cell: &Arc<OnceCell<String>>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = cache.get(api_key)
            && Arc::ptr_eq(current, cell)
            && Arc::strong_count(cell) == 2 // the map and us
            && !current.initialized()
        {
            cache.remove(api_key);
        }
    }

    #[cfg(test)]
    fn cached_keys(&self) -> usize {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.values().filter(|cell| cell.initialized()).count()
    }
}
