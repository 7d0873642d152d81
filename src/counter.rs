// Usage counter - per-tenant count of documents stored
//
// DESIGN: Increments only touch an in-memory map. A flusher task
// periodically writes one {tenant, count, datetime} document per tenant to
// the stats index. Counts from a failed write are added back and go out with
// the next flush.

use crate::document::{DATETIME_FIELD, Document};
use crate::search::SearchEngine;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const COUNTER_DOC_TYPE: &str = "counter";

#[async_trait]
pub trait UsageCounter: Send + Sync {
    async fn increment(&self, index: &str);
}

#[derive(Default)]
pub struct StatsCounter {
    counts: Mutex<HashMap<String, u64>>,
}

impl StatsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn pending(&self, index: &str) -> u64 {
        self.lock().get(index).copied().unwrap_or(0)
    }

    /// Write accumulated counts to `stats_index`. Returns how many tenants
    /// were flushed successfully.
    pub async fn flush(&self, engine: &dyn SearchEngine, stats_index: &str) -> usize {
        let counts = std::mem::take(&mut *self.lock());
        let mut flushed = 0;

        for (tenant, count) in counts {
            let doc = counter_document(&tenant, count);
            match engine.create(stats_index, COUNTER_DOC_TYPE, &doc).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    tracing::warn!(tenant = %tenant, count, "stats flush failed: {:#}", e);
                    *self.lock().entry(tenant).or_insert(0) += count;
                }
            }
        }

        flushed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl UsageCounter for StatsCounter {
    async fn increment(&self, index: &str) {
        *self.lock().entry(index.to_string()).or_insert(0) += 1;
    }
}

fn counter_document(tenant: &str, count: u64) -> Document {
    let mut doc = Document::new();
    doc.insert("tenant".to_string(), Value::from(tenant));
    doc.insert("count".to_string(), Value::from(count));
    doc.insert(
        DATETIME_FIELD.to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true)),
    );
    doc
}

/// Periodically flush `counter` until the process exits
pub async fn run_flush_loop(
    counter: Arc<StatsCounter>,
    engine: Arc<dyn SearchEngine>,
    stats_index: String,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
    interval.tick().await; // First tick fires immediately

    loop {
        interval.tick().await;
        let flushed = counter.flush(engine.as_ref(), &stats_index).await;
        if flushed > 0 {
            tracing::debug!(tenants = flushed, "usage counters flushed");
        }
    }
}
