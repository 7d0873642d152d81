// Pipeline - what happens to one raw message
//
//   raw -> resolve tenant -> relay event (best-effort)
//                         -> build document -> dispatch -> count usage
//
// Failure routing:
//   MalformedEnvelope, UserNotFound          -> logged, dropped
//   DirectoryUnavailable, DispatchFailure    -> raw message to the backlog
//
// DESIGN CHOICE: One context struct instead of globals
// Cache, backlog and collaborator handles are built once at startup and
// shared by Arc between the listeners and the retry task.

use crate::backlog::{Backlog, RequeueOutcome, RetryPolicy};
use crate::counter::UsageCounter;
use crate::directory::UserDirectory;
use crate::document::build_document;
use crate::error::PipelineError;
use crate::relay::{Relay, RelayEvent};
use crate::resolver::KeyResolver;
use crate::search::SearchEngine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};

pub struct Pipeline {
    resolver: KeyResolver,
    engine: Arc<dyn SearchEngine>,
    relay: Arc<dyn Relay>,
    counter: Arc<dyn UsageCounter>,
    backlog: Backlog,
    relay_timeout: Duration,
}

/// Result of one backlog drain
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub delivered: usize,
    pub requeued: usize,
    pub discarded: usize,
}

impl Pipeline {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        engine: Arc<dyn SearchEngine>,
        relay: Arc<dyn Relay>,
        counter: Arc<dyn UsageCounter>,
        policy: RetryPolicy,
        relay_timeout: Duration,
    ) -> Self {
        Self {
            resolver: KeyResolver::new(directory),
            engine,
            relay,
            counter,
            backlog: Backlog::new(policy),
            relay_timeout,
        }
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    /// Entry point for the listeners. Never fails: the sender gets no
    /// acknowledgment either way.
    pub async fn ingest(&self, raw: &str) {
        match self.process(raw).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!("{}, message sent to backlog", e);
                self.backlog.push(raw.to_string());
            }
            Err(e) => {
                tracing::warn!("{}, message dropped", e);
            }
        }
    }

    /// Run one message through resolution, relay, build and dispatch
    pub async fn process(&self, raw: &str) -> Result<(), PipelineError> {
        let resolved = self.resolver.resolve(raw).await?;
        let index = resolved.index.as_str();
        let log_type = resolved.envelope.log_type;
        let payload = resolved.envelope.payload;

        // Live tail sees the message whether or not the index write succeeds
        self.publish(index, log_type, payload).await;

        let document = build_document(payload, Utc::now());
        self.engine
            .create(index, log_type, &document)
            .await
            .map_err(|source| PipelineError::DispatchFailure {
                target: format!("{}/{}", index, log_type),
                source,
            })?;

        tracing::debug!(index, log_type, "message stored");
        self.counter.increment(index).await;
        Ok(())
    }

    async fn publish(&self, index: &str, log_type: &str, payload: &str) {
        let event = RelayEvent::log_message(index, log_type, payload);
        match timeout(self.relay_timeout, self.relay.publish(index, &event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(index, "relay publish failed: {:#}", e),
            Err(_) => tracing::warn!(index, "relay publish timed out"),
        }
    }

    /// Resubmit every due backlog entry through the full pipeline
    pub async fn retry_backlog(&self) -> RetryReport {
        let mut report = RetryReport::default();

        for entry in self.backlog.take_due(Instant::now()) {
            match self.process(&entry.raw).await {
                Ok(()) => {
                    report.delivered += 1;
                    self.backlog.settle(entry);
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(attempts = entry.attempts + 1, "retry failed: {}", e);
                    match self.backlog.requeue(entry) {
                        RequeueOutcome::Requeued => report.requeued += 1,
                        RequeueOutcome::Exhausted => report.discarded += 1,
                    }
                }
                Err(e) => {
                    tracing::warn!("{}, backlog message dropped", e);
                    report.discarded += 1;
                    self.backlog.settle(entry);
                }
            }
        }

        report
    }
}

/// Drain the backlog every `retry_interval` until the process exits
pub async fn run_retry_loop(pipeline: Arc<Pipeline>) {
    let period = pipeline
        .backlog()
        .policy()
        .retry_interval
        .max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if pipeline.backlog().is_empty() {
            continue;
        }

        let report = pipeline.retry_backlog().await;
        tracing::info!(
            delivered = report.delivered,
            requeued = report.requeued,
            discarded = report.discarded,
            remaining = pipeline.backlog().len(),
            "backlog retry finished"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::counter::StatsCounter;
    use crate::relay::tests::RecordingRelay;
    use crate::resolver::tests::FakeDirectory;
    use crate::search::tests::FakeSearchEngine;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    pub(crate) struct Harness {
        pub pipeline: Arc<Pipeline>,
        pub directory: Arc<FakeDirectory>,
        pub engine: Arc<FakeSearchEngine>,
        pub relay: Arc<RecordingRelay>,
        pub counter: Arc<StatsCounter>,
    }

    pub(crate) fn harness_with(relay: RecordingRelay, max_attempts: u32) -> Harness {
        let directory = Arc::new(FakeDirectory::with_user("abc123", "tenant1"));
        let engine = Arc::new(FakeSearchEngine::default());
        let relay = Arc::new(relay);
        let counter = Arc::new(StatsCounter::new());
        let policy = RetryPolicy {
            capacity: 100,
            max_attempts,
            retry_interval: Duration::from_millis(10),
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        };
        let pipeline = Arc::new(Pipeline::new(
            directory.clone(),
            engine.clone(),
            relay.clone(),
            counter.clone(),
            policy,
            Duration::from_secs(1),
        ));
        Harness {
            pipeline,
            directory,
            engine,
            relay,
            counter,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(RecordingRelay::default(), 5)
    }

    #[tokio::test]
    async fn test_plain_text_dispatched() {
        let h = harness();
        h.pipeline.ingest("abc123@app Hello world").await;

        let created = h.engine.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        let (index, doc_type, doc) = &created[0];
        assert_eq!(index, "tenant1");
        assert_eq!(doc_type, "app");
        assert_eq!(doc["message"], json!("Hello world"));
        assert!(doc.contains_key("datetime"));
        assert_eq!(doc.len(), 2);
        assert!(h.pipeline.backlog().is_empty());
    }

    #[tokio::test]
    async fn test_json_dispatched() {
        let h = harness();
        h.pipeline
            .ingest(r#"abc123@app {"level":"error","msg":"boom"}"#)
            .await;

        let created = h.engine.created.lock().unwrap();
        let (index, doc_type, doc) = &created[0];
        assert_eq!(index, "tenant1");
        assert_eq!(doc_type, "app");
        assert_eq!(doc["level"], json!("error"));
        assert_eq!(doc["msg"], json!("boom"));
        assert!(doc.contains_key("datetime"));
        assert_eq!(doc.len(), 3);
    }

    #[tokio::test]
    async fn test_dispatch_failure_backlogs_then_retry_removes() {
        let h = harness();
        let raw = "abc123@app Hello world";

        h.engine.fail.store(true, Ordering::SeqCst);
        h.pipeline.ingest(raw).await;
        assert!(h.pipeline.backlog().contains(raw));
        assert_eq!(h.counter.pending("tenant1"), 0);

        h.engine.fail.store(false, Ordering::SeqCst);
        let report = h.pipeline.retry_backlog().await;
        assert_eq!(report.delivered, 1);
        assert!(h.pipeline.backlog().is_empty());
        assert_eq!(h.engine.created.lock().unwrap().len(), 1);
        assert_eq!(h.counter.pending("tenant1"), 1);

        // Nothing left to resubmit
        let attempts = h.engine.attempts.load(Ordering::SeqCst);
        assert_eq!(h.pipeline.retry_backlog().await, RetryReport::default());
        assert_eq!(h.engine.attempts.load(Ordering::SeqCst), attempts);
    }

    #[tokio::test]
    async fn test_unknown_user_is_dropped() {
        let h = harness();
        h.pipeline.ingest("unknown@app Hello").await;

        assert!(h.pipeline.backlog().is_empty());
        assert_eq!(h.engine.attempts.load(Ordering::SeqCst), 0);
        assert!(h.relay.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_is_dropped() {
        let h = harness();
        h.pipeline.ingest("no tenant prefix").await;

        assert!(h.pipeline.backlog().is_empty());
        assert_eq!(h.engine.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(h.directory.queries.load(Ordering::SeqCst), 0);
        assert!(h.relay.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_outage_backlogs_raw_message() {
        let h = harness();
        let raw = "abc123@app Hello";

        h.directory.unavailable.store(true, Ordering::SeqCst);
        h.pipeline.ingest(raw).await;
        assert!(h.pipeline.backlog().contains(raw));
        assert_eq!(h.engine.attempts.load(Ordering::SeqCst), 0);
        assert!(h.relay.events.lock().unwrap().is_empty());

        h.directory.unavailable.store(false, Ordering::SeqCst);
        let report = h.pipeline.retry_backlog().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(h.engine.created.lock().unwrap()[0].0, "tenant1");
    }

    #[tokio::test]
    async fn test_retry_drops_permanent_failure() {
        let h = harness();
        let raw = "later@app Hello";

        // Directory down: transient, backlogged
        h.directory.unavailable.store(true, Ordering::SeqCst);
        h.pipeline.ingest(raw).await;
        assert!(h.pipeline.backlog().contains(raw));

        // Directory back, but the key is unknown: dropped for good
        h.directory.unavailable.store(false, Ordering::SeqCst);
        let report = h.pipeline.retry_backlog().await;
        assert_eq!(report.discarded, 1);
        assert!(h.pipeline.backlog().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_failure_requeues_until_exhausted() {
        let h = harness_with(RecordingRelay::default(), 2);
        h.engine.fail.store(true, Ordering::SeqCst);
        h.pipeline.ingest("abc123@app x").await;

        let report = h.pipeline.retry_backlog().await;
        assert_eq!(report.requeued, 1);
        assert_eq!(h.pipeline.backlog().len(), 1);

        let report = h.pipeline.retry_backlog().await;
        assert_eq!(report.discarded, 1);
        assert!(h.pipeline.backlog().is_empty());
    }

    #[tokio::test]
    async fn test_relay_fires_even_when_dispatch_fails() {
        let h = harness();
        h.engine.fail.store(true, Ordering::SeqCst);
        h.pipeline.ingest("abc123@app Hello world").await;

        let events = h.relay.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (channel, event) = &events[0];
        assert_eq!(channel, "tenant1");
        assert_eq!(
            event,
            &RelayEvent::log_message("tenant1", "app", "Hello world")
        );
    }

    #[tokio::test]
    async fn test_relay_failure_does_not_affect_dispatch() {
        let h = harness_with(
            RecordingRelay {
                fail: true,
                ..Default::default()
            },
            5,
        );
        h.pipeline.ingest("abc123@app Hello").await;

        assert_eq!(h.engine.created.lock().unwrap().len(), 1);
        assert!(h.pipeline.backlog().is_empty());
        assert_eq!(h.counter.pending("tenant1"), 1);
    }

    #[tokio::test]
    async fn test_counter_only_on_success() {
        let h = harness();
        h.pipeline.ingest("abc123@app one").await;
        h.pipeline.ingest("abc123@app two").await;
        h.engine.fail.store(true, Ordering::SeqCst);
        h.pipeline.ingest("abc123@app three").await;

        assert_eq!(h.counter.pending("tenant1"), 2);
    }

    #[tokio::test]
    async fn test_cache_spans_messages() {
        let h = harness();
        for i in 0..3 {
            h.pipeline.ingest(&format!("abc123@app msg {i}")).await;
        }
        assert_eq!(h.directory.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_loop_drains_backlog() {
        let h = harness();
        h.engine.fail.store(true, Ordering::SeqCst);
        h.pipeline.ingest("abc123@app Hello").await;
        h.engine.fail.store(false, Ordering::SeqCst);

        let task = tokio::spawn(run_retry_loop(h.pipeline.clone()));
        for _ in 0..100 {
            if !h.engine.created.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        assert!(h.pipeline.backlog().is_empty());
        assert_eq!(h.engine.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_loop_survives_zero_interval() {
        let engine = Arc::new(FakeSearchEngine::default());
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(FakeDirectory::with_user("abc123", "tenant1")),
            engine.clone(),
            Arc::new(RecordingRelay::default()),
            Arc::new(StatsCounter::new()),
            RetryPolicy {
                capacity: 10,
                max_attempts: 5,
                retry_interval: Duration::ZERO,
                backoff_base: Duration::ZERO,
                backoff_max: Duration::ZERO,
            },
            Duration::from_secs(1),
        ));
        engine.fail.store(true, Ordering::SeqCst);
        pipeline.ingest("abc123@app Hello").await;
        engine.fail.store(false, Ordering::SeqCst);

        let task = tokio::spawn(run_retry_loop(pipeline.clone()));
        for _ in 0..100 {
            if !engine.created.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!task.is_finished());
        task.abort();
        assert_eq!(engine.created.lock().unwrap().len(), 1);
    }
}
