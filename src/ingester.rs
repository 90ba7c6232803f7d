//! Stream ingestion.
//!
//! One [`Ingester`] per bucket. It owns the bucket's [`LockGuard`], pulls
//! payloads from a [`PostSource`] one at a time, and increments a counter per
//! extracted hashtag. Transport trouble leads to a backed-off reconnect;
//! per-message trouble leads to a skip. Whatever ends the run, the lock is
//! released before [`Ingester::run`] returns.
//!
//! Increments are not deduplicated against message ids, so a payload the
//! upstream redelivers after a reconnect is counted again.

use crate::backoff::ExponentialBackoff;
use crate::error::CounterError;
use crate::hashtag::extract_hashtags;
use crate::lock::{InstanceLock, LockGuard};
use crate::source::{PostSource, SourceError};
use crate::store::{counter_key, CounterStore};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("another ingester already holds lock '{0}'")]
    DuplicateInstance(String),

    #[error("lock '{0}' was taken over while streaming")]
    LockLost(String),

    #[error("store failed for {failures} consecutive messages: {source}")]
    StoreUnavailable {
        failures: u32,
        #[source]
        source: CounterError,
    },

    #[error(transparent)]
    Store(#[from] CounterError),
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub lock_lease: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub rate_limit_initial: Duration,
    pub rate_limit_max: Duration,
    /// Consecutive messages whose increments fail before the run gives up.
    pub max_store_failures: u32,
    pub progress_every: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            lock_lease: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(320),
            rate_limit_initial: Duration::from_secs(60),
            rate_limit_max: Duration::from_secs(960),
            max_store_failures: 10,
            progress_every: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngesterState {
    Unlocked,
    LockedAndConnecting,
    Streaming,
    Error,
    Reconnecting,
    Terminating,
}

/// What happened to a single payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Decoded; this many counters were incremented.
    Counted(usize),
    Malformed,
    MissingText,
    LimitNotice,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub received: u64,
    pub counted: u64,
    pub skipped: u64,
    pub hashtags: u64,
    pub reconnects: u64,
    pub store_failures: u64,
}

#[derive(Deserialize)]
struct Post {
    text: Option<serde_json::Value>,
    limit: Option<serde_json::Value>,
}

pub struct Ingester {
    bucket: String,
    store: Arc<dyn CounterStore>,
    source: Arc<dyn PostSource>,
    lock: LockGuard,
    settings: IngestSettings,
    state: IngesterState,
    summary: IngestSummary,
    consecutive_store_failures: u32,
}

impl Ingester {
    pub fn new(
        bucket: &str,
        store: Arc<dyn CounterStore>,
        source: Arc<dyn PostSource>,
        lock: LockGuard,
        settings: IngestSettings,
    ) -> Self {
        Self {
            bucket: bucket.to_string(),
            store,
            source,
            lock,
            settings,
            state: IngesterState::LockedAndConnecting,
            summary: IngestSummary::default(),
            consecutive_store_failures: 0,
        }
    }

    pub fn state(&self) -> IngesterState {
        self.state
    }

    pub fn summary(&self) -> &IngestSummary {
        &self.summary
    }

    /// Streams until `shutdown` resolves or a fatal error occurs, then
    /// releases the lock.
    pub async fn run<F>(mut self, shutdown: F) -> Result<IngestSummary, IngestError>
    where
        F: Future<Output = ()>,
    {
        let span = info_span!("ingester", bucket = %self.bucket);
        async move {
            info!("hashtag stream starting up");
            let result = self.stream_until(shutdown).await;

            self.transition(IngesterState::Terminating);
            if let Err(err) = self.lock.release().await {
                error!(lock = %self.lock.name(), error = %err, "failed to release lock");
            }
            self.transition(IngesterState::Unlocked);

            info!(
                received = self.summary.received,
                counted = self.summary.counted,
                skipped = self.summary.skipped,
                hashtags = self.summary.hashtags,
                reconnects = self.summary.reconnects,
                "hashtag stream stopped"
            );
            result.map(|()| self.summary.clone())
        }
        .instrument(span)
        .await
    }

    /// Decodes one payload and increments a counter per hashtag.
    ///
    /// Returns a store error as soon as one increment fails; increments already
    /// issued for the payload stay applied.
    pub async fn handle_message(&mut self, payload: &str) -> Result<MessageOutcome, CounterError> {
        self.summary.received += 1;
        if self.settings.progress_every > 0 && self.summary.received % self.settings.progress_every == 0 {
            info!(received = self.summary.received, "received posts");
        }

        let post: Post = match serde_json::from_str(payload) {
            Ok(post) => post,
            Err(err) => {
                warn!(error = %err, "could not decode stream payload");
                self.summary.skipped += 1;
                return Ok(MessageOutcome::Malformed);
            }
        };

        let text = match post.text {
            Some(serde_json::Value::String(text)) => text,
            Some(other) => {
                warn!(text = %other, "stream payload text is not a string");
                self.summary.skipped += 1;
                return Ok(MessageOutcome::MissingText);
            }
            None if post.limit.is_some() => {
                warn!(notice = ?post.limit, "upstream rate limit notice");
                self.summary.skipped += 1;
                return Ok(MessageOutcome::LimitNotice);
            }
            None => {
                warn!("no text in stream payload");
                self.summary.skipped += 1;
                return Ok(MessageOutcome::MissingText);
            }
        };

        let hashtags = extract_hashtags(&text);
        for hashtag in &hashtags {
            let value = self.store.increment(&counter_key(&self.bucket, hashtag)).await?;
            self.summary.hashtags += 1;
            debug!(hashtag = %hashtag, count = value, "incremented");
        }

        self.summary.counted += 1;
        Ok(MessageOutcome::Counted(hashtags.len()))
    }

    async fn stream_until<F>(&mut self, shutdown: F) -> Result<(), IngestError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let lost = self.lock.lost_signal();
        let mut reconnect =
            ExponentialBackoff::new(self.settings.reconnect_initial, self.settings.reconnect_max);
        let mut rate_limit =
            ExponentialBackoff::new(self.settings.rate_limit_initial, self.settings.rate_limit_max);

        loop {
            let connected = tokio::select! {
                biased;
                _ = shutdown.as_mut() => return Ok(()),
                _ = lost.notified() => return Err(IngestError::LockLost(self.lock.name().to_string())),
                connected = self.source.connect(&self.bucket) => connected,
            };

            let failure = match connected {
                Ok(mut stream) => {
                    self.transition(IngesterState::Streaming);
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = shutdown.as_mut() => return Ok(()),
                            _ = lost.notified() => return Err(IngestError::LockLost(self.lock.name().to_string())),
                            next = stream.next() => next,
                        };

                        match next {
                            Some(Ok(payload)) => {
                                reconnect.reset();
                                rate_limit.reset();
                                self.process(&payload).await?;
                            }
                            Some(Err(err)) => break Some(err),
                            None => break None,
                        }
                    }
                }
                Err(err) => Some(err),
            };

            self.transition(IngesterState::Error);
            let delay = match &failure {
                Some(err) if err.is_rate_limit() => {
                    error!(error = %err, "reached upstream request limit");
                    rate_limit.next_delay()
                }
                Some(err @ SourceError::Timeout(_)) => {
                    error!(error = %err, "upstream timeout");
                    reconnect.next_delay()
                }
                Some(err) => {
                    error!(error = %err, "upstream connection error");
                    reconnect.next_delay()
                }
                None => {
                    warn!("upstream closed the stream");
                    reconnect.next_delay()
                }
            };

            self.transition(IngesterState::Reconnecting);
            self.summary.reconnects += 1;
            info!(delay = ?delay, attempt = reconnect.attempt() + rate_limit.attempt(), "reconnecting");
            if pause(delay, shutdown.as_mut()).await {
                return Ok(());
            }
        }
    }

    async fn process(&mut self, payload: &str) -> Result<(), IngestError> {
        match self.handle_message(payload).await {
            Ok(_) => {
                self.consecutive_store_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.consecutive_store_failures += 1;
                self.summary.store_failures += 1;
                self.summary.skipped += 1;
                if self.consecutive_store_failures >= self.settings.max_store_failures {
                    error!(
                        failures = self.consecutive_store_failures,
                        error = %err,
                        "counter store unavailable, giving up"
                    );
                    return Err(IngestError::StoreUnavailable {
                        failures: self.consecutive_store_failures,
                        source: err,
                    });
                }
                warn!(
                    failures = self.consecutive_store_failures,
                    error = %err,
                    "failed to record hashtags, skipping post"
                );
                Ok(())
            }
        }
    }

    fn transition(&mut self, next: IngesterState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "ingester state");
            self.state = next;
        }
    }
}

/// Sleeps for `delay`. Returns true if shutdown arrived first.
async fn pause<F>(delay: Duration, shutdown: Pin<&mut F>) -> bool
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Takes the bucket lock and runs an ingester until shutdown.
///
/// Fails with [`IngestError::DuplicateInstance`] without touching the store or
/// the upstream when another instance holds `lock_name`.
pub async fn launch<F>(
    bucket: &str,
    lock_name: &str,
    store: Arc<dyn CounterStore>,
    locks: Arc<dyn InstanceLock>,
    source: Arc<dyn PostSource>,
    settings: IngestSettings,
    shutdown: F,
) -> Result<IngestSummary, IngestError>
where
    F: Future<Output = ()>,
{
    let Some(lock) = LockGuard::acquire(locks, lock_name, settings.lock_lease).await? else {
        warn!(lock = %lock_name, "could not acquire lock, another instance is running");
        return Err(IngestError::DuplicateInstance(lock_name.to_string()));
    };

    Ingester::new(bucket, store, source, lock, settings)
        .run(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::source::PostStream;
    use async_trait::async_trait;

    struct NoSource;

    #[async_trait]
    impl PostSource for NoSource {
        async fn connect(&self, _track: &str) -> Result<PostStream, SourceError> {
            Ok(futures::stream::pending().boxed())
        }
    }

    /// Emits `#tick` every few milliseconds, forever.
    struct TickingSource;

    #[async_trait]
    impl PostSource for TickingSource {
        async fn connect(&self, _track: &str) -> Result<PostStream, SourceError> {
            Ok(futures::stream::unfold((), |()| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some((Ok(r##"{"text": "#tick"}"##.to_string()), ()))
            })
            .boxed())
        }
    }

    async fn ingester(store: &Arc<MemoryStore>, bucket: &str) -> Ingester {
        let lock = LockGuard::acquire(store.clone(), "lock:test", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        Ingester::new(bucket, store.clone(), Arc::new(NoSource), lock, IngestSettings::default())
    }

    #[tokio::test]
    async fn test_case_variants_share_a_counter() {
        let store = Arc::new(MemoryStore::new());
        let mut ingester = ingester(&store, "x").await;
        for text in ["#A", "#a", "#a"] {
            let payload = serde_json::json!({ "text": text }).to_string();
            assert_eq!(
                ingester.handle_message(&payload).await.unwrap(),
                MessageOutcome::Counted(1)
            );
        }
        assert_eq!(store.get("x:a"), Some(3));
        ingester.lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_skips_are_classified() {
        let store = Arc::new(MemoryStore::new());
        let mut ingester = ingester(&store, "x").await;

        assert_eq!(ingester.handle_message("not json").await.unwrap(), MessageOutcome::Malformed);
        assert_eq!(ingester.handle_message("[1, 2]").await.unwrap(), MessageOutcome::Malformed);
        assert_eq!(
            ingester.handle_message(r#"{"id": 7}"#).await.unwrap(),
            MessageOutcome::MissingText
        );
        assert_eq!(
            ingester.handle_message(r#"{"text": 42}"#).await.unwrap(),
            MessageOutcome::MissingText
        );
        assert_eq!(
            ingester.handle_message(r#"{"text": null, "id": 8}"#).await.unwrap(),
            MessageOutcome::MissingText
        );
        assert_eq!(
            ingester.handle_message(r#"{"limit": {"track": 12}}"#).await.unwrap(),
            MessageOutcome::LimitNotice
        );
        assert_eq!(
            ingester.handle_message(r#"{"text": "nothing tagged"}"#).await.unwrap(),
            MessageOutcome::Counted(0)
        );

        let summary = ingester.summary().clone();
        assert_eq!(summary.received, 7);
        assert_eq!(summary.skipped, 6);
        assert_eq!(summary.counted, 1);
        assert!(store.is_empty());
        ingester.lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_tag_in_one_post_counts_twice() {
        let store = Arc::new(MemoryStore::new());
        let mut ingester = ingester(&store, "charity").await;
        let payload = r#"{"text": "Love #Charity and #CHARITY work #giving"}"#;

        assert_eq!(
            ingester.handle_message(payload).await.unwrap(),
            MessageOutcome::Counted(3)
        );
        assert_eq!(store.get("charity:charity"), Some(2));
        assert_eq!(store.get("charity:giving"), Some(1));
        assert_eq!(ingester.summary().hashtags, 3);
        ingester.lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_releases() {
        let store = Arc::new(MemoryStore::new());
        let ingester = ingester(&store, "x").await;
        assert!(store.lock_holder("lock:test").is_some());

        let summary = ingester.run(async {}).await.unwrap();
        assert_eq!(summary, IngestSummary::default());
        assert!(store.lock_holder("lock:test").is_none());
    }

    #[tokio::test]
    async fn test_lost_lock_stops_counting_and_keeps_new_holder() {
        let store = Arc::new(MemoryStore::new());
        let lock = LockGuard::acquire(store.clone(), "lock:test", Duration::from_millis(150))
            .await
            .unwrap()
            .unwrap();
        let ingester = Ingester::new(
            "x",
            store.clone(),
            Arc::new(TickingSource),
            lock,
            IngestSettings::default(),
        );

        let (result, ticks_at_takeover) = tokio::time::timeout(
            Duration::from_secs(5),
            async {
                tokio::join!(ingester.run(std::future::pending::<()>()), async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    store.steal_lock("lock:test", "intruder", Duration::from_secs(30));
                    store.get("x:tick").unwrap_or_default()
                })
            },
        )
        .await
        .expect("lock loss should end the run");

        assert!(matches!(result, Err(IngestError::LockLost(name)) if name == "lock:test"));
        assert!(ticks_at_takeover > 0);
        assert_eq!(store.lock_holder("lock:test").as_deref(), Some("intruder"));

        let ticks_at_exit = store.get("x:tick").unwrap_or_default();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("x:tick").unwrap_or_default(), ticks_at_exit);
    }
}
