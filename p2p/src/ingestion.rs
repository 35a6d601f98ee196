//! Drains a pub/sub message feed into local processing.
//!
//! Each message pulled off the feed goes through admission first. Admitted messages are processed as independent tasks
//! in a [`TaskGroup`]; every [`IngestionConfig::checkpoint_interval`] submissions the pipeline waits for all of them to
//! finish before pulling the next message. Rejected messages never reach the processor and are not counted.
//!
//! Feed failures end the current subscription only. [`IngestionPipeline::run`] logs them, waits a moment and
//! subscribes again, so the pipeline as a whole never stops. Messages that were in flight on a dropped subscription are
//! not replayed.

use crate::errors::{AdmissionError, FeedError, ProcessingError};
use crate::task_group::TaskGroup;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use libp2p::PeerId;
use log::*;
use std::sync::Arc;
use std::time::Duration;

/// Number of submissions between two full drains of in-flight ingestion work.
pub const INGESTION_CHECKPOINT: usize = 1000;

/// A message as it arrives off the feed, before any validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub data: Vec<u8>,
    pub source: Option<PeerId>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self { topic: topic.into(), data: data.into(), source: None }
    }
}

pub type MessageStream = BoxStream<'static, Result<RawMessage, FeedError>>;

/// A named-topic subscription source. Subscribing again after a drop must work.
#[async_trait]
pub trait MessageFeed: Send + Sync + 'static {
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, FeedError>;
}

/// Decides which raw messages are worth processing. `Ok(None)` means "reject".
#[async_trait]
pub trait MessageAdmission: Send + Sync + 'static {
    type Message: Send + 'static;

    async fn admit(&self, raw: RawMessage) -> Result<Option<Self::Message>, AdmissionError>;
}

#[async_trait]
pub trait MessageProcessor<M>: Send + Sync + 'static {
    async fn process(&self, message: M) -> Result<(), ProcessingError>;
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub checkpoint_interval: usize,
    pub reconnect_delay: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self { checkpoint_interval: INGESTION_CHECKPOINT, reconnect_delay: Duration::from_secs(1) }
    }
}

impl IngestionConfig {
    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

pub struct IngestionPipeline<F, A, P> {
    feed: F,
    admission: A,
    processor: Arc<P>,
    config: IngestionConfig,
}

impl<F, A, P> IngestionPipeline<F, A, P>
where
    F: MessageFeed,
    A: MessageAdmission,
    P: MessageProcessor<A::Message>,
{
    pub fn new(feed: F, admission: A, processor: P, config: IngestionConfig) -> Self {
        Self { feed, admission, processor: Arc::new(processor), config }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    pub fn new_task_group(&self) -> TaskGroup {
        TaskGroup::new(self.config.checkpoint_interval)
    }

    /// Ingest `topic` forever, resubscribing whenever the feed fails or ends.
    pub async fn run(&self, topic: &str) {
        let mut tasks = self.new_task_group();
        loop {
            if let Err(err) = self.run_session(topic, &mut tasks).await {
                error!("Ingestion of {topic} interrupted, reconnecting in {:?}. {err}", self.config.reconnect_delay);
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// One subscription's worth of ingestion. Returns when the feed fails or runs dry.
    ///
    /// The task group is owned by the caller so the checkpoint count carries over from one subscription to the next.
    pub async fn run_session(&self, topic: &str, tasks: &mut TaskGroup) -> Result<(), FeedError> {
        let mut feed = self.feed.subscribe(topic).await?;
        info!("Subscribed to {topic}");
        while let Some(item) = feed.next().await {
            let raw = item?;
            let message = match self.admission.admit(raw).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    trace!("Message on {topic} rejected");
                    continue;
                }
                Err(err) => {
                    debug!("Message on {topic} rejected. {err}");
                    continue;
                }
            };
            let processor = Arc::clone(&self.processor);
            tasks.submit(async move {
                if let Err(err) = processor.process(message).await {
                    warn!("{err}");
                }
            });
            if tasks.at_checkpoint() {
                let joined = tasks.drain().await;
                debug!("Ingestion checkpoint on {topic}: {joined} tasks completed");
            }
        }
        Err(FeedError::Dropped(topic.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Hands out one scripted session per subscription. Once the script runs out, subscriptions hang forever.
    struct ScriptedFeed {
        sessions: Mutex<VecDeque<Vec<Result<RawMessage, FeedError>>>>,
        subscriptions: Arc<AtomicUsize>,
    }

    impl ScriptedFeed {
        fn new(sessions: Vec<Vec<Result<RawMessage, FeedError>>>) -> Self {
            Self { sessions: Mutex::new(sessions.into()), subscriptions: Arc::new(AtomicUsize::new(0)) }
        }
    }

    #[async_trait]
    impl MessageFeed for ScriptedFeed {
        async fn subscribe(&self, _topic: &str) -> Result<MessageStream, FeedError> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().await.pop_front() {
                Some(items) => Ok(stream::iter(items).boxed()),
                None => Ok(stream::pending().boxed()),
            }
        }
    }

    fn msg(text: &str) -> Result<RawMessage, FeedError> {
        Ok(RawMessage::new("test", text.as_bytes()))
    }

    /// Admits anything that parses as a number; "spam" is rejected, anything else is an admission error.
    struct NumberAdmission;

    #[async_trait]
    impl MessageAdmission for NumberAdmission {
        type Message = usize;

        async fn admit(&self, raw: RawMessage) -> Result<Option<usize>, AdmissionError> {
            let text = String::from_utf8_lossy(&raw.data);
            if text == "spam" {
                return Ok(None);
            }
            text.parse().map(Some).map_err(|_| AdmissionError::Invalid(text.to_string()))
        }
    }

    #[derive(Default, Clone)]
    struct Recorder {
        seen: Arc<std::sync::Mutex<Vec<usize>>>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
        ordering_violations: Arc<AtomicUsize>,
        interval: usize,
    }

    #[async_trait]
    impl MessageProcessor<usize> for Recorder {
        async fn process(&self, n: usize) -> Result<(), ProcessingError> {
            // Message n may only start once every message before its checkpoint window has finished.
            if self.completed.load(Ordering::SeqCst) < (n / self.interval) * self.interval {
                self.ordering_violations.fetch_add(1, Ordering::SeqCst);
            }
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.seen.lock().unwrap().push(n);
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn checkpoint_bounds_outstanding_work() {
        env_logger::try_init().ok();
        let interval = 10;
        let items = (0..35).map(|n| msg(&n.to_string())).collect();
        let recorder = Recorder { interval, ..Default::default() };
        let config = IngestionConfig::default().with_checkpoint_interval(interval);
        let pipeline = IngestionPipeline::new(ScriptedFeed::new(vec![items]), NumberAdmission, recorder.clone(), config);

        let mut tasks = pipeline.new_task_group();
        let result = pipeline.run_session("test", &mut tasks).await;
        assert!(matches!(result, Err(FeedError::Dropped(_))));
        // 30 messages were covered by three checkpoints; the last 5 are still in the group.
        assert_eq!(tasks.submitted(), 5);
        assert!(tasks.outstanding() <= 5);
        tasks.drain().await;

        assert_eq!(recorder.seen.lock().unwrap().len(), 35);
        assert!(recorder.max_active.load(Ordering::SeqCst) <= interval);
        assert_eq!(recorder.ordering_violations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn default_checkpoint_holds_back_the_message_after_a_thousand() {
        let config = IngestionConfig::default();
        assert_eq!(config.checkpoint_interval, INGESTION_CHECKPOINT);
        let items = (0..INGESTION_CHECKPOINT + 1).map(|n| msg(&n.to_string())).collect();
        let recorder = Recorder { interval: INGESTION_CHECKPOINT, ..Default::default() };
        let pipeline = IngestionPipeline::new(ScriptedFeed::new(vec![items]), NumberAdmission, recorder.clone(), config);

        let mut tasks = pipeline.new_task_group();
        let _ = pipeline.run_session("test", &mut tasks).await;
        // The first thousand were drained before message 1000 was handed out.
        assert_eq!(tasks.submitted(), 1);
        tasks.drain().await;
        assert_eq!(recorder.seen.lock().unwrap().len(), INGESTION_CHECKPOINT + 1);
        assert_eq!(recorder.ordering_violations.load(Ordering::SeqCst), 0);
        assert!(recorder.max_active.load(Ordering::SeqCst) <= INGESTION_CHECKPOINT);
    }

    #[tokio::test]
    async fn rejected_messages_are_skipped_and_not_counted() {
        let items = vec![msg("1"), msg("spam"), msg("not a number"), msg("2"), msg("spam"), msg("3")];
        let recorder = Recorder { interval: 3, ..Default::default() };
        let config = IngestionConfig::default().with_checkpoint_interval(3);
        let pipeline = IngestionPipeline::new(ScriptedFeed::new(vec![items]), NumberAdmission, recorder.clone(), config);

        let mut tasks = pipeline.new_task_group();
        let _ = pipeline.run_session("test", &mut tasks).await;
        // Exactly three admissions, so the checkpoint fired once and reset the counter.
        assert_eq!(tasks.submitted(), 0);
        let mut seen = recorder.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn feed_failures_trigger_a_resubscribe() {
        env_logger::try_init().ok();
        let feed = ScriptedFeed::new(vec![
            vec![msg("1"), Err(FeedError::Other("connection lost".into())), msg("99")],
            vec![msg("2")],
        ]);
        let subscriptions = Arc::clone(&feed.subscriptions);
        let recorder = Recorder { interval: 1000, ..Default::default() };
        let config = IngestionConfig::default().with_reconnect_delay(Duration::from_millis(5));
        let pipeline = Arc::new(IngestionPipeline::new(feed, NumberAdmission, recorder.clone(), config));

        let running = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.run("test").await })
        };
        let mut waited = Duration::ZERO;
        while recorder.completed.load(Ordering::SeqCst) < 2 && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert!(!running.is_finished());
        running.abort();

        let mut seen = recorder.seen.lock().unwrap().clone();
        seen.sort();
        // The message after the failure belongs to the dead subscription and is never seen.
        assert_eq!(seen, vec![1, 2]);
        assert!(subscriptions.load(Ordering::SeqCst) >= 2);
    }
}
