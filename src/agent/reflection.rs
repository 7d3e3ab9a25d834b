//! Reflection System
//!
//! Learns from human corrections:
//! - Detect a correction in the recent history of a conversation
//! - Generate a lesson for the agent that was corrected
//! - Publish the lesson at most once per dedup key
//!
//! Each trigger walks `Received -> Detecting -> (Done | Generating -> Publishing -> Done)`.
//! Triggers for the same conversation are serialized; different conversations
//! reflect in parallel.

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::correction::{CorrectionDetector, DetectorConfig};
use super::lesson::LessonGenerator;
use super::publisher::{LessonPublisher, PublishError, PublishOutcome};
use crate::config::Config;
use crate::conversation::{ConversationError, ConversationStore};
use crate::locks::KeyedLocks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    TaskComplete,
    Explicit,
    Periodic,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskComplete => "task-complete",
            Self::Explicit => "explicit",
            Self::Periodic => "periodic",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionTrigger {
    pub kind: TriggerKind,
    pub conversation_id: String,
    pub task_id: Option<String>,
}

impl ReflectionTrigger {
    pub fn task_complete(conversation_id: &str, task_id: &str) -> Self {
        Self {
            kind: TriggerKind::TaskComplete,
            conversation_id: conversation_id.to_string(),
            task_id: Some(task_id.to_string()),
        }
    }

    pub fn explicit(conversation_id: &str) -> Self {
        Self {
            kind: TriggerKind::Explicit,
            conversation_id: conversation_id.to_string(),
            task_id: None,
        }
    }

    pub fn periodic(conversation_id: &str) -> Self {
        Self {
            kind: TriggerKind::Periodic,
            conversation_id: conversation_id.to_string(),
            task_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionState {
    Received,
    Detecting,
    Generating,
    Publishing,
    Done,
}

impl ReflectionState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Detecting => "detecting",
            Self::Generating => "generating",
            Self::Publishing => "publishing",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReflectionOutcome {
    NoCorrection { confidence: f64 },
    Published { dedup_key: String, event_id: String },
    AlreadyPublished { dedup_key: String },
}

/// Reflection failures, tagged with the conversation and trigger for operators
#[derive(Debug, thiserror::Error)]
pub enum ReflectionError {
    #[error("Reflection on {conversation_id} ({trigger}) could not read history: {source}")]
    History {
        conversation_id: String,
        trigger: TriggerKind,
        #[source]
        source: ConversationError,
    },

    #[error("Reflection on {conversation_id} ({trigger}) failed to generate a lesson: {source}")]
    Generation {
        conversation_id: String,
        trigger: TriggerKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("Reflection on {conversation_id} ({trigger}) failed to publish: {source}")]
    Publish {
        conversation_id: String,
        trigger: TriggerKind,
        #[source]
        source: PublishError,
    },
}

/// Tunables used to assemble the pipeline
#[derive(Debug, Clone)]
pub struct ReflectionConfig {
    pub detector: DetectorConfig,
    pub synthesis_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            synthesis_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&Config> for ReflectionConfig {
    fn from(config: &Config) -> Self {
        Self {
            detector: DetectorConfig {
                window: config.correction_window,
                min_confidence: config.correction_min_confidence,
                timeout: config.reasoning_timeout,
            },
            synthesis_timeout: config.reasoning_timeout,
            publish_timeout: config.publish_timeout,
        }
    }
}

pub struct ReflectionSystem {
    store: Arc<ConversationStore>,
    detector: CorrectionDetector,
    generator: LessonGenerator,
    publisher: LessonPublisher,
    locks: KeyedLocks,
    /// History length at the last completed reflection, per conversation
    checked: Mutex<HashMap<String, usize>>,
}

impl ReflectionSystem {
    pub fn new(
        store: Arc<ConversationStore>,
        detector: CorrectionDetector,
        generator: LessonGenerator,
        publisher: LessonPublisher,
    ) -> Self {
        Self {
            store,
            detector,
            generator,
            publisher,
            locks: KeyedLocks::new(),
            checked: Mutex::new(HashMap::new()),
        }
    }

    pub fn publisher(&self) -> &LessonPublisher {
        &self.publisher
    }

    /// Run one trigger through the pipeline
    pub async fn reflect(&self, trigger: &ReflectionTrigger) -> Result<ReflectionOutcome, ReflectionError> {
        let _guard = self.locks.lock(&trigger.conversation_id).await;
        self.run(trigger).await
    }

    // Caller holds the conversation lock
    async fn run(&self, trigger: &ReflectionTrigger) -> Result<ReflectionOutcome, ReflectionError> {
        let id = trigger.conversation_id.as_str();
        let mut state = ReflectionState::Received;
        debug!("Reflection {} on {}: {}", trigger.kind, id, state.as_str());

        let (history, history_len) = {
            let snapshot = self.store.snapshot(id).await.map_err(|source| ReflectionError::History {
                conversation_id: id.to_string(),
                trigger: trigger.kind,
                source,
            })?;
            let len = snapshot.history().len();
            (snapshot.recent(self.detector.window_size()).to_vec(), len)
        };

        advance(trigger, &mut state, ReflectionState::Detecting);
        let analysis = self.detector.detect(id, &history).await;

        let pattern = match analysis.pattern {
            Some(pattern) if analysis.found => pattern,
            _ => {
                advance(trigger, &mut state, ReflectionState::Done);
                self.mark_checked(id, history_len);
                return Ok(ReflectionOutcome::NoCorrection {
                    confidence: analysis.confidence,
                });
            }
        };

        info!(
            "Correction detected in {} for agent {} (confidence {:.2})",
            id, pattern.offending_agent, analysis.confidence
        );

        advance(trigger, &mut state, ReflectionState::Generating);
        let lesson = self
            .generator
            .generate(&pattern)
            .await
            .map_err(|source| ReflectionError::Generation {
                conversation_id: id.to_string(),
                trigger: trigger.kind,
                source,
            })?;

        advance(trigger, &mut state, ReflectionState::Publishing);
        let outcome = self
            .publisher
            .publish(&lesson)
            .await
            .map_err(|source| ReflectionError::Publish {
                conversation_id: id.to_string(),
                trigger: trigger.kind,
                source,
            })?;

        advance(trigger, &mut state, ReflectionState::Done);
        self.mark_checked(id, history_len);

        Ok(match outcome {
            PublishOutcome::Published { event_id } => ReflectionOutcome::Published {
                dedup_key: lesson.dedup_key,
                event_id,
            },
            PublishOutcome::AlreadyPublished => ReflectionOutcome::AlreadyPublished {
                dedup_key: lesson.dedup_key,
            },
        })
    }

    fn mark_checked(&self, id: &str, len: usize) {
        let mut checked = self.checked.lock();
        let entry = checked.entry(id.to_string()).or_insert(0);
        *entry = (*entry).max(len);
    }

    /// Reflect on every conversation whose history grew since its last check
    pub async fn reflect_changed(&self) -> Vec<(String, Result<ReflectionOutcome, ReflectionError>)> {
        let mut due = Vec::new();
        for id in self.store.ids().await {
            let Ok(len) = self.store.history_len(&id).await else {
                continue;
            };
            let last = self.checked.lock().get(&id).copied().unwrap_or(0);
            if len <= last {
                continue;
            }
            // A reflection already in flight covers this conversation
            let Some(guard) = self.locks.try_lock(&id) else {
                debug!("Skipping {}: reflection in flight", id);
                continue;
            };
            due.push((id, guard));
        }

        let runs = due.into_iter().map(|(id, guard)| async move {
            let result = self.run(&ReflectionTrigger::periodic(&id)).await;
            drop(guard);
            (id, result)
        });
        join_all(runs).await
    }

    /// Start the periodic trigger loop
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> PeriodicReflection {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let system = self;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for (id, result) in system.reflect_changed().await {
                            match result {
                                Ok(outcome) => debug!("Periodic reflection on {}: {:?}", id, outcome),
                                Err(e) => warn!("{}", e),
                            }
                        }
                    }
                    _ = rx.recv() => {
                        info!("Periodic reflection shutting down");
                        break;
                    }
                }
            }
        });

        info!("Periodic reflection started every {:?}", interval);
        PeriodicReflection {
            shutdown_tx: tx,
            handle,
        }
    }
}

fn advance(trigger: &ReflectionTrigger, state: &mut ReflectionState, next: ReflectionState) {
    debug!(
        "Reflection {} on {}: {} -> {}",
        trigger.kind,
        trigger.conversation_id,
        state.as_str(),
        next.as_str()
    );
    *state = next;
}

/// Handle to the periodic loop
pub struct PeriodicReflection {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicReflection {
    /// Signal the loop and wait for it to exit
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            warn!("Periodic reflection task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::correction::KeywordCorrectionStrategy;
    use crate::agent::lesson::TemplateSynthesizer;
    use crate::agent::publisher::{EventPublisher, MemoryLedger, Signer};
    use crate::conversation::Author;
    use crate::event::{EventRecord, UnsignedEvent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PlainSigner;

    #[async_trait]
    impl Signer for PlainSigner {
        async fn sign(&self, event: UnsignedEvent) -> anyhow::Result<EventRecord> {
            Ok(event.into_signed(String::new()))
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl EventPublisher for Counting {
        async fn publish(&self, _event: &EventRecord) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn system(store: Arc<ConversationStore>, transport: Arc<Counting>) -> ReflectionSystem {
        let config = ReflectionConfig::default();
        ReflectionSystem::new(
            store,
            CorrectionDetector::new(Arc::new(KeywordCorrectionStrategy::new()), config.detector.clone()),
            LessonGenerator::new(Arc::new(TemplateSynthesizer), config.synthesis_timeout),
            LessonPublisher::new(
                Arc::new(MemoryLedger::new()),
                transport,
                Arc::new(PlainSigner),
                config.publish_timeout,
            ),
        )
    }

    #[tokio::test]
    async fn test_no_correction_skips_publish() {
        let store = Arc::new(ConversationStore::new());
        store.create("c1", "Docs").await.unwrap();
        store.append("c1", Author::Human, "Write docs").await.unwrap();
        store.append("c1", Author::agent("pk"), "Wrote docs").await.unwrap();
        store.append("c1", Author::Human, "Perfect, thanks").await.unwrap();

        let transport = Arc::new(Counting::default());
        let outcome = system(store, transport.clone())
            .reflect(&ReflectionTrigger::task_complete("c1", "t1"))
            .await
            .unwrap();

        assert!(matches!(outcome, ReflectionOutcome::NoCorrection { .. }));
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repeat_trigger_is_already_published() {
        let store = Arc::new(ConversationStore::new());
        store.create("c1", "Cleanup").await.unwrap();
        store.append("c1", Author::agent("pk"), "Force-pushed to main").await.unwrap();
        store
            .append("c1", Author::Human, "Don't do that, open a PR instead")
            .await
            .unwrap();

        let transport = Arc::new(Counting::default());
        let system = system(store, transport.clone());

        let first = system.reflect(&ReflectionTrigger::explicit("c1")).await.unwrap();
        let second = system.reflect(&ReflectionTrigger::explicit("c1")).await.unwrap();

        assert!(matches!(first, ReflectionOutcome::Published { .. }));
        assert!(matches!(second, ReflectionOutcome::AlreadyPublished { .. }));
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_conversation_reports_context() {
        let system = system(Arc::new(ConversationStore::new()), Arc::new(Counting::default()));
        let err = system.reflect(&ReflectionTrigger::explicit("ghost")).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("ghost"));
        assert!(message.contains("explicit"));
    }

    #[tokio::test]
    async fn test_reflect_changed_only_visits_grown_conversations() {
        let store = Arc::new(ConversationStore::new());
        store.create("a", "A").await.unwrap();
        store.create("b", "B").await.unwrap();
        store.append("a", Author::Human, "hello").await.unwrap();

        let system = system(store.clone(), Arc::new(Counting::default()));
        let first = system.reflect_changed().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, "a");

        assert!(system.reflect_changed().await.is_empty());

        store.append("b", Author::Human, "hi").await.unwrap();
        let third = system.reflect_changed().await;
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].0, "b");
    }
}
