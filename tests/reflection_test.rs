//! Reflection Integration Tests
//!
//! Correction -> lesson -> publish against a durable SQLite ledger.

use async_trait::async_trait;
use phaseflow::agent::{
    CorrectionDetector, DetectorConfig, EventPublisher, KeywordCorrectionStrategy, LessonGenerator,
    LessonLedger, LessonPublisher, PublishError, ReflectionError, Signer, SqliteLedger,
    TemplateSynthesizer,
};
use phaseflow::{
    Author, ConversationStore, EventRecord, LessonView, ReflectionOutcome, ReflectionSystem,
    ReflectionTrigger, UnsignedEvent,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct TestSigner;

#[async_trait]
impl Signer for TestSigner {
    async fn sign(&self, event: UnsignedEvent) -> anyhow::Result<EventRecord> {
        Ok(event.into_signed("sig".into()))
    }
}

/// Records delivered events; can be switched to fail
#[derive(Default)]
struct RecordingPublisher {
    delivered: Mutex<Vec<EventRecord>>,
    offline: AtomicBool,
}

impl RecordingPublisher {
    fn delivered(&self) -> Vec<EventRecord> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &EventRecord) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("relay offline");
        }
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn create_system(
    store: Arc<ConversationStore>,
    db_path: &Path,
    transport: Arc<RecordingPublisher>,
) -> ReflectionSystem {
    let ledger = Arc::new(SqliteLedger::open(db_path).expect("Failed to open ledger"));
    ReflectionSystem::new(
        store,
        CorrectionDetector::new(Arc::new(KeywordCorrectionStrategy::new()), DetectorConfig::default()),
        LessonGenerator::new(Arc::new(TemplateSynthesizer), Duration::from_secs(5)),
        LessonPublisher::new(ledger, transport, Arc::new(TestSigner), Duration::from_secs(5)),
    )
}

async fn corrected_conversation(store: &ConversationStore, id: &str) {
    store.create(id, "Deploy").await.unwrap();
    store.append(id, Author::Human, "Deploy the service").await.unwrap();
    store
        .append(id, Author::agent("pk-ops"), "Deployed straight to production.")
        .await
        .unwrap();
    store
        .append(id, Author::Human, "No, that's wrong. Always deploy to staging first.")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_triggers_publish_once() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(ConversationStore::new());
    corrected_conversation(&store, "c1").await;

    let transport = Arc::new(RecordingPublisher::default());
    let system = Arc::new(create_system(store, &temp.path().join("ledger.db"), transport.clone()));

    let a = tokio::spawn({
        let system = Arc::clone(&system);
        async move { system.reflect(&ReflectionTrigger::task_complete("c1", "t1")).await }
    });
    let b = tokio::spawn({
        let system = Arc::clone(&system);
        async move { system.reflect(&ReflectionTrigger::explicit("c1")).await }
    });

    let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
    let published = outcomes
        .iter()
        .filter(|o| matches!(o, ReflectionOutcome::Published { .. }))
        .count();
    let already = outcomes
        .iter()
        .filter(|o| matches!(o, ReflectionOutcome::AlreadyPublished { .. }))
        .count();

    assert_eq!((published, already), (1, 1));
    assert_eq!(transport.delivered().len(), 1);

    let lesson = LessonView::from_event(&transport.delivered()[0]).unwrap();
    assert_eq!(lesson.agent_pubkey, "pk-ops");
    assert!(lesson.correction.unwrap().contains("staging"));
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("ledger.db");

    let store = Arc::new(ConversationStore::new());
    corrected_conversation(&store, "c1").await;

    let first = Arc::new(RecordingPublisher::default());
    let outcome = create_system(store.clone(), &db_path, first.clone())
        .reflect(&ReflectionTrigger::explicit("c1"))
        .await
        .unwrap();
    let (dedup_key, event_id) = match outcome {
        ReflectionOutcome::Published { dedup_key, event_id } => (dedup_key, event_id),
        other => panic!("expected a publish, got {:?}", other),
    };

    // New process, same ledger file
    let second = Arc::new(RecordingPublisher::default());
    let outcome = create_system(store, &db_path, second.clone())
        .reflect(&ReflectionTrigger::explicit("c1"))
        .await
        .unwrap();

    assert_eq!(outcome, ReflectionOutcome::AlreadyPublished { dedup_key: dedup_key.clone() });
    assert!(second.delivered().is_empty());

    let ledger = SqliteLedger::open(&db_path).unwrap();
    assert_eq!(ledger.event_id(&dedup_key).unwrap(), Some(event_id));
}

#[tokio::test]
async fn test_failed_delivery_can_be_retried() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(ConversationStore::new());
    corrected_conversation(&store, "c9").await;

    let transport = Arc::new(RecordingPublisher::default());
    transport.offline.store(true, Ordering::SeqCst);
    let system = create_system(store, &temp.path().join("ledger.db"), transport.clone());

    let err = system
        .reflect(&ReflectionTrigger::task_complete("c9", "deploy"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReflectionError::Publish { source: PublishError::Delivery { .. }, .. }
    ));
    let message = err.to_string();
    assert!(message.contains("c9"));
    assert!(message.contains("task-complete"));

    transport.offline.store(false, Ordering::SeqCst);
    let outcome = system.reflect(&ReflectionTrigger::explicit("c9")).await.unwrap();
    assert!(matches!(outcome, ReflectionOutcome::Published { .. }));
    assert_eq!(transport.delivered().len(), 1);
}

#[tokio::test]
async fn test_no_correction_publishes_nothing() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(ConversationStore::new());
    store.create("c2", "Happy path").await.unwrap();
    store.append("c2", Author::Human, "Add logging").await.unwrap();
    store.append("c2", Author::agent("pk-code"), "Added tracing spans").await.unwrap();
    store.append("c2", Author::Human, "Great, thank you").await.unwrap();

    let transport = Arc::new(RecordingPublisher::default());
    let outcome = create_system(store, &temp.path().join("ledger.db"), transport.clone())
        .reflect(&ReflectionTrigger::explicit("c2"))
        .await
        .unwrap();

    assert!(matches!(outcome, ReflectionOutcome::NoCorrection { .. }));
    assert!(transport.delivered().is_empty());
}

#[tokio::test]
async fn test_different_conversations_do_not_block() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(ConversationStore::new());
    for id in ["a", "b", "c"] {
        store.create(id, "Deploy").await.unwrap();
        store
            .append(id, Author::agent(format!("pk-{}", id)), "Deployed straight to production.")
            .await
            .unwrap();
        store
            .append(id, Author::Human, "Undo that, deploy to staging first")
            .await
            .unwrap();
    }

    let transport = Arc::new(RecordingPublisher::default());
    let system = Arc::new(create_system(store, &temp.path().join("ledger.db"), transport.clone()));

    let started = std::time::Instant::now();
    let results = futures_util::future::join_all(
        ["a", "b", "c"].map(|id| {
            let system = Arc::clone(&system);
            async move { system.reflect(&ReflectionTrigger::explicit(id)).await }
        }),
    )
    .await;

    for result in results {
        assert!(matches!(result.unwrap(), ReflectionOutcome::Published { .. }));
    }
    // Distinct agents mean distinct dedup keys
    assert_eq!(transport.delivered().len(), 3);
    assert!(started.elapsed() < Duration::from_secs(2));
}
