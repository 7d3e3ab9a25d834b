//! Lesson Publisher
//!
//! Exactly-once lesson publishing at the application boundary. A durable
//! ledger keyed by dedup key records what was delivered. Delivery happens
//! first; the ledger entry is written only after the publisher confirms, so a
//! failed delivery can always be retried.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::lesson::AgentLesson;
use crate::event::{EventRecord, UnsignedEvent};
use crate::locks::KeyedLocks;

/// Transport that delivers signed records (relay, queue, ...)
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &EventRecord) -> anyhow::Result<()>;
}

/// Produces signatures on behalf of an agent identity
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, event: UnsignedEvent) -> anyhow::Result<EventRecord>;
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger already holds key {0}")]
    Conflict(String),

    #[error("Ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Idempotency ledger
///
/// `record` must be an atomic insert: a second insert of the same key fails
/// with `LedgerError::Conflict`.
pub trait LessonLedger: Send + Sync {
    fn contains(&self, key: &str) -> Result<bool, LedgerError>;
    fn record(&self, key: &str, event_id: &str, agent_pubkey: &str) -> Result<(), LedgerError>;
    fn event_id(&self, key: &str) -> Result<Option<String>, LedgerError>;
}

/// Durable ledger on SQLite
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS published_lessons (
                dedup_key TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                agent_pubkey TEXT NOT NULL,
                published_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_lessons_agent ON published_lessons(agent_pubkey);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl LessonLedger for SqliteLedger {
    fn contains(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.event_id(key)?.is_some())
    }

    fn record(&self, key: &str, event_id: &str, agent_pubkey: &str) -> Result<(), LedgerError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO published_lessons (dedup_key, event_id, agent_pubkey, published_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, event_id, agent_pubkey, chrono::Utc::now().timestamp()],
        )?;

        if inserted == 0 {
            return Err(LedgerError::Conflict(key.to_string()));
        }
        Ok(())
    }

    fn event_id(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT event_id FROM published_lessons WHERE dedup_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

/// Process-lifetime ledger
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl LessonLedger for MemoryLedger {
    fn contains(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.entries.lock().contains_key(key))
    }

    fn record(&self, key: &str, event_id: &str, _agent_pubkey: &str) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(LedgerError::Conflict(key.to_string()));
        }
        entries.insert(key.to_string(), event_id.to_string());
        Ok(())
    }

    fn event_id(&self, key: &str) -> Result<Option<String>, LedgerError> {
        Ok(self.entries.lock().get(key).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { event_id: String },
    AlreadyPublished,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Signing lesson {key} failed: {source}")]
    Signing {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Delivering lesson {key} failed: {source}")]
    Delivery {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Publishing lesson {key} timed out after {after:?}")]
    Timeout { key: String, after: Duration },

    #[error("Ledger error for lesson {key}: {source}")]
    Ledger {
        key: String,
        #[source]
        source: LedgerError,
    },
}

pub struct LessonPublisher {
    ledger: Arc<dyn LessonLedger>,
    publisher: Arc<dyn EventPublisher>,
    signer: Arc<dyn Signer>,
    timeout: Duration,
    locks: KeyedLocks,
}

impl LessonPublisher {
    pub fn new(
        ledger: Arc<dyn LessonLedger>,
        publisher: Arc<dyn EventPublisher>,
        signer: Arc<dyn Signer>,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            publisher,
            signer,
            timeout,
            locks: KeyedLocks::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LessonLedger> {
        &self.ledger
    }

    /// Publish a lesson unless its dedup key was already delivered
    pub async fn publish(&self, lesson: &AgentLesson) -> Result<PublishOutcome, PublishError> {
        let key = lesson.dedup_key.as_str();
        let ledger_err = |source| PublishError::Ledger {
            key: key.to_string(),
            source,
        };

        let _guard = self.locks.lock(key).await;

        if self.ledger.contains(key).map_err(ledger_err)? {
            debug!("Lesson {} already in ledger", key);
            return Ok(PublishOutcome::AlreadyPublished);
        }

        let event = match tokio::time::timeout(self.timeout, self.signer.sign(lesson.to_event())).await {
            Ok(Ok(event)) => event,
            Ok(Err(source)) => {
                return Err(PublishError::Signing {
                    key: key.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(PublishError::Timeout {
                    key: key.to_string(),
                    after: self.timeout,
                })
            }
        };

        match tokio::time::timeout(self.timeout, self.publisher.publish(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                warn!("Delivery of lesson {} failed: {}", key, source);
                return Err(PublishError::Delivery {
                    key: key.to_string(),
                    source,
                });
            }
            Err(_) => {
                warn!("Delivery of lesson {} timed out", key);
                return Err(PublishError::Timeout {
                    key: key.to_string(),
                    after: self.timeout,
                });
            }
        }

        match self.ledger.record(key, &event.id, &lesson.agent_pubkey) {
            Ok(()) => {
                info!("Published lesson {} as event {}", key, event.id);
                Ok(PublishOutcome::Published { event_id: event.id })
            }
            Err(LedgerError::Conflict(_)) => {
                debug!("Lesson {} recorded concurrently", key);
                Ok(PublishOutcome::AlreadyPublished)
            }
            Err(e) => Err(ledger_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PlainSigner;

    #[async_trait]
    impl Signer for PlainSigner {
        async fn sign(&self, event: UnsignedEvent) -> anyhow::Result<EventRecord> {
            Ok(event.into_signed("test-sig".into()))
        }
    }

    #[derive(Default)]
    struct CountingPublisher {
        delivered: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventPublisher for CountingPublisher {
        async fn publish(&self, _event: &EventRecord) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                anyhow::bail!("relay unreachable");
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn lesson() -> AgentLesson {
        AgentLesson {
            agent_pubkey: "pk".into(),
            situation: "Deleting files".into(),
            mistake: "Deleted the repo".into(),
            correction: "Only delete target/".into(),
            generalized_rule: "Ask before deleting outside build dirs".into(),
            created_at: Utc::now(),
            dedup_key: AgentLesson::dedup_key_for("pk", "Deleting files"),
        }
    }

    fn publisher(ledger: Arc<dyn LessonLedger>, transport: Arc<CountingPublisher>) -> LessonPublisher {
        LessonPublisher::new(ledger, transport, Arc::new(PlainSigner), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_concurrent_publish_delivers_once() {
        let transport = Arc::new(CountingPublisher::default());
        let publisher = Arc::new(publisher(Arc::new(MemoryLedger::new()), transport.clone()));
        let lesson = lesson();

        let (a, b) = tokio::join!(publisher.publish(&lesson), publisher.publish(&lesson));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, PublishOutcome::AlreadyPublished));

        assert!(matches!(outcomes[0], PublishOutcome::Published { .. }));
        assert_eq!(outcomes[1], PublishOutcome::AlreadyPublished);
        assert_eq!(transport.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_leaves_no_entry() {
        let ledger = Arc::new(MemoryLedger::new());
        let failing = Arc::new(CountingPublisher {
            fail: true,
            ..Default::default()
        });

        let err = publisher(ledger.clone(), failing).publish(&lesson()).await.unwrap_err();
        assert!(matches!(err, PublishError::Delivery { .. }));
        assert!(ledger.is_empty());

        let healthy = Arc::new(CountingPublisher::default());
        let outcome = publisher(ledger.clone(), healthy.clone()).publish(&lesson()).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_timeout_leaves_no_entry() {
        let ledger = Arc::new(MemoryLedger::new());
        let transport = Arc::new(CountingPublisher::default());
        let impatient = LessonPublisher::new(
            ledger.clone(),
            transport.clone(),
            Arc::new(PlainSigner),
            Duration::from_millis(2),
        );

        let err = impatient.publish(&lesson()).await.unwrap_err();
        assert!(matches!(err, PublishError::Timeout { .. }));
        assert!(ledger.is_empty());
        assert_eq!(transport.delivered.load(Ordering::SeqCst), 0);

        let outcome = publisher(ledger.clone(), transport.clone()).publish(&lesson()).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
        assert_eq!(ledger.len(), 1);
        assert_eq!(transport.delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sqlite_ledger_conflict() {
        let ledger = SqliteLedger::in_memory().unwrap();
        assert!(!ledger.contains("k").unwrap());

        ledger.record("k", "ev1", "pk").unwrap();
        assert!(matches!(ledger.record("k", "ev2", "pk"), Err(LedgerError::Conflict(_))));
        assert_eq!(ledger.event_id("k").unwrap().as_deref(), Some("ev1"));
    }

    #[test]
    fn test_sqlite_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");

        SqliteLedger::open(&path).unwrap().record("k", "ev1", "pk").unwrap();
        let reopened = SqliteLedger::open(&path).unwrap();
        assert!(reopened.contains("k").unwrap());
    }
}
