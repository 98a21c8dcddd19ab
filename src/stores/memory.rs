//! In-memory store implementations. A mutex-guarded map with a per-document
//! version counter satisfies the compare-and-swap contract, so the whole
//! engine runs deterministically in unit and integration tests. The update
//! path mirrors the Redis implementation: snapshot, apply, version-checked
//! commit, bounded retry on conflict.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::RejectReason;
use crate::metrics::CAS_CONFLICTS_TOTAL;
use crate::models::durable::{DurableAttemptRow, QuizResultRow, TopicPerformanceRow};
use crate::models::events::QuizEvent;
use crate::models::{
    AcceptedAnswer, Participant, QuestionInfo, QuizInfo, Session, SessionMeta, SessionStatus,
};
use crate::utils::clock::Clock;
use crate::utils::retry::RetryPolicy;

use super::{
    AttemptRepository, Catalog, CasExhausted, EventBus, LockManager, ParticipantUpdate,
    SessionStore,
};

#[derive(Clone)]
struct VersionedParticipant {
    version: u64,
    doc: Participant,
}

struct StoredSession {
    meta: SessionMeta,
    participants: HashMap<String, VersionedParticipant>,
}

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<HashMap<String, StoredSession>>,
    /// Tests can force the next N commits to be treated as conflicts to
    /// exercise the retry path.
    forced_conflicts: AtomicUsize,
    /// Tests can make the next N whole-session reads fail to exercise the
    /// observational paths that must survive a flaky store.
    forced_read_failures: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_conflicts(&self, count: usize) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, count: usize) {
        self.forced_read_failures.store(count, Ordering::SeqCst);
    }

    fn take_forced_read_failure(&self) -> bool {
        self.forced_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Test helper: place a participant document directly, bypassing the
    /// ledger (used to rebuild a session snapshot or corrupt state).
    pub fn seed_participant(&self, quiz_id: &str, participant: Participant) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.get_mut(quiz_id) {
            let version = session
                .participants
                .get(&participant.user_id)
                .map(|v| v.version + 1)
                .unwrap_or(1);
            session.participants.insert(
                participant.user_id.clone(),
                VersionedParticipant {
                    version,
                    doc: participant,
                },
            );
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, meta: &SessionMeta) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&meta.quiz_id) {
            return Ok(false);
        }
        inner.insert(
            meta.quiz_id.clone(),
            StoredSession {
                meta: meta.clone(),
                participants: HashMap::new(),
            },
        );
        Ok(true)
    }

    async fn session_meta(&self, quiz_id: &str) -> Result<Option<SessionMeta>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.get(quiz_id).map(|s| s.meta.clone()))
    }

    async fn set_session_status(&self, quiz_id: &str, status: SessionStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .get_mut(quiz_id)
            .ok_or_else(|| anyhow!("session {} not found", quiz_id))?;
        session.meta.status = status;
        Ok(())
    }

    async fn read_session(&self, quiz_id: &str) -> Result<Option<Session>> {
        if self.take_forced_read_failure() {
            return Err(anyhow!("injected read failure for session {}", quiz_id));
        }
        let inner = self.inner.lock().unwrap();
        Ok(inner.get(quiz_id).map(|s| Session {
            meta: s.meta.clone(),
            participants: s
                .participants
                .iter()
                .map(|(user_id, v)| (user_id.clone(), v.doc.clone()))
                .collect(),
        }))
    }

    async fn get_participant(&self, quiz_id: &str, user_id: &str) -> Result<Option<Participant>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .get(quiz_id)
            .and_then(|s| s.participants.get(user_id))
            .map(|v| v.doc.clone()))
    }

    async fn ensure_participant(
        &self,
        quiz_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .get_mut(quiz_id)
            .ok_or_else(|| anyhow!("session {} not found", quiz_id))?;
        if session.participants.contains_key(user_id) {
            return Ok(false);
        }
        session.participants.insert(
            user_id.to_string(),
            VersionedParticipant {
                version: 1,
                doc: Participant::new(user_id, now),
            },
        );
        Ok(true)
    }

    async fn update_participant(
        &self,
        quiz_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
        apply: ParticipantUpdate<'_>,
    ) -> Result<Result<AcceptedAnswer, RejectReason>> {
        let policy = RetryPolicy::for_cas();
        let mut attempts_left = policy.max_attempts;
        let mut backoff = policy.base_backoff;

        loop {
            let (version, mut doc) = {
                let inner = self.inner.lock().unwrap();
                let session = inner
                    .get(quiz_id)
                    .ok_or_else(|| anyhow!("session {} not found", quiz_id))?;
                match session.participants.get(user_id) {
                    Some(v) => (v.version, v.doc.clone()),
                    None => (0, Participant::new(user_id, now)),
                }
            };

            let accepted = match apply(&mut doc) {
                Ok(accepted) => accepted,
                Err(reject) => return Ok(Err(reject)),
            };

            let committed = {
                let mut inner = self.inner.lock().unwrap();
                let session = inner
                    .get_mut(quiz_id)
                    .ok_or_else(|| anyhow!("session {} not found", quiz_id))?;
                let current = session
                    .participants
                    .get(user_id)
                    .map(|v| v.version)
                    .unwrap_or(0);
                if current != version || self.take_forced_conflict() {
                    false
                } else {
                    session.participants.insert(
                        user_id.to_string(),
                        VersionedParticipant {
                            version: version + 1,
                            doc,
                        },
                    );
                    true
                }
            };

            if committed {
                return Ok(Ok(accepted));
            }

            CAS_CONFLICTS_TOTAL.inc();
            attempts_left = attempts_left.saturating_sub(1);
            if attempts_left == 0 {
                return Err(CasExhausted {
                    quiz_id: quiz_id.to_string(),
                    user_id: user_id.to_string(),
                }
                .into());
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, policy.max_backoff);
        }
    }

    async fn delete_session(&self, quiz_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(quiz_id);
        Ok(())
    }

    async fn active_quiz_ids(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<String> = inner.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

pub struct MemoryLockManager {
    clock: std::sync::Arc<dyn Clock>,
    leases: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryLockManager {
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, key: &str, ttl_secs: u64) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap();
        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        leases.insert(
            key.to_string(),
            (
                token.clone(),
                now + ChronoDuration::seconds(ttl_secs as i64),
            ),
        );
        Ok(Some(token))
    }

    async fn extend(&self, key: &str, token: &str, ttl_secs: u64) -> Result<bool> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap();
        match leases.get_mut(key) {
            Some((holder, expires_at)) if holder == token => {
                *expires_at = now + ChronoDuration::seconds(ttl_secs as i64);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(key) {
            Some((holder, _)) if holder == token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Captures published events for assertions.
#[derive(Default)]
pub struct MemoryEventBus {
    events: Mutex<Vec<(String, QuizEvent)>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, QuizEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_named(&self, event_name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event)| event.event_name() == event_name)
            .count()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, channel: &str, event: &QuizEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((channel.to_string(), event.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAttemptRepository {
    attempts: Mutex<BTreeMap<String, DurableAttemptRow>>,
    results: Mutex<HashMap<String, QuizResultRow>>,
    topics: Mutex<HashMap<String, TopicPerformanceRow>>,
    failing_users: Mutex<HashSet<String>>,
}

impl MemoryAttemptRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: attempt upserts for this user start failing, to exercise
    /// per-participant error isolation in reconciliation.
    pub fn fail_for_user(&self, user_id: &str) {
        self.failing_users
            .lock()
            .unwrap()
            .insert(user_id.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_users.lock().unwrap().clear();
    }

    pub fn all_attempts(&self) -> Vec<DurableAttemptRow> {
        self.attempts.lock().unwrap().values().cloned().collect()
    }

    pub fn all_topic_rows(&self) -> Vec<TopicPerformanceRow> {
        self.topics.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl AttemptRepository for MemoryAttemptRepository {
    async fn upsert_attempts(&self, rows: &[DurableAttemptRow]) -> Result<u64> {
        {
            let failing = self.failing_users.lock().unwrap();
            if let Some(row) = rows.iter().find(|r| failing.contains(&r.user_id)) {
                return Err(anyhow!("injected write failure for user {}", row.user_id));
            }
        }
        let mut attempts = self.attempts.lock().unwrap();
        for row in rows {
            attempts.insert(row.key(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn attempts_for(
        &self,
        quiz_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<DurableAttemptRow>> {
        let attempts = self.attempts.lock().unwrap();
        Ok(attempts
            .values()
            .filter(|row| row.quiz_id == quiz_id)
            .filter(|row| user_id.map_or(true, |u| row.user_id == u))
            .cloned()
            .collect())
    }

    async fn upsert_result(&self, row: &QuizResultRow) -> Result<()> {
        self.results.lock().unwrap().insert(row.key(), row.clone());
        Ok(())
    }

    async fn result_for(&self, quiz_id: &str, user_id: &str) -> Result<Option<QuizResultRow>> {
        let key = format!("{}:{}", user_id, quiz_id);
        Ok(self.results.lock().unwrap().get(&key).cloned())
    }

    async fn upsert_topic_performance(&self, row: &TopicPerformanceRow) -> Result<()> {
        self.topics.lock().unwrap().insert(row.key(), row.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    questions: Mutex<HashMap<String, QuestionInfo>>,
    quizzes: Mutex<HashMap<String, QuizInfo>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_question(&self, question: QuestionInfo) {
        self.questions
            .lock()
            .unwrap()
            .insert(question.question_id.clone(), question);
    }

    pub fn insert_quiz(&self, quiz: QuizInfo) {
        self.quizzes
            .lock()
            .unwrap()
            .insert(quiz.quiz_id.clone(), quiz);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn question(&self, question_id: &str) -> Result<Option<QuestionInfo>> {
        Ok(self.questions.lock().unwrap().get(question_id).cloned())
    }

    async fn quiz(&self, quiz_id: &str) -> Result<Option<QuizInfo>> {
        Ok(self.quizzes.lock().unwrap().get(quiz_id).cloned())
    }
}

/// Deterministic clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, delta: ChronoDuration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
