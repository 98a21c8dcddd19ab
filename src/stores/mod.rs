use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::RejectReason;
use crate::models::durable::{DurableAttemptRow, QuizResultRow, TopicPerformanceRow};
use crate::models::events::QuizEvent;
use crate::models::{
    AcceptedAnswer, Participant, QuestionInfo, QuizInfo, Session, SessionMeta, SessionStatus,
};

pub mod memory;
pub mod mongo_store;
pub mod redis_store;

/// Marker error raised when a participant CAS update ran out of retries.
/// Callers downcast this out of the `anyhow` chain to surface a typed
/// conflict instead of a generic store failure.
#[derive(Debug, Error)]
#[error("participant update kept conflicting: quiz={quiz_id} user={user_id}")]
pub struct CasExhausted {
    pub quiz_id: String,
    pub user_id: String,
}

/// Mutation applied to a participant document inside the store's atomic
/// read-modify-write. A `RejectReason` aborts without writing anything.
pub type ParticipantUpdate<'a> =
    &'a mut (dyn FnMut(&mut Participant) -> Result<AcceptedAnswer, RejectReason> + Send);

/// Tree-shaped ephemeral document store:
/// `sessions/{quiz_id}/participants/{user_id}`. Participant documents are the
/// transaction granularity; the update closure runs under compare-and-swap
/// and conflicts are retried by the implementation, not the caller.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create the session document if absent. Returns false when one
    /// already existed.
    async fn create_session(&self, meta: &SessionMeta) -> Result<bool>;

    async fn session_meta(&self, quiz_id: &str) -> Result<Option<SessionMeta>>;

    async fn set_session_status(&self, quiz_id: &str, status: SessionStatus) -> Result<()>;

    /// Whole-subtree read: meta plus every participant document.
    async fn read_session(&self, quiz_id: &str) -> Result<Option<Session>>;

    async fn get_participant(&self, quiz_id: &str, user_id: &str) -> Result<Option<Participant>>;

    /// Create the participant document on first join. Returns false when it
    /// already existed.
    async fn ensure_participant(
        &self,
        quiz_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomic read-modify-write on one participant document, creating it on
    /// first touch (`joined_at = now`). Returns only after the write is
    /// acknowledged, which is the write barrier readers rely on.
    async fn update_participant(
        &self,
        quiz_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
        apply: ParticipantUpdate<'_>,
    ) -> Result<Result<AcceptedAnswer, RejectReason>>;

    /// Whole-subtree delete, used only after a fully clean reconciliation.
    async fn delete_session(&self, quiz_id: &str) -> Result<()>;

    /// Quiz ids with a live session document, for the periodic sync worker.
    async fn active_quiz_ids(&self) -> Result<Vec<String>>;
}

/// Durable system of record: attempt history and quiz results, both with
/// upsert-on-conflict semantics so reconciliation can re-run safely.
#[async_trait]
pub trait AttemptRepository: Send + Sync {
    /// Upsert every row by its composite key, refreshing values on conflict.
    /// Returns the number of rows written.
    async fn upsert_attempts(&self, rows: &[DurableAttemptRow]) -> Result<u64>;

    async fn attempts_for(
        &self,
        quiz_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<DurableAttemptRow>>;

    async fn upsert_result(&self, row: &QuizResultRow) -> Result<()>;

    async fn result_for(&self, quiz_id: &str, user_id: &str) -> Result<Option<QuizResultRow>>;

    async fn upsert_topic_performance(&self, row: &TopicPerformanceRow) -> Result<()>;
}

/// Holder-agnostic lease lock with TTL. `acquire` hands back a token; extend
/// and release are no-ops for anyone who does not hold the current token, so
/// a crashed holder simply lets the lease expire.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, key: &str, ttl_secs: u64) -> Result<Option<String>>;

    async fn extend(&self, key: &str, token: &str, ttl_secs: u64) -> Result<bool>;

    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

/// Outbound pub/sub. Purely observational: callers swallow errors.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, event: &QuizEvent) -> Result<()>;
}

/// Read-only lookups against the external catalog service.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn question(&self, question_id: &str) -> Result<Option<QuestionInfo>>;

    async fn quiz(&self, quiz_id: &str) -> Result<Option<QuizInfo>>;

    /// Difficulty/topic lookup for every question of a quiz.
    async fn questions_for(&self, quiz: &QuizInfo) -> Result<HashMap<String, QuestionInfo>> {
        let mut out = HashMap::with_capacity(quiz.question_ids.len());
        for question_id in &quiz.question_ids {
            if let Some(info) = self.question(question_id).await? {
                out.insert(question_id.clone(), info);
            }
        }
        Ok(out)
    }
}
