use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::metrics::{
    record_sync_run, SESSIONS_ACTIVE, SYNC_DURATION_SECONDS, SYNC_LOCK_CONTENTION_TOTAL,
    SYNC_ROWS_WRITTEN_TOTAL,
};
use crate::models::durable::{DurableAttemptRow, QuizResultRow, TopicPerformanceRow};
use crate::models::events::QuizFinished;
use crate::models::{
    Participant, ParticipantStatus, QuestionInfo, QuizInfo, SessionMeta,
};
use crate::services::broadcaster::EventBroadcaster;
use crate::services::completion::CompletionDetector;
use crate::services::scoring::ScoringEngine;
use crate::stores::{AttemptRepository, Catalog, LockManager, SessionStore};
use crate::utils::clock::Clock;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub lock_ttl_secs: u64,
    pub lock_renew_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 120,
            lock_renew_secs: 45,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub participants_processed: u32,
    pub attempts_written: u64,
    pub errors: u32,
    /// True once the ephemeral session was torn down, which only happens
    /// after every participant finished and every write succeeded.
    pub session_deleted: bool,
}

/// Outcome of a reconciliation request. `Locked` is not a failure: another
/// run holds the lease and will do the work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Locked,
    Completed(SyncReport),
}

/// Reconciles ephemeral session state into the durable store, exactly once
/// per attempt. Single-flight per quiz via a lease lock with periodic
/// renewal; every durable write is an upsert keyed on
/// `(user, question, quiz, attempt_index)` so a crashed or repeated run
/// refreshes rows instead of duplicating them.
pub struct SyncCoordinator {
    sessions: Arc<dyn SessionStore>,
    repository: Arc<dyn AttemptRepository>,
    catalog: Arc<dyn Catalog>,
    locks: Arc<dyn LockManager>,
    broadcaster: Arc<EventBroadcaster>,
    scoring: ScoringEngine,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        repository: Arc<dyn AttemptRepository>,
        catalog: Arc<dyn Catalog>,
        locks: Arc<dyn LockManager>,
        broadcaster: Arc<EventBroadcaster>,
        scoring: ScoringEngine,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            sessions,
            repository,
            catalog,
            locks,
            broadcaster,
            scoring,
            clock,
            settings,
        }
    }

    pub async fn reconcile(&self, quiz_id: &str) -> EngineResult<SyncOutcome> {
        let lock_key = format!("synclock:{}", quiz_id);
        let token = match self
            .locks
            .acquire(&lock_key, self.settings.lock_ttl_secs)
            .await?
        {
            Some(token) => token,
            None => {
                SYNC_LOCK_CONTENTION_TOTAL.inc();
                record_sync_run("locked");
                tracing::info!(
                    "Reconciliation skipped, lease held elsewhere: quiz={}",
                    quiz_id
                );
                return Ok(SyncOutcome::Locked);
            }
        };

        let renewal = self.spawn_lease_renewal(lock_key.clone(), token.clone());
        let timer = SYNC_DURATION_SECONDS.start_timer();

        let result = self.run_locked(quiz_id).await;

        timer.observe_duration();
        renewal.abort();
        match self.locks.release(&lock_key, &token).await {
            Ok(_) => {}
            Err(err) => {
                // The TTL will clear it either way.
                tracing::warn!("Lease release failed: quiz={}, error={:#}", quiz_id, err);
            }
        }

        match &result {
            Ok(report) if report.errors == 0 => record_sync_run("success"),
            Ok(_) => record_sync_run("partial"),
            Err(_) => record_sync_run("error"),
        }
        result.map(SyncOutcome::Completed)
    }

    /// Keeps the lease alive for long runs. Losing the lease is logged and
    /// the run continues: upsert idempotency makes a stolen lease safe, at
    /// worst a second run refreshes the same rows.
    fn spawn_lease_renewal(&self, lock_key: String, token: String) -> tokio::task::JoinHandle<()> {
        let locks = Arc::clone(&self.locks);
        let interval = Duration::from_secs(self.settings.lock_renew_secs);
        let ttl = self.settings.lock_ttl_secs;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match locks.extend(&lock_key, &token, ttl).await {
                    Ok(true) => {
                        tracing::debug!("Lease extended: key={}", lock_key);
                    }
                    Ok(false) => {
                        tracing::warn!("Lease no longer held: key={}", lock_key);
                        break;
                    }
                    Err(err) => {
                        tracing::warn!("Lease renewal failed: key={}, error={:#}", lock_key, err);
                    }
                }
            }
        })
    }

    async fn run_locked(&self, quiz_id: &str) -> EngineResult<SyncReport> {
        // The CAS transaction only acks after its write landed, so a read
        // here observes every previously accepted submission.
        let session = match self.sessions.read_session(quiz_id).await? {
            Some(session) => session,
            None => {
                tracing::debug!("Nothing to reconcile: quiz={}", quiz_id);
                return Ok(SyncReport::default());
            }
        };

        let quiz = self
            .catalog
            .quiz(quiz_id)
            .await?
            .ok_or_else(|| EngineError::UnknownQuiz(quiz_id.to_string()))?;
        let questions = self.catalog.questions_for(&quiz).await?;
        let now = self.clock.now();

        let mut report = SyncReport::default();
        let mut all_completed = true;

        // Deterministic participant order keeps repeated runs comparable.
        let mut user_ids: Vec<&String> = session.participants.keys().collect();
        user_ids.sort();

        for user_id in user_ids {
            let participant = &session.participants[user_id];
            match self
                .sync_participant(&quiz, &questions, &session.meta, participant, now)
                .await
            {
                Ok((written, status)) => {
                    report.participants_processed += 1;
                    report.attempts_written += written;
                    SYNC_ROWS_WRITTEN_TOTAL.inc_by(written);
                    if status != ParticipantStatus::Completed {
                        all_completed = false;
                    }
                }
                Err(err) => {
                    // One participant's failure must not block the rest.
                    report.errors += 1;
                    all_completed = false;
                    tracing::warn!(
                        "Participant sync failed: quiz={}, user={}, error={:#}",
                        quiz_id,
                        user_id,
                        err
                    );
                }
            }
        }

        // Progress for in-flight participants lives only in the session
        // tree, so teardown waits for the last finisher.
        if report.errors == 0 && all_completed {
            self.sessions
                .delete_session(quiz_id)
                .await
                .context("Failed to delete reconciled session")?;
            report.session_deleted = true;
            SESSIONS_ACTIVE.dec();
            self.broadcaster
                .quiz_finished(QuizFinished {
                    quiz_id: quiz_id.to_string(),
                    participants_synced: report.participants_processed,
                    finished_at: now,
                })
                .await;
            tracing::info!(
                "Reconciliation complete: quiz={}, participants={}, rows={}",
                quiz_id,
                report.participants_processed,
                report.attempts_written
            );
        } else if report.errors > 0 {
            tracing::warn!(
                "Reconciliation partial, session retained for retry: quiz={}, errors={}",
                quiz_id,
                report.errors
            );
        } else {
            tracing::debug!(
                "Session retained, participants still in progress: quiz={}",
                quiz_id
            );
        }

        Ok(report)
    }

    async fn sync_participant(
        &self,
        quiz: &QuizInfo,
        questions: &HashMap<String, QuestionInfo>,
        meta: &SessionMeta,
        participant: &Participant,
        now: DateTime<Utc>,
    ) -> Result<(u64, ParticipantStatus)> {
        let quiz_id = &quiz.quiz_id;
        let user_id = &participant.user_id;

        // Stored status is advisory only.
        let status = CompletionDetector::authoritative(
            quiz_id,
            quiz.total_questions(),
            participant,
            meta.status,
            meta.end_time,
            now,
        );

        let existing = self
            .repository
            .attempts_for(quiz_id, Some(user_id))
            .await
            .context("Failed to read existing attempt rows")?;
        let existing_by_key: HashMap<String, &DurableAttemptRow> =
            existing.iter().map(|row| (row.key(), row)).collect();

        // Flatten the full attempt history into durable rows.
        let mut rows: Vec<DurableAttemptRow> = Vec::new();
        for record in participant.answers.values() {
            for attempt in &record.attempt_history {
                rows.push(DurableAttemptRow {
                    user_id: user_id.clone(),
                    question_id: record.question_id.clone(),
                    quiz_id: quiz_id.clone(),
                    attempt_index: attempt.attempt_index,
                    selected_answer: Some(attempt.answer_id.clone()),
                    is_correct: attempt.is_correct,
                    response_time_ms: attempt.response_time_ms,
                    points_earned: attempt.points_earned,
                    scoring: Some(attempt.scoring),
                    unanswered: false,
                    recorded_at: attempt.timestamp,
                });
            }
        }

        // Completed participants get synthetic zero-point rows for every
        // question they never touched, unless an earlier run already wrote
        // them.
        if status == ParticipantStatus::Completed {
            for question_id in &quiz.question_ids {
                if participant.answers.contains_key(question_id) {
                    continue;
                }
                let key = DurableAttemptRow::composite_key(user_id, question_id, quiz_id, 1);
                if existing_by_key.contains_key(&key) {
                    continue;
                }
                rows.push(DurableAttemptRow {
                    user_id: user_id.clone(),
                    question_id: question_id.clone(),
                    quiz_id: quiz_id.clone(),
                    attempt_index: 1,
                    selected_answer: None,
                    is_correct: false,
                    response_time_ms: 0,
                    points_earned: 0,
                    scoring: None,
                    unanswered: true,
                    recorded_at: now,
                });
            }
        }

        let written = self
            .repository
            .upsert_attempts(&rows)
            .await
            .context("Failed to upsert attempt rows")?;

        // Score over the union of this run's rows and anything an earlier
        // run wrote (e.g. synthetic rows skipped above), latest attempt per
        // question only.
        let mut merged: HashMap<String, DurableAttemptRow> = existing_by_key
            .into_iter()
            .map(|(key, row)| (key, row.clone()))
            .collect();
        for row in &rows {
            merged.insert(row.key(), row.clone());
        }

        let mut latest: HashMap<&str, &DurableAttemptRow> = HashMap::new();
        for row in merged.values() {
            latest
                .entry(row.question_id.as_str())
                .and_modify(|current| {
                    if row.attempt_index > current.attempt_index {
                        *current = row;
                    }
                })
                .or_insert(row);
        }

        let raw_total: i64 = latest.values().map(|row| row.points_earned).sum();
        let bonuses_total: i64 = latest
            .values()
            .filter_map(|row| row.scoring.as_ref())
            .map(|scoring| scoring.bonuses())
            .sum();
        let max_points: i64 = latest
            .keys()
            .filter_map(|question_id| questions.get(*question_id))
            .map(|question| self.scoring.max_points_for(question.difficulty))
            .sum();

        let answered_count = participant.answers.len() as i64;
        let normalized = if max_points > 0 {
            (raw_total as f64 / max_points as f64 * 10.0).clamp(0.0, 10.0)
        } else {
            ((answered_count * 10) as f64).clamp(0.0, 10.0)
        };

        let completion_time = participant.completed_at.or(match status {
            ParticipantStatus::Completed => Some(now),
            ParticipantStatus::InProgress => None,
        });

        self.repository
            .upsert_result(&QuizResultRow {
                user_id: user_id.clone(),
                quiz_id: quiz_id.clone(),
                score: normalized,
                status,
                raw_total_points: raw_total,
                max_points,
                bonuses_total,
                completion_time,
                synced_at: now,
            })
            .await
            .context("Failed to upsert quiz result")?;

        self.update_topic_performance(quiz_id, user_id, questions, &latest, &merged, now)
            .await?;

        tracing::info!(
            "Participant synced: quiz={}, user={}, status={}, raw={}, max={}, score={:.2}",
            quiz_id,
            user_id,
            status.as_str(),
            raw_total,
            max_points,
            normalized
        );

        Ok((written, status))
    }

    /// Per-topic rollup of the same flattened attempts, keyed per quiz so a
    /// re-run overwrites absolute values.
    async fn update_topic_performance(
        &self,
        quiz_id: &str,
        user_id: &str,
        questions: &HashMap<String, QuestionInfo>,
        latest: &HashMap<&str, &DurableAttemptRow>,
        merged: &HashMap<String, DurableAttemptRow>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        struct TopicAccumulator {
            attempts_total: u32,
            correct_count: u32,
            questions_seen: u32,
            points_total: i64,
        }

        let mut by_topic: HashMap<&str, TopicAccumulator> = HashMap::new();

        for (question_id, row) in latest {
            let topic_id = match questions
                .get(*question_id)
                .and_then(|question| question.topic_id.as_deref())
            {
                Some(topic_id) => topic_id,
                None => continue,
            };

            let attempts_here = merged
                .values()
                .filter(|r| r.question_id == *question_id && !r.unanswered)
                .count() as u32;

            let acc = by_topic.entry(topic_id).or_insert(TopicAccumulator {
                attempts_total: 0,
                correct_count: 0,
                questions_seen: 0,
                points_total: 0,
            });
            acc.attempts_total += attempts_here;
            acc.questions_seen += 1;
            if row.is_correct {
                acc.correct_count += 1;
            }
            acc.points_total += row.points_earned;
        }

        for (topic_id, acc) in by_topic {
            let percentage = if acc.questions_seen == 0 {
                0.0
            } else {
                acc.correct_count as f64 / acc.questions_seen as f64 * 100.0
            };
            self.repository
                .upsert_topic_performance(&TopicPerformanceRow {
                    user_id: user_id.to_string(),
                    topic_id: topic_id.to_string(),
                    quiz_id: quiz_id.to_string(),
                    attempts_total: acc.attempts_total,
                    correct_count: acc.correct_count,
                    points_total: acc.points_total,
                    percentage,
                    updated_at: now,
                })
                .await
                .context("Failed to upsert topic performance")?;
        }

        Ok(())
    }
}
