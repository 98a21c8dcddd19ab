use std::sync::Arc;

use crate::error::{EngineError, EngineResult, RejectReason};
use crate::metrics::{record_rejection, record_submission, SESSIONS_ACTIVE};
use crate::models::{
    AcceptedAnswer, AnswerRecord, AttemptRecord, ParticipantStatus, QuizInfo, SessionMeta,
    SessionStatus,
};
use crate::services::completion::CompletionDetector;
use crate::services::scoring::ScoringEngine;
use crate::stores::{Catalog, CasExhausted, SessionStore};
use crate::utils::clock::Clock;

const MAX_RESPONSE_TIME_MS: u32 = 30_000;
const MAX_ATTEMPTS_PER_QUESTION: usize = 2;

/// Per-question attempt state machine over the ephemeral store. Every
/// accepted submission is one atomic read-modify-write on the participant
/// document; concurrent submissions for different questions from the same
/// user are serialized by the store's CAS retry, not by the caller.
pub struct AttemptLedger {
    sessions: Arc<dyn SessionStore>,
    catalog: Arc<dyn Catalog>,
    scoring: ScoringEngine,
    clock: Arc<dyn Clock>,
}

impl AttemptLedger {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        catalog: Arc<dyn Catalog>,
        scoring: ScoringEngine,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            catalog,
            scoring,
            clock,
        }
    }

    /// Create the session (first join of the quiz) and the participant
    /// document (first join of this user).
    pub async fn join_quiz(&self, quiz_id: &str, user_id: &str) -> EngineResult<()> {
        if quiz_id.is_empty() || user_id.is_empty() {
            record_rejection(RejectReason::InvalidInput.as_str());
            return Err(EngineError::Rejected(RejectReason::InvalidInput));
        }

        let quiz = self.quiz_info(quiz_id).await?;
        self.ensure_session(&quiz).await?;
        let created = self
            .sessions
            .ensure_participant(quiz_id, user_id, self.clock.now())
            .await?;
        if created {
            tracing::info!("Participant joined: quiz={}, user={}", quiz_id, user_id);
        }
        Ok(())
    }

    pub async fn submit_answer(
        &self,
        quiz_id: &str,
        user_id: &str,
        question_id: &str,
        answer_id: &str,
        response_time_ms: u32,
    ) -> EngineResult<AcceptedAnswer> {
        // Invalid input is rejected before any state is touched.
        if quiz_id.is_empty()
            || user_id.is_empty()
            || question_id.is_empty()
            || answer_id.is_empty()
            || response_time_ms > MAX_RESPONSE_TIME_MS
        {
            record_rejection(RejectReason::InvalidInput.as_str());
            return Err(EngineError::Rejected(RejectReason::InvalidInput));
        }

        let quiz = self.quiz_info(quiz_id).await?;
        if !quiz.question_ids.iter().any(|id| id == question_id) {
            tracing::warn!(
                "Question {} does not belong to quiz {}",
                question_id,
                quiz_id
            );
            record_rejection(RejectReason::InvalidInput.as_str());
            return Err(EngineError::Rejected(RejectReason::InvalidInput));
        }

        let question = self
            .catalog
            .question(question_id)
            .await?
            .ok_or_else(|| EngineError::UnknownQuestion(question_id.to_string()))?;

        let meta = self.ensure_session(&quiz).await?;

        let now = self.clock.now();
        let is_correct = answer_id == question.correct_answer_id;
        let total_questions = quiz.total_questions();
        let session_status = meta.status;
        let end_time = meta.end_time;
        let difficulty = question.difficulty;
        let scoring = &self.scoring;

        let question_id_owned = question_id.to_string();
        let answer_id_owned = answer_id.to_string();

        let mut apply = move |participant: &mut crate::models::Participant| {
            let existing_attempts = participant
                .answers
                .get(&question_id_owned)
                .map(|record| {
                    if record.is_correct {
                        return Err(RejectReason::AlreadyCorrect);
                    }
                    Ok(record.attempt_history.len())
                })
                .transpose()?
                .unwrap_or(0);

            if existing_attempts >= MAX_ATTEMPTS_PER_QUESTION {
                return Err(RejectReason::MaxAttemptsReached);
            }

            let attempt_index = (existing_attempts + 1) as u8;
            // Streak is read before this attempt mutates it.
            let breakdown = scoring.compute(
                difficulty,
                is_correct,
                response_time_ms,
                participant.current_streak,
                attempt_index,
            );

            let attempt = AttemptRecord {
                attempt_index,
                answer_id: answer_id_owned.clone(),
                is_correct,
                response_time_ms,
                points_earned: breakdown.total,
                scoring: breakdown,
                timestamp: now,
            };

            let record = participant
                .answers
                .entry(question_id_owned.clone())
                .or_insert_with(|| AnswerRecord::new(&question_id_owned));
            record.attempt_history.push(attempt);
            record.attempts = record.attempt_history.len() as u8;
            record.answer_id = answer_id_owned.clone();
            record.is_correct = is_correct;
            record.response_time_ms = response_time_ms;
            record.points_earned = breakdown.total;

            participant.current_streak = if is_correct {
                participant.current_streak + 1
            } else {
                0
            };
            participant.recompute_aggregates();

            let was = participant.status;
            participant.status = CompletionDetector::evaluate(
                total_questions,
                participant,
                session_status,
                end_time,
                now,
            );
            let completion_flipped = was == ParticipantStatus::InProgress
                && participant.status == ParticipantStatus::Completed;
            if completion_flipped {
                participant.completed_at = Some(now);
            }

            Ok(AcceptedAnswer {
                question_id: question_id_owned.clone(),
                is_correct,
                attempt_index,
                points_earned: breakdown.total,
                scoring: breakdown,
                total_score: participant.current_score,
                current_streak: participant.current_streak,
                completion_flipped,
            })
        };

        let outcome = self
            .sessions
            .update_participant(quiz_id, user_id, now, &mut apply)
            .await
            .map_err(|err| match err.downcast::<CasExhausted>() {
                Ok(conflict) => EngineError::TransactionConflict {
                    quiz_id: conflict.quiz_id,
                    user_id: conflict.user_id,
                },
                Err(other) => EngineError::Store(other),
            })?;

        match outcome {
            Ok(accepted) => {
                record_submission(accepted.is_correct);
                tracing::info!(
                    "Answer accepted: quiz={}, user={}, question={}, correct={}, points={}, attempt={}",
                    quiz_id,
                    user_id,
                    question_id,
                    accepted.is_correct,
                    accepted.points_earned,
                    accepted.attempt_index
                );
                Ok(accepted)
            }
            Err(reason) => {
                record_rejection(reason.as_str());
                tracing::info!(
                    "Answer rejected: quiz={}, user={}, question={}, reason={}",
                    quiz_id,
                    user_id,
                    question_id,
                    reason.as_str()
                );
                Err(EngineError::Rejected(reason))
            }
        }
    }

    async fn quiz_info(&self, quiz_id: &str) -> EngineResult<QuizInfo> {
        self.catalog
            .quiz(quiz_id)
            .await?
            .ok_or_else(|| EngineError::UnknownQuiz(quiz_id.to_string()))
    }

    /// Session documents are created lazily on first activity for a quiz.
    async fn ensure_session(&self, quiz: &QuizInfo) -> EngineResult<SessionMeta> {
        if let Some(meta) = self.sessions.session_meta(&quiz.quiz_id).await? {
            return Ok(meta);
        }

        let meta = SessionMeta {
            quiz_id: quiz.quiz_id.clone(),
            status: SessionStatus::Active,
            end_time: quiz.end_time,
            created_at: self.clock.now(),
        };
        if self.sessions.create_session(&meta).await? {
            SESSIONS_ACTIVE.inc();
            tracing::info!(
                "Session created: quiz={}, questions={}, ends_at={}",
                quiz.quiz_id,
                quiz.total_questions(),
                quiz.end_time
            );
        }
        // Lost creation race: someone else just made it; re-read.
        match self.sessions.session_meta(&quiz.quiz_id).await? {
            Some(meta) => Ok(meta),
            None => Ok(meta),
        }
    }
}
