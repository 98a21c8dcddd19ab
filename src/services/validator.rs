use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::durable::DurableAttemptRow;
use crate::models::{Participant, ParticipantStatus, QuestionInfo};
use crate::services::scoring::ScoringEngine;
use crate::stores::{AttemptRepository, Catalog, SessionStore};

pub const MAX_ATTEMPTS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    AggregateMismatch,
    AttemptLimitExceeded,
    AttemptAfterCorrect,
    AttemptIndexGap,
    ScoreBreakdownMismatch,
    IncorrectAttemptScored,
    LatestMirrorStale,
    CompletionTimestampMissing,
    DurableIndexOutOfRange,
    SyntheticRowScored,
    ResultTotalsMismatch,
    NormalizedScoreOutOfRange,
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub quiz_id: String,
    pub user_id: Option<String>,
    pub kind: ViolationKind,
    pub detail: String,
}

impl Violation {
    fn for_user(quiz_id: &str, user_id: &str, kind: ViolationKind, detail: String) -> Self {
        Self {
            quiz_id: quiz_id.to_string(),
            user_id: Some(user_id.to_string()),
            kind,
            detail,
        }
    }
}

/// Cross-checks the ephemeral session tree and the durable attempt rows
/// against the scoring and retry invariants. Read-only: reports violations,
/// never repairs them.
pub struct DataValidator {
    sessions: Arc<dyn SessionStore>,
    repository: Arc<dyn AttemptRepository>,
    catalog: Arc<dyn Catalog>,
    scoring: ScoringEngine,
}

impl DataValidator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        repository: Arc<dyn AttemptRepository>,
        catalog: Arc<dyn Catalog>,
        scoring: ScoringEngine,
    ) -> Self {
        Self {
            sessions,
            repository,
            catalog,
            scoring,
        }
    }

    pub async fn validate_quiz(
        &self,
        quiz_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<Violation>> {
        let mut violations = Vec::new();

        let questions = match self.catalog.quiz(quiz_id).await? {
            Some(quiz) => self.catalog.questions_for(&quiz).await?,
            None => HashMap::new(),
        };

        if let Some(session) = self.sessions.read_session(quiz_id).await? {
            let mut user_ids: Vec<&String> = session.participants.keys().collect();
            user_ids.sort();
            for uid in user_ids {
                if user_id.is_some_and(|filter| filter != uid.as_str()) {
                    continue;
                }
                self.check_participant(
                    quiz_id,
                    &session.participants[uid],
                    &questions,
                    &mut violations,
                );
            }
        }

        self.check_durable(quiz_id, user_id, &questions, &mut violations)
            .await?;

        if !violations.is_empty() {
            tracing::warn!(
                "Validation found violations: quiz={}, count={}",
                quiz_id,
                violations.len()
            );
        }
        Ok(violations)
    }

    fn check_participant(
        &self,
        quiz_id: &str,
        participant: &Participant,
        questions: &HashMap<String, QuestionInfo>,
        violations: &mut Vec<Violation>,
    ) {
        let user_id = &participant.user_id;

        // Aggregates must be derivable from the answer map alone.
        let mut shadow = participant.clone();
        shadow.recompute_aggregates();
        if shadow.current_score != participant.current_score
            || shadow.correct_answers != participant.correct_answers
            || shadow.total_answers != participant.total_answers
        {
            violations.push(Violation::for_user(
                quiz_id,
                user_id,
                ViolationKind::AggregateMismatch,
                format!(
                    "stored score={} correct={} total={}, derived score={} correct={} total={}",
                    participant.current_score,
                    participant.correct_answers,
                    participant.total_answers,
                    shadow.current_score,
                    shadow.correct_answers,
                    shadow.total_answers
                ),
            ));
        }

        if participant.status == ParticipantStatus::Completed && participant.completed_at.is_none()
        {
            violations.push(Violation::for_user(
                quiz_id,
                user_id,
                ViolationKind::CompletionTimestampMissing,
                "completed participant has no completed_at".to_string(),
            ));
        }

        for (question_id, record) in &participant.answers {
            if record.attempt_history.len() > MAX_ATTEMPTS as usize {
                violations.push(Violation::for_user(
                    quiz_id,
                    user_id,
                    ViolationKind::AttemptLimitExceeded,
                    format!(
                        "question={} has {} attempts",
                        question_id,
                        record.attempt_history.len()
                    ),
                ));
            }

            let mut seen_correct = false;
            for (position, attempt) in record.attempt_history.iter().enumerate() {
                if seen_correct {
                    violations.push(Violation::for_user(
                        quiz_id,
                        user_id,
                        ViolationKind::AttemptAfterCorrect,
                        format!(
                            "question={} attempt_index={} follows a correct attempt",
                            question_id, attempt.attempt_index
                        ),
                    ));
                }
                seen_correct |= attempt.is_correct;

                if attempt.attempt_index as usize != position + 1 {
                    violations.push(Violation::for_user(
                        quiz_id,
                        user_id,
                        ViolationKind::AttemptIndexGap,
                        format!(
                            "question={} expected index {} got {}",
                            question_id,
                            position + 1,
                            attempt.attempt_index
                        ),
                    ));
                }

                if !attempt.is_correct
                    && (attempt.points_earned != 0 || attempt.scoring.total != 0)
                {
                    violations.push(Violation::for_user(
                        quiz_id,
                        user_id,
                        ViolationKind::IncorrectAttemptScored,
                        format!(
                            "question={} attempt_index={} incorrect but earned {}",
                            question_id, attempt.attempt_index, attempt.points_earned
                        ),
                    ));
                }

                // The stored breakdown must re-derive to the points granted.
                // The streak bonus is taken as recorded since the streak at
                // submission time is not recoverable here.
                if attempt.is_correct {
                    if let Some(question) = questions.get(question_id) {
                        let config = self.scoring.config();
                        let base = config.base_for(question.difficulty);
                        let speed = if attempt.response_time_ms <= config.speed_window_ms {
                            config.speed_bonus_for(question.difficulty)
                        } else {
                            0
                        };
                        let subtotal = base + speed + attempt.scoring.streak_bonus;
                        let expected =
                            (subtotal as f64 * attempt.scoring.multiplier).floor() as i64;
                        if attempt.scoring.base != base
                            || attempt.scoring.speed_bonus != speed
                            || attempt.scoring.total != expected
                            || attempt.points_earned != expected
                        {
                            violations.push(Violation::for_user(
                                quiz_id,
                                user_id,
                                ViolationKind::ScoreBreakdownMismatch,
                                format!(
                                    "question={} attempt_index={} stored total={}, derived {}",
                                    question_id,
                                    attempt.attempt_index,
                                    attempt.scoring.total,
                                    expected
                                ),
                            ));
                        }
                    }
                }
            }

            if let Some(last) = record.attempt_history.last() {
                if record.answer_id != last.answer_id
                    || record.is_correct != last.is_correct
                    || record.points_earned != last.points_earned
                    || record.attempts != record.attempt_history.len() as u8
                {
                    violations.push(Violation::for_user(
                        quiz_id,
                        user_id,
                        ViolationKind::LatestMirrorStale,
                        format!(
                            "question={} latest mirror diverges from attempt history",
                            question_id
                        ),
                    ));
                }
            }
        }
    }

    async fn check_durable(
        &self,
        quiz_id: &str,
        user_id: Option<&str>,
        questions: &HashMap<String, QuestionInfo>,
        violations: &mut Vec<Violation>,
    ) -> Result<()> {
        let rows = self.repository.attempts_for(quiz_id, user_id).await?;

        let mut by_user: HashMap<&str, Vec<&DurableAttemptRow>> = HashMap::new();
        for row in &rows {
            if row.attempt_index == 0 || row.attempt_index > MAX_ATTEMPTS {
                violations.push(Violation::for_user(
                    quiz_id,
                    &row.user_id,
                    ViolationKind::DurableIndexOutOfRange,
                    format!(
                        "question={} attempt_index={}",
                        row.question_id, row.attempt_index
                    ),
                ));
            }
            if row.unanswered
                && (row.is_correct || row.points_earned != 0 || row.selected_answer.is_some())
            {
                violations.push(Violation::for_user(
                    quiz_id,
                    &row.user_id,
                    ViolationKind::SyntheticRowScored,
                    format!("question={} synthetic row carries answer data", row.question_id),
                ));
            }
            by_user.entry(row.user_id.as_str()).or_default().push(row);
        }

        let mut users: Vec<&&str> = by_user.keys().collect();
        users.sort();
        for uid in users {
            let user_rows = &by_user[*uid];

            // A second attempt only exists after a first, incorrect one.
            let mut first_attempts: HashMap<&str, &DurableAttemptRow> = HashMap::new();
            for row in user_rows {
                if row.attempt_index == 1 {
                    first_attempts.insert(row.question_id.as_str(), row);
                }
            }
            for row in user_rows {
                if row.attempt_index != 2 {
                    continue;
                }
                match first_attempts.get(row.question_id.as_str()) {
                    None => violations.push(Violation::for_user(
                        quiz_id,
                        uid,
                        ViolationKind::AttemptIndexGap,
                        format!("question={} attempt 2 has no attempt 1 row", row.question_id),
                    )),
                    Some(first) if first.is_correct => violations.push(Violation::for_user(
                        quiz_id,
                        uid,
                        ViolationKind::AttemptAfterCorrect,
                        format!(
                            "question={} attempt 2 follows a correct attempt 1",
                            row.question_id
                        ),
                    )),
                    _ => {}
                }
            }

            let result = match self.repository.result_for(quiz_id, uid).await? {
                Some(result) => result,
                None => continue,
            };

            let mut latest: HashMap<&str, &DurableAttemptRow> = HashMap::new();
            for row in user_rows {
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
            let max_points: i64 = latest
                .keys()
                .filter_map(|question_id| questions.get(*question_id))
                .map(|question| self.scoring.max_points_for(question.difficulty))
                .sum();

            if result.raw_total_points != raw_total || result.max_points != max_points {
                violations.push(Violation::for_user(
                    quiz_id,
                    uid,
                    ViolationKind::ResultTotalsMismatch,
                    format!(
                        "stored raw={} max={}, derived raw={} max={}",
                        result.raw_total_points, result.max_points, raw_total, max_points
                    ),
                ));
            }

            let in_range = (0.0..=10.0).contains(&result.score);
            let expected = if max_points > 0 {
                Some((raw_total as f64 / max_points as f64 * 10.0).clamp(0.0, 10.0))
            } else {
                None
            };
            let matches = expected.map_or(in_range, |value| (result.score - value).abs() < 1e-9);
            if !in_range || !matches {
                violations.push(Violation::for_user(
                    quiz_id,
                    uid,
                    ViolationKind::NormalizedScoreOutOfRange,
                    format!("stored score={}", result.score),
                ));
            }
        }

        Ok(())
    }
}
