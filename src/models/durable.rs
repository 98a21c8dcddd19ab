use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ParticipantStatus, ScoreBreakdown};

/// One row per attempt in the system of record, unique per
/// `(user_id, question_id, quiz_id, attempt_index)`. Synthetic rows are
/// written for questions a completed participant never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableAttemptRow {
    pub user_id: String,
    pub question_id: String,
    pub quiz_id: String,
    pub attempt_index: u8,
    /// `None` on synthetic unanswered rows.
    pub selected_answer: Option<String>,
    pub is_correct: bool,
    pub response_time_ms: u32,
    pub points_earned: i64,
    pub scoring: Option<ScoreBreakdown>,
    pub unanswered: bool,
    pub recorded_at: DateTime<Utc>,
}

impl DurableAttemptRow {
    /// Composite upsert key. Re-running a sync refreshes the same row
    /// instead of inserting a sibling.
    pub fn key(&self) -> String {
        Self::composite_key(
            &self.user_id,
            &self.question_id,
            &self.quiz_id,
            self.attempt_index,
        )
    }

    pub fn composite_key(
        user_id: &str,
        question_id: &str,
        quiz_id: &str,
        attempt_index: u8,
    ) -> String {
        format!("{}:{}:{}:{}", user_id, question_id, quiz_id, attempt_index)
    }
}

/// One row per `(user_id, quiz_id)`, refreshed on every reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizResultRow {
    pub user_id: String,
    pub quiz_id: String,
    /// Normalized to the 0..10 scale.
    pub score: f64,
    pub status: ParticipantStatus,
    pub raw_total_points: i64,
    pub max_points: i64,
    pub bonuses_total: i64,
    pub completion_time: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

impl QuizResultRow {
    pub fn key(&self) -> String {
        format!("{}:{}", self.user_id, self.quiz_id)
    }
}

/// Per-topic rollup of the flattened attempts, keyed per quiz so a re-run
/// overwrites absolute values instead of double-incrementing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicPerformanceRow {
    pub user_id: String,
    pub topic_id: String,
    pub quiz_id: String,
    pub attempts_total: u32,
    pub correct_count: u32,
    pub points_total: i64,
    pub percentage: f64,
    pub updated_at: DateTime<Utc>,
}

impl TopicPerformanceRow {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.user_id, self.topic_id, self.quiz_id)
    }
}
