use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod durable;
pub mod events;

/// Quiz-instance session state held in the ephemeral store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub quiz_id: String,
    pub status: SessionStatus,
    pub end_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Fully assembled session: meta plus every participant document under it.
#[derive(Debug, Clone)]
pub struct Session {
    pub meta: SessionMeta,
    pub participants: HashMap<String, Participant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    InProgress,
    Completed,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::InProgress => "in_progress",
            ParticipantStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub current_score: i64,
    pub correct_answers: u32,
    /// Count of distinct questions attempted, not total attempts.
    pub total_answers: u32,
    pub current_streak: u32,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Keyed by question id.
    pub answers: HashMap<String, AnswerRecord>,
}

impl Participant {
    pub fn new(user_id: &str, joined_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            current_score: 0,
            correct_answers: 0,
            total_answers: 0,
            current_streak: 0,
            status: ParticipantStatus::InProgress,
            joined_at,
            completed_at: None,
            answers: HashMap::new(),
        }
    }

    /// Recompute aggregates from the full answer map, latest attempt per
    /// question only. Never maintained incrementally: recomputation from the
    /// map is what keeps concurrent submissions from drifting the totals.
    pub fn recompute_aggregates(&mut self) {
        self.total_answers = self.answers.len() as u32;
        self.correct_answers = self
            .answers
            .values()
            .filter(|record| record.is_correct)
            .count() as u32;
        self.current_score = self
            .answers
            .values()
            .map(|record| record.points_earned)
            .sum();
    }

    pub fn accuracy(&self) -> f64 {
        if self.total_answers == 0 {
            0.0
        } else {
            self.correct_answers as f64 / self.total_answers as f64
        }
    }

    /// Mean response time over the latest attempt of each answered question.
    pub fn average_response_ms(&self) -> f64 {
        if self.answers.is_empty() {
            return 0.0;
        }
        let total: u64 = self
            .answers
            .values()
            .map(|record| record.response_time_ms as u64)
            .sum();
        total as f64 / self.answers.len() as f64
    }

    pub fn last_answer_at(&self) -> Option<DateTime<Utc>> {
        self.answers
            .values()
            .filter_map(|record| record.attempt_history.last())
            .map(|attempt| attempt.timestamp)
            .max()
    }
}

/// Per-question answer state. The top-level fields mirror the *latest*
/// attempt; the full history lives in `attempt_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question_id: String,
    pub answer_id: String,
    pub is_correct: bool,
    pub response_time_ms: u32,
    pub points_earned: i64,
    pub attempts: u8,
    pub attempt_history: Vec<AttemptRecord>,
}

impl AnswerRecord {
    pub fn new(question_id: &str) -> Self {
        Self {
            question_id: question_id.to_string(),
            answer_id: String::new(),
            is_correct: false,
            response_time_ms: 0,
            points_earned: 0,
            attempts: 0,
            attempt_history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_index: u8,
    pub answer_id: String,
    pub is_correct: bool,
    pub response_time_ms: u32,
    pub points_earned: i64,
    pub scoring: ScoreBreakdown,
    pub timestamp: DateTime<Utc>,
}

/// Full points breakdown, retained per attempt for audit and for the
/// validator's re-derivation check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: i64,
    pub speed_bonus: i64,
    pub streak_bonus: i64,
    pub multiplier: f64,
    pub total: i64,
}

impl ScoreBreakdown {
    pub fn zero() -> Self {
        Self {
            base: 0,
            speed_bonus: 0,
            streak_bonus: 0,
            multiplier: 1.0,
            total: 0,
        }
    }

    pub fn bonuses(&self) -> i64 {
        self.speed_bonus + self.streak_bonus
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Catalog view of a question: everything the engine needs to grade and
/// score a submission. Supplied by the external catalog, never stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionInfo {
    #[serde(rename = "_id")]
    pub question_id: String,
    pub difficulty: Difficulty,
    pub correct_answer_id: String,
    pub topic_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizInfo {
    #[serde(rename = "_id")]
    pub quiz_id: String,
    pub question_ids: Vec<String>,
    pub end_time: DateTime<Utc>,
}

impl QuizInfo {
    pub fn total_questions(&self) -> usize {
        self.question_ids.len()
    }
}

/// Successful submission outcome returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedAnswer {
    pub question_id: String,
    pub is_correct: bool,
    pub attempt_index: u8,
    pub points_earned: i64,
    pub scoring: ScoreBreakdown,
    pub total_score: i64,
    pub current_streak: u32,
    /// True when this submission flipped the participant to `completed`.
    pub completion_flipped: bool,
}
