use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ParticipantStatus;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QuizEvent {
    AnswerResult(AnswerResult),
    LeaderboardUpdate(LeaderboardUpdate),
    RoundTopFinisher(RoundTopFinisher),
    QuizFinished(QuizFinished),
}

/// Sent to the submitting user after every accepted attempt.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnswerResult {
    pub quiz_id: String,
    pub user_id: String,
    pub question_id: String,
    pub is_correct: bool,
    pub points_earned: i64,
    pub total_score: i64,
    pub attempt_index: u8,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LeaderboardUpdate {
    pub quiz_id: String,
    pub entries: Vec<LeaderboardEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LeaderboardEntry {
    pub user_id: String,
    pub score: i64,
    pub correct_answers: u32,
    pub status: ParticipantStatus,
    pub position: u32,
    pub previous_position: Option<u32>,
}

/// Racing-mode celebration: first participant of the quiz to finish.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RoundTopFinisher {
    pub quiz_id: String,
    pub user_id: String,
    pub score: i64,
    pub completed_at: DateTime<Utc>,
}

/// Observer notification once reconciliation finalizes a session.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QuizFinished {
    pub quiz_id: String,
    pub participants_synced: u32,
    pub finished_at: DateTime<Utc>,
}

impl QuizEvent {
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            QuizEvent::AnswerResult(_) => "answer-result",
            QuizEvent::LeaderboardUpdate(_) => "leaderboard-update",
            QuizEvent::RoundTopFinisher(_) => "round-top-finisher",
            QuizEvent::QuizFinished(_) => "quiz-finished",
        }
    }
}
