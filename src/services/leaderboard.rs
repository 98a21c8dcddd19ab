use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::events::LeaderboardEntry;
use crate::models::{Participant, ParticipantStatus};

/// One ranked participant, with every tie-break key materialized so repeated
/// calls on unchanged input are byte-identical.
#[derive(Debug, Clone)]
pub struct RankedParticipant {
    pub user_id: String,
    pub score: i64,
    pub correct_answers: u32,
    pub total_answers: u32,
    pub accuracy: f64,
    pub status: ParticipantStatus,
    pub average_response_ms: f64,
    pub last_answer_at: Option<DateTime<Utc>>,
    pub position: u32,
    pub previous_position: Option<u32>,
}

impl RankedParticipant {
    pub fn as_event_entry(&self) -> LeaderboardEntry {
        LeaderboardEntry {
            user_id: self.user_id.clone(),
            score: self.score,
            correct_answers: self.correct_answers,
            status: self.status,
            position: self.position,
            previous_position: self.previous_position,
        }
    }
}

/// Deterministic total order over participants. Positions from the previous
/// ranking of the same quiz are kept in-process so update events can carry
/// movement; the cache is dropped when the session is reconciled away.
#[derive(Default)]
pub struct LeaderboardRanker {
    previous_positions: Mutex<HashMap<String, HashMap<String, u32>>>,
}

impl LeaderboardRanker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rank<'a, I>(&self, quiz_id: &str, participants: I) -> Vec<RankedParticipant>
    where
        I: IntoIterator<Item = &'a Participant>,
    {
        let mut entries: Vec<RankedParticipant> = participants
            .into_iter()
            .map(|p| RankedParticipant {
                user_id: p.user_id.clone(),
                score: p.current_score,
                correct_answers: p.correct_answers,
                total_answers: p.total_answers,
                accuracy: p.accuracy(),
                status: p.status,
                average_response_ms: p.average_response_ms(),
                last_answer_at: p.last_answer_at(),
                position: 0,
                previous_position: None,
            })
            .collect();

        // Stable sort over the six tie-break keys; user id last purely to
        // pin an order when everything else is equal.
        entries.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.correct_answers.cmp(&a.correct_answers))
                .then_with(|| b.accuracy.total_cmp(&a.accuracy))
                .then_with(|| completion_rank(a.status).cmp(&completion_rank(b.status)))
                .then_with(|| a.average_response_ms.total_cmp(&b.average_response_ms))
                .then_with(|| {
                    last_answer_key(a.last_answer_at).cmp(&last_answer_key(b.last_answer_at))
                })
                .then_with(|| a.user_id.cmp(&b.user_id))
        });

        let mut cache = self.previous_positions.lock().unwrap();
        let previous = cache.entry(quiz_id.to_string()).or_default();

        for (idx, entry) in entries.iter_mut().enumerate() {
            entry.position = (idx + 1) as u32;
            entry.previous_position = previous.get(&entry.user_id).copied();
        }

        *previous = entries
            .iter()
            .map(|entry| (entry.user_id.clone(), entry.position))
            .collect();

        entries
    }

    /// Drop the movement cache for a quiz whose session is gone.
    pub fn forget_quiz(&self, quiz_id: &str) {
        self.previous_positions.lock().unwrap().remove(quiz_id);
    }
}

fn completion_rank(status: ParticipantStatus) -> u8 {
    match status {
        ParticipantStatus::Completed => 0,
        ParticipantStatus::InProgress => 1,
    }
}

/// Earlier last-answer wins; participants with no answers sort last.
fn last_answer_key(at: Option<DateTime<Utc>>) -> DateTime<Utc> {
    at.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnswerRecord, AttemptRecord, ScoreBreakdown};
    use chrono::Duration;

    fn participant(
        user_id: &str,
        score: i64,
        correct: u32,
        total: u32,
        status: ParticipantStatus,
    ) -> Participant {
        let now = Utc::now();
        let mut p = Participant::new(user_id, now);
        p.current_score = score;
        p.correct_answers = correct;
        p.total_answers = total;
        p.status = status;
        p
    }

    fn with_answer(mut p: Participant, question_id: &str, response_ms: u32, at: DateTime<Utc>) -> Participant {
        let mut record = AnswerRecord::new(question_id);
        record.response_time_ms = response_ms;
        record.attempts = 1;
        record.attempt_history.push(AttemptRecord {
            attempt_index: 1,
            answer_id: "a".into(),
            is_correct: true,
            response_time_ms: response_ms,
            points_earned: 0,
            scoring: ScoreBreakdown::zero(),
            timestamp: at,
        });
        p.answers.insert(question_id.to_string(), record);
        p
    }

    #[test]
    fn equal_scores_break_on_correct_answers() {
        // A: score 100, 5 correct of 6 answered. B: score 100, 6 correct of
        // ~6.7 answered (90% accuracy per the scenario) — B wins on the
        // correct_answers key before accuracy is even consulted.
        let ranker = LeaderboardRanker::new();
        let a = participant("user-a", 100, 5, 6, ParticipantStatus::InProgress);
        let b = participant("user-b", 100, 6, 7, ParticipantStatus::InProgress);

        let ranked = ranker.rank("quiz-1", [&a, &b]);
        assert_eq!(ranked[0].user_id, "user-b");
        assert_eq!(ranked[0].position, 1);
        assert_eq!(ranked[1].user_id, "user-a");
        assert_eq!(ranked[1].position, 2);
    }

    #[test]
    fn completed_ranks_above_in_progress_when_otherwise_tied() {
        let ranker = LeaderboardRanker::new();
        let a = participant("user-a", 200, 2, 2, ParticipantStatus::InProgress);
        let b = participant("user-b", 200, 2, 2, ParticipantStatus::Completed);

        let ranked = ranker.rank("quiz-1", [&a, &b]);
        assert_eq!(ranked[0].user_id, "user-b");
    }

    #[test]
    fn earlier_last_answer_wins_the_final_tie_break() {
        let now = Utc::now();
        let ranker = LeaderboardRanker::new();
        let a = with_answer(
            participant("user-a", 100, 1, 1, ParticipantStatus::InProgress),
            "q1",
            2000,
            now,
        );
        let b = with_answer(
            participant("user-b", 100, 1, 1, ParticipantStatus::InProgress),
            "q1",
            2000,
            now - Duration::seconds(5),
        );

        let ranked = ranker.rank("quiz-1", [&a, &b]);
        assert_eq!(ranked[0].user_id, "user-b");
    }

    #[test]
    fn repeated_ranking_is_deterministic() {
        let ranker = LeaderboardRanker::new();
        let a = participant("user-a", 50, 1, 2, ParticipantStatus::InProgress);
        let b = participant("user-b", 80, 2, 2, ParticipantStatus::InProgress);
        let c = participant("user-c", 80, 2, 2, ParticipantStatus::InProgress);

        let first: Vec<(String, u32)> = ranker
            .rank("quiz-1", [&a, &b, &c])
            .iter()
            .map(|e| (e.user_id.clone(), e.position))
            .collect();
        let second: Vec<(String, u32)> = ranker
            .rank("quiz-1", [&a, &b, &c])
            .iter()
            .map(|e| (e.user_id.clone(), e.position))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn movement_is_tracked_against_previous_positions() {
        let ranker = LeaderboardRanker::new();
        let a = participant("user-a", 100, 1, 1, ParticipantStatus::InProgress);
        let mut b = participant("user-b", 50, 1, 2, ParticipantStatus::InProgress);

        let first = ranker.rank("quiz-1", [&a, &b]);
        assert_eq!(first[0].previous_position, None);

        b.current_score = 150;
        let second = ranker.rank("quiz-1", [&a, &b]);
        assert_eq!(second[0].user_id, "user-b");
        assert_eq!(second[0].previous_position, Some(2));
        assert_eq!(second[1].user_id, "user-a");
        assert_eq!(second[1].previous_position, Some(1));
    }

    #[test]
    fn forget_quiz_clears_movement_cache() {
        let ranker = LeaderboardRanker::new();
        let a = participant("user-a", 100, 1, 1, ParticipantStatus::InProgress);
        ranker.rank("quiz-1", [&a]);
        ranker.forget_quiz("quiz-1");
        let again = ranker.rank("quiz-1", [&a]);
        assert_eq!(again[0].previous_position, None);
    }
}
