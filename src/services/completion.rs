use chrono::{DateTime, Utc};

use crate::models::{Participant, ParticipantStatus, SessionStatus};

/// Authoritative completion decision. Client-reported or stale-store status
/// is never trusted: both the submission path and reconciliation recompute
/// this, and a divergence is logged rather than silently resolved.
pub struct CompletionDetector;

impl CompletionDetector {
    pub fn evaluate(
        total_questions: usize,
        participant: &Participant,
        session_status: SessionStatus,
        quiz_end_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ParticipantStatus {
        // Completed never reverts.
        if participant.status == ParticipantStatus::Completed {
            return ParticipantStatus::Completed;
        }
        if session_status == SessionStatus::Finished
            || now > quiz_end_time
            || participant.answers.len() >= total_questions
        {
            return ParticipantStatus::Completed;
        }
        ParticipantStatus::InProgress
    }

    /// Recompute and compare against a stored status, logging any
    /// correction. Returns the authoritative value.
    pub fn authoritative(
        quiz_id: &str,
        total_questions: usize,
        participant: &Participant,
        session_status: SessionStatus,
        quiz_end_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ParticipantStatus {
        let computed = Self::evaluate(
            total_questions,
            participant,
            session_status,
            quiz_end_time,
            now,
        );
        if computed != participant.status {
            tracing::warn!(
                "Participant status corrected: quiz={}, user={}, stored={}, computed={}",
                quiz_id,
                participant.user_id,
                participant.status.as_str(),
                computed.as_str()
            );
        }
        computed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn participant_with_answers(count: usize) -> Participant {
        let now = Utc::now();
        let mut participant = Participant::new("u1", now);
        for i in 0..count {
            let qid = format!("q{}", i);
            participant
                .answers
                .insert(qid.clone(), crate::models::AnswerRecord::new(&qid));
        }
        participant
    }

    #[test]
    fn finished_session_completes_everyone() {
        let now = Utc::now();
        let participant = participant_with_answers(0);
        let status = CompletionDetector::evaluate(
            5,
            &participant,
            SessionStatus::Finished,
            now + Duration::minutes(10),
            now,
        );
        assert_eq!(status, ParticipantStatus::Completed);
    }

    #[test]
    fn past_end_time_completes() {
        let now = Utc::now();
        let participant = participant_with_answers(1);
        let status = CompletionDetector::evaluate(
            5,
            &participant,
            SessionStatus::Active,
            now - Duration::seconds(1),
            now,
        );
        assert_eq!(status, ParticipantStatus::Completed);
    }

    #[test]
    fn all_questions_answered_completes() {
        let now = Utc::now();
        let participant = participant_with_answers(3);
        let status = CompletionDetector::evaluate(
            3,
            &participant,
            SessionStatus::Active,
            now + Duration::minutes(10),
            now,
        );
        assert_eq!(status, ParticipantStatus::Completed);
    }

    #[test]
    fn otherwise_in_progress() {
        let now = Utc::now();
        let participant = participant_with_answers(2);
        let status = CompletionDetector::evaluate(
            3,
            &participant,
            SessionStatus::Active,
            now + Duration::minutes(10),
            now,
        );
        assert_eq!(status, ParticipantStatus::InProgress);
    }

    #[test]
    fn completed_never_reverts() {
        let now = Utc::now();
        let mut participant = participant_with_answers(0);
        participant.status = ParticipantStatus::Completed;
        let status = CompletionDetector::evaluate(
            10,
            &participant,
            SessionStatus::Active,
            now + Duration::minutes(10),
            now,
        );
        assert_eq!(status, ParticipantStatus::Completed);
    }
}
