use std::sync::Arc;

use crate::metrics::EVENTS_PUBLISHED_TOTAL;
use crate::models::events::{
    AnswerResult, LeaderboardUpdate, QuizEvent, QuizFinished, RoundTopFinisher,
};
use crate::services::leaderboard::RankedParticipant;
use crate::stores::EventBus;

/// Outbound real-time notifications. Purely observational: every publish
/// error is swallowed and logged so broadcast trouble can never fail the
/// scoring or sync path that triggered it.
pub struct EventBroadcaster {
    bus: Arc<dyn EventBus>,
}

impl EventBroadcaster {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    /// Result of one attempt, addressed to the submitting user.
    pub async fn answer_result(&self, payload: AnswerResult) {
        let channel = format!("quiz:{}:user:{}", payload.quiz_id, payload.user_id);
        self.publish(&channel, QuizEvent::AnswerResult(payload)).await;
    }

    /// Fresh leaderboard snapshot to all quiz subscribers.
    pub async fn leaderboard_update(&self, quiz_id: &str, ranked: &[RankedParticipant]) {
        let channel = format!("quiz:{}:leaderboard", quiz_id);
        let payload = LeaderboardUpdate {
            quiz_id: quiz_id.to_string(),
            entries: ranked.iter().map(|entry| entry.as_event_entry()).collect(),
        };
        self.publish(&channel, QuizEvent::LeaderboardUpdate(payload))
            .await;
    }

    /// Racing-mode celebration for the first finisher of a quiz.
    pub async fn round_top_finisher(&self, payload: RoundTopFinisher) {
        let channel = format!("quiz:{}:events", payload.quiz_id);
        self.publish(&channel, QuizEvent::RoundTopFinisher(payload))
            .await;
    }

    /// Observer notification once a session has been reconciled away.
    pub async fn quiz_finished(&self, payload: QuizFinished) {
        let channel = format!("quiz:{}:events", payload.quiz_id);
        self.publish(&channel, QuizEvent::QuizFinished(payload)).await;
    }

    async fn publish(&self, channel: &str, event: QuizEvent) {
        let name = event.event_name();
        match self.bus.publish(channel, &event).await {
            Ok(()) => {
                EVENTS_PUBLISHED_TOTAL
                    .with_label_values(&[name, "ok"])
                    .inc();
            }
            Err(err) => {
                EVENTS_PUBLISHED_TOTAL
                    .with_label_values(&[name, "error"])
                    .inc();
                tracing::warn!(
                    "Event publish failed (ignored): channel={}, event={}, error={:#}",
                    channel,
                    name,
                    err
                );
            }
        }
    }
}
