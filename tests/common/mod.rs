#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use livequiz_engine::error::EngineResult;
use livequiz_engine::models::{AcceptedAnswer, Difficulty, QuestionInfo, QuizInfo};
use livequiz_engine::services::scoring::ScoringConfig;
use livequiz_engine::services::sync_coordinator::SyncSettings;
use livequiz_engine::stores::memory::{
    ManualClock, MemoryAttemptRepository, MemoryCatalog, MemoryEventBus, MemoryLockManager,
    MemorySessionStore,
};
use livequiz_engine::QuizEngine;

/// Engine wired onto the in-memory backends, with handles kept so tests can
/// seed state, inject failures, and inspect what was written or published.
pub struct Harness {
    pub engine: QuizEngine,
    pub sessions: Arc<MemorySessionStore>,
    pub repository: Arc<MemoryAttemptRepository>,
    pub catalog: Arc<MemoryCatalog>,
    pub locks: Arc<MemoryLockManager>,
    pub bus: Arc<MemoryEventBus>,
    pub clock: Arc<ManualClock>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn harness() -> Harness {
    let clock = Arc::new(ManualClock::starting_at(start_time()));
    let sessions = Arc::new(MemorySessionStore::new());
    let repository = Arc::new(MemoryAttemptRepository::new());
    let catalog = Arc::new(MemoryCatalog::new());
    let locks = Arc::new(MemoryLockManager::new(clock.clone()));
    let bus = Arc::new(MemoryEventBus::new());

    let engine = QuizEngine::new(
        sessions.clone(),
        repository.clone(),
        catalog.clone(),
        locks.clone(),
        bus.clone(),
        clock.clone(),
        ScoringConfig::default(),
        SyncSettings::default(),
    );

    Harness {
        engine,
        sessions,
        repository,
        catalog,
        locks,
        bus,
        clock,
    }
}

impl Harness {
    /// Seed a quiz ending one hour after the harness start time. The correct
    /// answer id of each question is `{question_id}-right`.
    pub fn seed_quiz(&self, quiz_id: &str, questions: &[(&str, Difficulty, Option<&str>)]) {
        for (question_id, difficulty, topic) in questions {
            self.catalog.insert_question(QuestionInfo {
                question_id: question_id.to_string(),
                difficulty: *difficulty,
                correct_answer_id: format!("{}-right", question_id),
                topic_id: topic.map(|t| t.to_string()),
            });
        }
        self.catalog.insert_quiz(QuizInfo {
            quiz_id: quiz_id.to_string(),
            question_ids: questions.iter().map(|(q, _, _)| q.to_string()).collect(),
            end_time: start_time() + Duration::hours(1),
        });
    }

    pub async fn answer_right(
        &self,
        quiz_id: &str,
        user_id: &str,
        question_id: &str,
        response_time_ms: u32,
    ) -> EngineResult<AcceptedAnswer> {
        let answer = format!("{}-right", question_id);
        self.engine
            .submit_answer(quiz_id, user_id, question_id, &answer, response_time_ms)
            .await
    }

    pub async fn answer_wrong(
        &self,
        quiz_id: &str,
        user_id: &str,
        question_id: &str,
        response_time_ms: u32,
    ) -> EngineResult<AcceptedAnswer> {
        self.engine
            .submit_answer(quiz_id, user_id, question_id, "wrong", response_time_ms)
            .await
    }

    pub fn tick(&self, delta: Duration) {
        self.clock.advance(delta);
    }
}
