use mongodb::Client as MongoClient;
use redis::aio::ConnectionManager;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::models::events::{AnswerResult, RoundTopFinisher};
use crate::models::{AcceptedAnswer, ParticipantStatus, SessionStatus};
use crate::stores::mongo_store::{MongoAttemptRepository, MongoCatalog};
use crate::stores::redis_store::{RedisEventBus, RedisLockManager, RedisSessionStore};
use crate::stores::{AttemptRepository, Catalog, EventBus, LockManager, SessionStore};
use crate::utils::clock::{Clock, SystemClock};

pub mod attempt_ledger;
pub mod broadcaster;
pub mod completion;
pub mod leaderboard;
pub mod scoring;
pub mod sync_coordinator;
pub mod validator;

use attempt_ledger::AttemptLedger;
use broadcaster::EventBroadcaster;
use leaderboard::LeaderboardRanker;
use scoring::{ScoringConfig, ScoringEngine};
use sync_coordinator::{SyncCoordinator, SyncOutcome, SyncSettings};
use validator::{DataValidator, Violation};

/// Front door of the engine. Owns the submission path end to end: ledger
/// write, event fan-out, leaderboard broadcast, and the reconciliation
/// kick-off when a participant finishes.
pub struct QuizEngine {
    sessions: Arc<dyn SessionStore>,
    ledger: AttemptLedger,
    ranker: Arc<LeaderboardRanker>,
    broadcaster: Arc<EventBroadcaster>,
    sync: Arc<SyncCoordinator>,
    validator: DataValidator,
}

impl QuizEngine {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        repository: Arc<dyn AttemptRepository>,
        catalog: Arc<dyn Catalog>,
        locks: Arc<dyn LockManager>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        scoring_config: ScoringConfig,
        sync_settings: SyncSettings,
    ) -> Self {
        let scoring = ScoringEngine::new(scoring_config);
        let broadcaster = Arc::new(EventBroadcaster::new(bus));
        let ledger = AttemptLedger::new(
            Arc::clone(&sessions),
            Arc::clone(&catalog),
            scoring.clone(),
            Arc::clone(&clock),
        );
        let sync = Arc::new(SyncCoordinator::new(
            Arc::clone(&sessions),
            Arc::clone(&repository),
            Arc::clone(&catalog),
            locks,
            Arc::clone(&broadcaster),
            scoring.clone(),
            Arc::clone(&clock),
            sync_settings,
        ));
        let validator = DataValidator::new(
            Arc::clone(&sessions),
            repository,
            catalog,
            scoring,
        );
        Self {
            sessions,
            ledger,
            ranker: Arc::new(LeaderboardRanker::new()),
            broadcaster,
            sync,
            validator,
        }
    }

    /// Connects the concrete Redis and Mongo backends and builds the engine
    /// on top of them.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let mongo_client = MongoClient::with_uri_str(&config.mongo_uri).await?;
        let mongo = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        let redis_client = redis::Client::open(config.redis_uri.clone())?;
        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        // Test connection
        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let sessions: Arc<dyn SessionStore> = Arc::new(RedisSessionStore::new(
            redis.clone(),
            config.session_ttl_secs,
        ));
        let repository: Arc<dyn AttemptRepository> =
            Arc::new(MongoAttemptRepository::new(mongo.clone()));
        let catalog: Arc<dyn Catalog> = Arc::new(MongoCatalog::new(mongo));
        let locks: Arc<dyn LockManager> = Arc::new(RedisLockManager::new(redis.clone()));
        let bus: Arc<dyn EventBus> = Arc::new(RedisEventBus::new(redis));

        Ok(Self::new(
            sessions,
            repository,
            catalog,
            locks,
            bus,
            Arc::new(SystemClock),
            ScoringConfig::default(),
            SyncSettings {
                lock_ttl_secs: config.sync_lock_ttl_secs,
                lock_renew_secs: config.sync_lock_renew_secs,
            },
        ))
    }

    pub async fn join_quiz(&self, quiz_id: &str, user_id: &str) -> EngineResult<()> {
        self.ledger.join_quiz(quiz_id, user_id).await
    }

    /// Full submission pipeline: validate and score the attempt, notify the
    /// submitter, push the fresh leaderboard, and when this attempt finished
    /// the participant, celebrate a first finisher and kick reconciliation
    /// off in the background.
    pub async fn submit_answer(
        &self,
        quiz_id: &str,
        user_id: &str,
        question_id: &str,
        answer_id: &str,
        response_time_ms: u32,
    ) -> EngineResult<AcceptedAnswer> {
        let accepted = self
            .ledger
            .submit_answer(quiz_id, user_id, question_id, answer_id, response_time_ms)
            .await?;

        self.broadcaster
            .answer_result(AnswerResult {
                quiz_id: quiz_id.to_string(),
                user_id: user_id.to_string(),
                question_id: question_id.to_string(),
                is_correct: accepted.is_correct,
                points_earned: accepted.points_earned,
                total_score: accepted.total_score,
                attempt_index: accepted.attempt_index,
            })
            .await;

        // Everything past the ledger write is observational. The attempt is
        // already committed, so a failing read here is logged and skipped
        // rather than failing the submission.
        match self.sessions.read_session(quiz_id).await {
            Ok(Some(session)) => {
                let ranked = self.ranker.rank(quiz_id, session.participants.values());
                self.broadcaster.leaderboard_update(quiz_id, &ranked).await;

                if accepted.completion_flipped {
                    let finishers = session
                        .participants
                        .values()
                        .filter(|p| p.status == ParticipantStatus::Completed)
                        .count();
                    if finishers == 1 {
                        if let Some(me) = session.participants.get(user_id) {
                            if let Some(completed_at) = me.completed_at {
                                self.broadcaster
                                    .round_top_finisher(RoundTopFinisher {
                                        quiz_id: quiz_id.to_string(),
                                        user_id: user_id.to_string(),
                                        score: me.current_score,
                                        completed_at,
                                    })
                                    .await;
                            }
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(
                    "Leaderboard read failed after accepted answer: quiz={}, user={}, error={:#}",
                    quiz_id,
                    user_id,
                    err
                );
            }
        }

        if accepted.completion_flipped {
            let sync = Arc::clone(&self.sync);
            let ranker = Arc::clone(&self.ranker);
            let quiz = quiz_id.to_string();
            tokio::spawn(async move {
                match sync.reconcile(&quiz).await {
                    Ok(SyncOutcome::Completed(report)) if report.session_deleted => {
                        ranker.forget_quiz(&quiz);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(
                            "Background reconciliation failed: quiz={}, error={:#}",
                            quiz,
                            err
                        );
                    }
                }
            });
        }

        Ok(accepted)
    }

    /// Host or timer ended the quiz for everyone. Marks the session finished
    /// so completion becomes authoritative for every participant, then
    /// reconciles immediately.
    pub async fn finish_quiz(&self, quiz_id: &str) -> EngineResult<SyncOutcome> {
        if self.sessions.session_meta(quiz_id).await?.is_none() {
            return Err(EngineError::SessionNotFound(quiz_id.to_string()));
        }
        self.sessions
            .set_session_status(quiz_id, SessionStatus::Finished)
            .await?;
        tracing::info!("Quiz finished by host: quiz={}", quiz_id);
        self.reconcile(quiz_id).await
    }

    /// Foreground reconciliation entry point, used by the periodic worker.
    pub async fn reconcile(&self, quiz_id: &str) -> EngineResult<SyncOutcome> {
        let outcome = self.sync.reconcile(quiz_id).await?;
        if let SyncOutcome::Completed(report) = &outcome {
            if report.session_deleted {
                self.ranker.forget_quiz(quiz_id);
            }
        }
        Ok(outcome)
    }

    pub async fn validate(
        &self,
        quiz_id: &str,
        user_id: Option<&str>,
    ) -> EngineResult<Vec<Violation>> {
        Ok(self.validator.validate_quiz(quiz_id, user_id).await?)
    }

    pub async fn active_quiz_ids(&self) -> EngineResult<Vec<String>> {
        Ok(self.sessions.active_quiz_ids().await?)
    }
}
