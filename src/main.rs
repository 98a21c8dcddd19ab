use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livequiz_engine::services::sync_coordinator::SyncOutcome;
use livequiz_engine::{Config, QuizEngine};

/// Periodic reconciliation sweep. The submission path kicks off a sync the
/// moment a participant finishes; this worker is the safety net that picks
/// up sessions those spawns missed, e.g. after a crash or an expired quiz
/// nobody touched again.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livequiz_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting livequiz sync worker");

    let config = Config::load().expect("Failed to load configuration");
    let interval = Duration::from_secs(config.sync_interval_secs);

    let engine = QuizEngine::connect(config).await?;

    loop {
        match engine.active_quiz_ids().await {
            Ok(quiz_ids) => {
                tracing::info!("Sweep starting: sessions={}", quiz_ids.len());
                for quiz_id in quiz_ids {
                    match engine.reconcile(&quiz_id).await {
                        Ok(SyncOutcome::Locked) => {
                            tracing::debug!("Sweep skipped locked session: quiz={}", quiz_id);
                        }
                        Ok(SyncOutcome::Completed(report)) => {
                            tracing::info!(
                                "Sweep reconciled: quiz={}, participants={}, rows={}, errors={}",
                                quiz_id,
                                report.participants_processed,
                                report.attempts_written,
                                report.errors
                            );
                        }
                        Err(err) => {
                            tracing::error!(
                                "Sweep reconciliation failed: quiz={}, error={:#}",
                                quiz_id,
                                err
                            );
                        }
                    }
                }
            }
            Err(err) => {
                tracing::error!("Failed to list active sessions: error={:#}", err);
            }
        }

        tokio::time::sleep(interval).await;
    }
}
