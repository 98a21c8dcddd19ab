mod common;

use chrono::Duration;
use common::harness;
use livequiz_engine::models::{Difficulty, ParticipantStatus};
use livequiz_engine::services::sync_coordinator::SyncOutcome;
use livequiz_engine::stores::{AttemptRepository, LockManager, SessionStore};

#[tokio::test]
async fn reconciliation_persists_the_worked_example() {
    let h = harness();
    h.seed_quiz(
        "quiz-1",
        &[
            ("q1", Difficulty::Medium, Some("algebra")),
            ("q2", Difficulty::Medium, Some("algebra")),
        ],
    );

    h.answer_right("quiz-1", "user-a", "q1", 3000).await.unwrap();
    h.answer_wrong("quiz-1", "user-a", "q2", 2000).await.unwrap();
    h.answer_right("quiz-1", "user-a", "q2", 4000).await.unwrap();

    let outcome = h.engine.reconcile("quiz-1").await.unwrap();
    let report = match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Locked => panic!("lease unexpectedly held"),
    };
    assert_eq!(report.participants_processed, 1);
    assert_eq!(report.attempts_written, 3);
    assert_eq!(report.errors, 0);
    assert!(report.session_deleted);

    // One row per attempt, including the failed first try on q2.
    let rows = h.repository.all_attempts();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| !row.unanswered));

    let result = h
        .repository
        .result_for("quiz-1", "user-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.raw_total_points, 285);
    assert_eq!(result.max_points, 380);
    assert!((result.score - 7.5).abs() < 1e-9);
    assert_eq!(result.status, ParticipantStatus::Completed);
    assert!(result.completion_time.is_some());

    let topics = h.repository.all_topic_rows();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].topic_id, "algebra");
    assert_eq!(topics[0].attempts_total, 3);
    assert_eq!(topics[0].correct_count, 2);
    assert_eq!(topics[0].points_total, 285);
    assert!((topics[0].percentage - 100.0).abs() < 1e-9);

    // The ephemeral tree is gone and observers were told.
    assert!(h.sessions.read_session("quiz-1").await.unwrap().is_none());
    assert_eq!(h.bus.count_named("quiz-finished"), 1);
}

#[tokio::test]
async fn in_progress_participants_keep_the_session_alive() {
    let h = harness();
    h.seed_quiz(
        "quiz-1",
        &[
            ("q1", Difficulty::Easy, None),
            ("q2", Difficulty::Easy, None),
            ("q3", Difficulty::Easy, None),
        ],
    );

    h.answer_right("quiz-1", "user-a", "q1", 1000).await.unwrap();
    h.answer_right("quiz-1", "user-a", "q2", 1000).await.unwrap();

    let outcome = h.engine.reconcile("quiz-1").await.unwrap();
    let report = match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Locked => panic!("lease unexpectedly held"),
    };
    assert_eq!(report.attempts_written, 2);
    assert!(!report.session_deleted);

    // Progress was persisted without tearing anything down.
    assert_eq!(h.repository.all_attempts().len(), 2);
    assert!(h.sessions.read_session("quiz-1").await.unwrap().is_some());
    assert_eq!(h.bus.count_named("quiz-finished"), 0);

    let result = h
        .repository
        .result_for("quiz-1", "user-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, ParticipantStatus::InProgress);
    assert!(result.completion_time.is_none());
}

#[tokio::test]
async fn rerunning_reconciliation_is_idempotent() {
    let h = harness();
    h.seed_quiz(
        "quiz-1",
        &[
            ("q1", Difficulty::Medium, None),
            ("q2", Difficulty::Medium, None),
            ("q3", Difficulty::Medium, None),
        ],
    );

    h.answer_right("quiz-1", "user-a", "q1", 3000).await.unwrap();
    h.answer_wrong("quiz-1", "user-a", "q2", 2000).await.unwrap();
    h.answer_right("quiz-1", "user-a", "q2", 4000).await.unwrap();

    h.engine.reconcile("quiz-1").await.unwrap();
    let first_rows = h.repository.all_attempts();
    let first_result = h
        .repository
        .result_for("quiz-1", "user-a")
        .await
        .unwrap()
        .unwrap();

    h.engine.reconcile("quiz-1").await.unwrap();
    let second_rows = h.repository.all_attempts();
    let second_result = h
        .repository
        .result_for("quiz-1", "user-a")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first_rows.len(), second_rows.len());
    assert_eq!(first_result.raw_total_points, second_result.raw_total_points);
    assert_eq!(first_result.max_points, second_result.max_points);
    assert!((first_result.score - second_result.score).abs() < 1e-9);
}

#[tokio::test]
async fn expired_quiz_completes_participants_and_synthesizes_unanswered_rows() {
    let h = harness();
    h.seed_quiz(
        "quiz-1",
        &[
            ("q1", Difficulty::Medium, Some("algebra")),
            ("q2", Difficulty::Medium, Some("geometry")),
            ("q3", Difficulty::Medium, Some("geometry")),
        ],
    );

    h.answer_right("quiz-1", "user-a", "q1", 3000).await.unwrap();
    h.tick(Duration::hours(2));

    let outcome = h.engine.reconcile("quiz-1").await.unwrap();
    let report = match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Locked => panic!("lease unexpectedly held"),
    };
    assert!(report.session_deleted);

    let rows = h.repository.all_attempts();
    assert_eq!(rows.len(), 3);
    let synthetic: Vec<_> = rows.iter().filter(|row| row.unanswered).collect();
    assert_eq!(synthetic.len(), 2);
    assert!(synthetic
        .iter()
        .all(|row| row.points_earned == 0 && !row.is_correct && row.selected_answer.is_none()));

    // Unanswered questions drag the normalized score down: 190 of 570.
    let result = h
        .repository
        .result_for("quiz-1", "user-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, ParticipantStatus::Completed);
    assert_eq!(result.raw_total_points, 190);
    assert_eq!(result.max_points, 570);
    assert!((result.score - 190.0 / 570.0 * 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn a_held_lease_skips_the_run_without_writing() {
    let h = harness();
    h.seed_quiz("quiz-1", &[("q1", Difficulty::Easy, None)]);
    h.engine.join_quiz("quiz-1", "user-a").await.unwrap();

    let token = h
        .locks
        .acquire("synclock:quiz-1", 120)
        .await
        .unwrap()
        .unwrap();

    let outcome = h.engine.reconcile("quiz-1").await.unwrap();
    assert_eq!(outcome, SyncOutcome::Locked);
    assert!(h.repository.all_attempts().is_empty());

    // Once the holder lets go the next run proceeds.
    h.locks.release("synclock:quiz-1", &token).await.unwrap();
    let outcome = h.engine.reconcile("quiz-1").await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed(_)));
}

#[tokio::test]
async fn an_expired_lease_no_longer_blocks() {
    let h = harness();
    h.seed_quiz("quiz-1", &[("q1", Difficulty::Easy, None)]);
    h.engine.join_quiz("quiz-1", "user-a").await.unwrap();

    h.locks.acquire("synclock:quiz-1", 60).await.unwrap().unwrap();
    h.tick(Duration::seconds(61));

    let outcome = h.engine.reconcile("quiz-1").await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed(_)));
}

#[tokio::test]
async fn one_failing_participant_does_not_block_the_others() {
    let h = harness();
    h.seed_quiz("quiz-1", &[("q1", Difficulty::Easy, None)]);

    h.answer_right("quiz-1", "user-a", "q1", 1000).await.unwrap();
    h.answer_right("quiz-1", "user-b", "q1", 1500).await.unwrap();

    h.repository.fail_for_user("user-b");
    let outcome = h.engine.reconcile("quiz-1").await.unwrap();
    let report = match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Locked => panic!("lease unexpectedly held"),
    };
    assert_eq!(report.participants_processed, 1);
    assert_eq!(report.errors, 1);
    assert!(!report.session_deleted);

    // The healthy participant landed, the failing one did not.
    assert!(h
        .repository
        .result_for("quiz-1", "user-a")
        .await
        .unwrap()
        .is_some());
    assert!(h
        .repository
        .result_for("quiz-1", "user-b")
        .await
        .unwrap()
        .is_none());
    assert!(h.sessions.read_session("quiz-1").await.unwrap().is_some());

    // The retained session lets a later run finish the job.
    h.repository.clear_failures();
    let outcome = h.engine.reconcile("quiz-1").await.unwrap();
    let report = match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Locked => panic!("lease unexpectedly held"),
    };
    assert_eq!(report.errors, 0);
    assert!(report.session_deleted);
    assert!(h
        .repository
        .result_for("quiz-1", "user-b")
        .await
        .unwrap()
        .is_some());
    assert_eq!(h.bus.count_named("quiz-finished"), 1);
}

#[tokio::test]
async fn finishing_a_quiz_completes_everyone_and_tears_down() {
    let h = harness();
    h.seed_quiz(
        "quiz-1",
        &[("q1", Difficulty::Easy, None), ("q2", Difficulty::Easy, None)],
    );

    h.answer_right("quiz-1", "user-a", "q1", 1000).await.unwrap();
    h.engine.join_quiz("quiz-1", "user-b").await.unwrap();

    let outcome = h.engine.finish_quiz("quiz-1").await.unwrap();
    let report = match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Locked => panic!("lease unexpectedly held"),
    };
    assert_eq!(report.participants_processed, 2);
    assert!(report.session_deleted);

    // Both results are completed, including the participant who never
    // answered anything.
    for user in ["user-a", "user-b"] {
        let result = h
            .repository
            .result_for("quiz-1", user)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, ParticipantStatus::Completed);
    }

    let err = h.engine.finish_quiz("quiz-1").await.unwrap_err();
    assert!(matches!(
        err,
        livequiz_engine::EngineError::SessionNotFound(_)
    ));
}

#[tokio::test]
async fn reconciling_a_missing_session_is_a_clean_no_op() {
    let h = harness();
    h.seed_quiz("quiz-1", &[("q1", Difficulty::Easy, None)]);

    let outcome = h.engine.reconcile("quiz-1").await.unwrap();
    let report = match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Locked => panic!("lease unexpectedly held"),
    };
    assert_eq!(report.participants_processed, 0);
    assert!(!report.session_deleted);
}

#[tokio::test]
async fn active_quiz_ids_lists_live_sessions_for_the_sweep() {
    let h = harness();
    h.seed_quiz("quiz-1", &[("q1", Difficulty::Easy, None)]);
    h.seed_quiz("quiz-2", &[("q9", Difficulty::Easy, None)]);

    h.engine.join_quiz("quiz-1", "user-a").await.unwrap();
    h.engine.join_quiz("quiz-2", "user-a").await.unwrap();

    assert_eq!(
        h.engine.active_quiz_ids().await.unwrap(),
        vec!["quiz-1".to_string(), "quiz-2".to_string()]
    );

    h.answer_right("quiz-1", "user-a", "q1", 1000).await.unwrap();
    h.engine.reconcile("quiz-1").await.unwrap();
    assert_eq!(
        h.engine.active_quiz_ids().await.unwrap(),
        vec!["quiz-2".to_string()]
    );
}
