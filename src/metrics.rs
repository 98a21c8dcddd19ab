use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    // Submission path
    pub static ref ANSWERS_SUBMITTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_answers_submitted_total",
        "Accepted answer submissions",
        &["correct"]
    )
    .unwrap();

    pub static ref ATTEMPTS_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_attempts_rejected_total",
        "Rejected answer submissions",
        &["reason"]
    )
    .unwrap();

    pub static ref CAS_CONFLICTS_TOTAL: IntCounter = register_int_counter!(
        "quiz_participant_cas_conflicts_total",
        "Participant updates retried after a compare-and-swap conflict"
    )
    .unwrap();

    // Sessions
    pub static ref SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        "quiz_sessions_active",
        "Ephemeral quiz sessions currently held"
    )
    .unwrap();

    // Reconciliation
    pub static ref SYNC_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_sync_runs_total",
        "Reconciliation runs by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref SYNC_ROWS_WRITTEN_TOTAL: IntCounter = register_int_counter!(
        "quiz_sync_attempt_rows_written_total",
        "Durable attempt rows upserted by reconciliation"
    )
    .unwrap();

    pub static ref SYNC_LOCK_CONTENTION_TOTAL: IntCounter = register_int_counter!(
        "quiz_sync_lock_contention_total",
        "Reconciliation runs skipped because the lease was held elsewhere"
    )
    .unwrap();

    pub static ref SYNC_DURATION_SECONDS: Histogram = register_histogram!(
        "quiz_sync_duration_seconds",
        "Wall time of a reconciliation run",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    // Outbound events
    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_events_published_total",
        "Outbound events by name and publish status",
        &["event", "status"]
    )
    .unwrap();
}

pub fn record_rejection(reason: &str) {
    ATTEMPTS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_submission(correct: bool) {
    let label = if correct { "true" } else { "false" };
    ANSWERS_SUBMITTED_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_sync_run(outcome: &str) {
    SYNC_RUNS_TOTAL.with_label_values(&[outcome]).inc();
}
