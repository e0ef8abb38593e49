// worker-service-rs/src/intake.rs
// Dead-letter intake: consume failed jobs the queue library has already
// moved to the DLQ and hand each one to a background pipeline run.
//
// The queue's retry/backoff/dead-letter mechanics are external; this
// module only gates entry. It never blocks on a pipeline run and never
// feeds anything back into the queue.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use tokio::sync::mpsc;

use config_rs::RedisConfig;
use repair_pipeline::{PipelineError, RepairPipeline, RunOutcome};
use shared_types_rs::FailureEvent;

/// Seconds one BRPOP blocks before the loop re-checks for shutdown.
const POP_TIMEOUT_SECS: usize = 5;

/// Terminal report of one background pipeline run, delivered to the
/// supervisor.
pub struct RunReport {
    pub job_id: String,
    pub job_name: String,
    pub outcome: Result<RunOutcome, PipelineError>,
}

/// Why an intake entry did not trigger a pipeline run.
#[derive(Debug, PartialEq, Eq)]
pub enum IntakeDecision {
    Trigger,
    /// The submitter did not opt into automated repair.
    RepairNotRequested,
    /// The job still has retry budget; the queue should not have parked
    /// it yet.
    RetriesRemaining,
}

/// Gate an event: the pipeline runs only for jobs that exhausted their
/// retry budget and opted into repair.
pub fn gate(event: &FailureEvent) -> IntakeDecision {
    let max_attempts = event.max_attempts.unwrap_or(1);
    if event.attempts_made < max_attempts {
        return IntakeDecision::RetriesRemaining;
    }
    if !event.repair_requested() {
        return IntakeDecision::RepairNotRequested;
    }
    IntakeDecision::Trigger
}

/// Consume serialized failure events from the dead-letter list and spawn
/// one pipeline run per event. Runs report into `reports`; redis errors
/// back off and retry rather than killing the worker.
pub async fn consume_dead_letters(
    cfg: RedisConfig,
    pipeline: Arc<RepairPipeline>,
    reports: mpsc::Sender<RunReport>,
) -> anyhow::Result<()> {
    let client = redis::Client::open(cfg.url())?;
    let mut conn = client.get_tokio_connection_manager().await?;

    tracing::info!(key = %cfg.dlq_key, "dead-letter intake started");

    loop {
        let popped: Option<(String, String)> = match conn.brpop(&cfg.dlq_key, POP_TIMEOUT_SECS as f64).await
        {
            Ok(popped) => popped,
            Err(err) => {
                tracing::error!(error = %err, "redis error in dead-letter intake");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some((_, payload)) = popped else {
            continue;
        };

        let event: FailureEvent = match serde_json::from_str(&payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = %err, "unparseable dead-letter payload, dropping");
                continue;
            }
        };

        match gate(&event) {
            IntakeDecision::Trigger => {}
            IntakeDecision::RepairNotRequested => {
                tracing::error!(job_id = %event.id, "job failed again, repair not requested");
                continue;
            }
            IntakeDecision::RetriesRemaining => {
                tracing::warn!(
                    job_id = %event.id,
                    attempts_made = event.attempts_made,
                    "dead-letter entry with retries remaining, skipping"
                );
                continue;
            }
        }

        tracing::info!(job_id = %event.id, job_name = %event.name, "starting repair pipeline run");

        let pipeline = pipeline.clone();
        let reports = reports.clone();
        tokio::spawn(async move {
            let outcome = pipeline.run(&event).await;
            let report = RunReport {
                job_id: event.id.clone(),
                job_name: event.name.clone(),
                outcome,
            };
            if reports.send(report).await.is_err() {
                tracing::warn!(job_id = %event.id, "supervisor channel closed, dropping report");
            }
        });
    }
}

/// Observe background runs and log terminal outcomes. Failures end here:
/// nothing is allowed to propagate back into the queue's retry machinery.
pub async fn supervise(mut reports: mpsc::Receiver<RunReport>) {
    while let Some(report) = reports.recv().await {
        match report.outcome {
            Ok(outcome) => {
                tracing::info!(
                    job_id = %report.job_id,
                    job_name = %report.job_name,
                    outcome = outcome.label(),
                    "pipeline run finished"
                );
            }
            Err(err) => {
                tracing::error!(
                    job_id = %report.job_id,
                    job_name = %report.job_name,
                    error = %err,
                    "pipeline run failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event(attempts_made: u32, max_attempts: u32, repair: bool) -> FailureEvent {
        FailureEvent {
            id: "5".to_string(),
            name: "login".to_string(),
            queue_name: "login".to_string(),
            data: serde_json::json!({ "reasoning_fix": repair }),
            stacktrace: vec![],
            failed_reason: None,
            attempts_made,
            max_attempts: Some(max_attempts),
            retry_delay_ms: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn exhausted_opted_in_jobs_trigger_the_pipeline() {
        assert_eq!(gate(&make_event(5, 5, true)), IntakeDecision::Trigger);
        assert_eq!(gate(&make_event(6, 5, true)), IntakeDecision::Trigger);
    }

    #[test]
    fn jobs_with_retry_budget_are_skipped() {
        assert_eq!(
            gate(&make_event(3, 5, true)),
            IntakeDecision::RetriesRemaining
        );
    }

    #[test]
    fn jobs_without_repair_opt_in_are_skipped() {
        assert_eq!(
            gate(&make_event(5, 5, false)),
            IntakeDecision::RepairNotRequested
        );
    }

    #[test]
    fn dead_letter_payloads_deserialize_to_failure_events() {
        let payload = serde_json::json!({
            "id": "42",
            "name": "login",
            "queue_name": "login",
            "data": { "num": 10, "reasoning_fix": true },
            "stacktrace": ["Error: Failed job 42\n    at run (/app/workers.ts:9:3)"],
            "failed_reason": "Failed job 42",
            "attempts_made": 5,
            "max_attempts": 5,
            "retry_delay_ms": 1000,
            "timestamp": "2024-01-15T10:30:00Z"
        });

        let event: FailureEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.id, "42");
        assert_eq!(gate(&event), IntakeDecision::Trigger);
    }
}
