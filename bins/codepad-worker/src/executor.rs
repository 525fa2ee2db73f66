/// Job Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Coordinate the sandbox engine and the outcome classifier to produce the
/// job's terminal value.
///
/// **Architecture:**
/// 1. Use DockerEngine to compile and run inside sandboxes (engine.rs)
/// 2. Use the classifier to map raw signals to the status taxonomy (classifier.rs)
/// 3. Return the ExecutionOutcome
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (engine's job)
/// - How outcomes are classified (classifier's job)
/// - How results reach the broker (worker loop's job)

use crate::classifier::{self, RawExecution};
use crate::engine::DockerEngine;
use codepad_common::types::{ExecutionOutcome, Job};
use anyhow::Result;
use tracing::{info, warn};

/// Execute one job end to end.
///
/// Program failures come back as `Ok` with the matching status; `Err` is
/// reserved for infrastructure faults and fails the job.
pub async fn execute(engine: &DockerEngine, job: &Job, output_cap: usize) -> Result<ExecutionOutcome> {
    let raw = engine.execute(job.id, &job.code, &job.stdin).await?;

    match &raw {
        RawExecution::CompileFailed { compile, .. } => {
            if compile.timed_out {
                warn!(job_id = %job.id, "Compilation hit the wall-clock limit");
            }
        }
        RawExecution::Ran { run } => {
            if run.timed_out {
                warn!(
                    job_id = %job.id,
                    execution_ms = run.elapsed.as_millis() as u64,
                    "Execution timed out"
                );
            } else if run.exit_code != Some(0) {
                warn!(
                    job_id = %job.id,
                    exit_code = ?run.exit_code,
                    hint = classifier::exit_hint(run.exit_code).unwrap_or("-"),
                    "Program exited abnormally"
                );
            }
        }
    }

    let outcome = classifier::classify(&raw, output_cap);

    info!(
        job_id = %job.id,
        status = %outcome.status,
        status_id = outcome.status.id(),
        time = outcome.time.as_deref().unwrap_or("-"),
        memory_kb = outcome.memory.unwrap_or(0),
        stdout_bytes = outcome.stdout.len(),
        "Job classified"
    );

    Ok(outcome)
}
