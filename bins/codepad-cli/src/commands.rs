// CLI commands talking to the Codepad broker directly
use anyhow::{bail, Context, Result};
use codepad_common::config::BrokerConfig;
use codepad_common::connection;
use codepad_common::queue;
use codepad_common::types::{JobState, JobView};
use redis::aio::ConnectionManager;
use std::fs;
use std::time::Duration;
use uuid::Uuid;

use crate::SourceArgs;

async fn connect() -> Result<ConnectionManager> {
    let config = BrokerConfig::from_env().context("Invalid broker configuration")?;
    connection::shared(&config)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))
}

/// Read the source file and the optional stdin into memory
fn load_submission(source: &SourceArgs) -> Result<(String, String)> {
    let code = fs::read_to_string(&source.file)
        .with_context(|| format!("Failed to read {}", source.file.display()))?;

    let stdin = match (&source.stdin_file, &source.stdin) {
        (Some(path), _) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, Some(text)) => text.clone(),
        (None, None) => String::new(),
    };

    queue::validate_submission(&code, &stdin)?;
    Ok((code, stdin))
}

/// Enqueue a program and print its job id
pub async fn submit(source: &SourceArgs) -> Result<Uuid> {
    let (code, stdin) = load_submission(source)?;
    let mut conn = connect().await?;

    let job_id = queue::submit(&mut conn, &code, &stdin).await?;
    println!("📨 Submitted {} ({} bytes)", job_id, code.len());
    println!("{}", job_id);
    Ok(job_id)
}

/// Print the current view of a job
pub async fn status(job_id: &Uuid) -> Result<()> {
    let mut conn = connect().await?;
    let view = queue::poll(&mut conn, job_id).await?;
    print_view(&view)?;
    Ok(())
}

/// Submit, then poll until the job is terminal or the attempts run out.
///
/// Giving up only stops waiting; the job stays queued or running and can
/// still be looked up with `status`.
pub async fn run(source: &SourceArgs, interval_ms: u64, max_attempts: u32) -> Result<()> {
    if max_attempts == 0 {
        bail!("--max-attempts must be at least 1");
    }

    let job_id = submit(source).await?;
    let mut conn = connect().await?;
    let interval = Duration::from_millis(interval_ms);

    for attempt in 1..=max_attempts {
        tokio::time::sleep(interval).await;

        let view = queue::poll(&mut conn, &job_id).await?;
        if view.state.is_terminal() {
            print_view(&view)?;
            return match view.state {
                JobState::Failed => bail!("Job {} failed", job_id),
                _ => Ok(()),
            };
        }

        println!("⏳ [{}/{}] {}", attempt, max_attempts, view.state);
    }

    bail!(
        "Job {} still pending after {} polls; check later with `codepad-cli status {}`",
        job_id,
        max_attempts,
        job_id
    )
}

/// Print the number of jobs waiting in the queue
pub async fn queue_depth() -> Result<()> {
    let mut conn = connect().await?;
    let depth = queue::queue_depth(&mut conn).await?;
    println!("📊 {} job(s) queued", depth);
    Ok(())
}

fn print_view(view: &JobView) -> Result<()> {
    println!("{}", summarize(view));
    println!("{}", serde_json::to_string_pretty(view)?);
    Ok(())
}

fn summarize(view: &JobView) -> String {
    match (&view.state, &view.result, &view.error) {
        (JobState::Completed, Some(outcome), _) => format!(
            "✅ {} {} (time: {}s, memory: {} KB)",
            view.job_id,
            outcome.status,
            outcome.time.as_deref().unwrap_or("-"),
            outcome
                .memory
                .map(|kb| kb.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ),
        (JobState::Failed, _, error) => format!(
            "❌ {} failed: {}",
            view.job_id,
            error.as_deref().unwrap_or("unknown error")
        ),
        (state, _, _) => format!("⏳ {} is {}", view.job_id, state),
    }
}
