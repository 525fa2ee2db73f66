/// Redis job-store semantics shared by the API, the worker and the CLI.
///
/// Keeps every key in one place so submitters and workers never drift.
/// A job id lives in exactly one of `QUEUE_KEY` (state `queued`) or
/// `PROCESSING_KEY` (state `active`) until it turns terminal; the scripts
/// below move it between the two and flip the state in the same step.
/// The scripts address job keys by prefix, so the broker must be a single
/// (non-cluster) Redis instance.

use crate::error::{BrokerError, BrokerResult};
use crate::types::{ExecutionOutcome, Job, JobState, JobView};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const QUEUE_KEY: &str = "codepad:queue";
pub const PROCESSING_KEY: &str = "codepad:processing";
pub const JOB_PREFIX: &str = "codepad:job:";
pub const LEASE_PREFIX: &str = "codepad:lease:";

pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Generate the hash key holding a job
pub fn job_key(job_id: &Uuid) -> String {
    format!("{}{}", JOB_PREFIX, job_id)
}

/// Generate the claim-lease key for a job
pub fn lease_key(job_id: &Uuid) -> String {
    format!("{}{}", LEASE_PREFIX, job_id)
}

/// A job claimed by one worker slot. `token` identifies this particular claim
/// and must be presented again when reporting the terminal state.
#[derive(Debug, Clone)]
pub struct Claim {
    pub job: Job,
    pub token: String,
}

const CLAIM_SCRIPT: &str = r#"
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
  local job = ARGV[1] .. id
  if redis.call('HGET', job, 'state') == 'queued' then
    redis.call('RPUSH', KEYS[2], id)
    redis.call('HSET', job, 'state', 'active', 'started_at', ARGV[3], 'worker', ARGV[4])
    redis.call('HINCRBY', job, 'attempts', 1)
    redis.call('SET', ARGV[2] .. id, ARGV[4], 'EX', ARGV[5])
    return id
  end
end
"#;

const FINISH_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then
  return 0
end
if redis.call('HGET', KEYS[1], 'worker') ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[3], ARGV[4], ARGV[5], 'finished_at', ARGV[6])
redis.call('EXPIRE', KEYS[1], ARGV[7])
redis.call('DEL', KEYS[2])
redis.call('LREM', KEYS[3], 0, ARGV[1])
return 1
"#;

const REQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', ARGV[2] .. ARGV[3]) == 1 then
  return 0
end
local job = ARGV[1] .. ARGV[3]
local state = redis.call('HGET', job, 'state')
redis.call('LREM', KEYS[1], 0, ARGV[3])
if state == 'active' then
  redis.call('HSET', job, 'state', 'queued', 'worker', '')
  redis.call('RPUSH', KEYS[2], ARGV[3])
  return 1
end
return 0
"#;

/// Reject submissions the sandbox should never see.
pub fn validate_submission(code: &str, stdin: &str) -> BrokerResult<()> {
    if code.is_empty() {
        return Err(BrokerError::InvalidArgument("code must be a non-empty string".to_string()));
    }
    if code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(BrokerError::InvalidArgument(format!(
            "code exceeds maximum size of {} bytes",
            MAX_SOURCE_CODE_BYTES
        )));
    }
    if stdin.len() > MAX_STDIN_BYTES {
        return Err(BrokerError::InvalidArgument(format!(
            "stdin exceeds maximum size of {} bytes",
            MAX_STDIN_BYTES
        )));
    }
    Ok(())
}

/// Enqueue a new job and return its id without waiting for execution.
///
/// The job hash and the queue entry are written in one MULTI/EXEC so a
/// worker can never pop an id whose hash does not exist yet.
pub async fn submit(conn: &mut ConnectionManager, code: &str, stdin: &str) -> BrokerResult<Uuid> {
    validate_submission(code, stdin)?;

    let job_id = Uuid::new_v4();
    let key = job_key(&job_id);
    let now = Utc::now().timestamp_millis();

    let _: () = redis::pipe()
        .atomic()
        .cmd("HSET")
        .arg(&key)
        .arg("id")
        .arg(job_id.to_string())
        .arg("code")
        .arg(code)
        .arg("stdin")
        .arg(stdin)
        .arg("state")
        .arg(JobState::Queued.as_str())
        .arg("enqueued_at")
        .arg(now)
        .arg("attempts")
        .arg(0)
        .ignore()
        .cmd("RPUSH")
        .arg(QUEUE_KEY)
        .arg(job_id.to_string())
        .ignore()
        .query_async(conn)
        .await?;

    debug!(job_id = %job_id, code_bytes = code.len(), stdin_bytes = stdin.len(), "Job enqueued");
    Ok(job_id)
}

/// Claim the oldest queued job, if any, without blocking.
///
/// Moves the id to the processing list, flips it to `active` and takes a
/// lease that expires after `lease`. Stale ids (evicted or already terminal)
/// are skipped.
pub async fn claim_next(
    conn: &mut ConnectionManager,
    worker: &str,
    lease: Duration,
) -> BrokerResult<Option<Claim>> {
    let token = format!("{}/{}", worker, Uuid::new_v4());
    let now = Utc::now().timestamp_millis();
    let lease_secs = lease.as_secs().max(1);

    let claimed: Option<String> = Script::new(CLAIM_SCRIPT)
        .key(QUEUE_KEY)
        .key(PROCESSING_KEY)
        .arg(JOB_PREFIX)
        .arg(LEASE_PREFIX)
        .arg(now)
        .arg(&token)
        .arg(lease_secs)
        .invoke_async(conn)
        .await?;

    let Some(raw_id) = claimed else {
        return Ok(None);
    };

    let job_id = Uuid::parse_str(&raw_id).map_err(|e| BrokerError::Corrupt {
        job_id: raw_id.clone(),
        reason: e.to_string(),
    })?;
    let fields: HashMap<String, String> = conn.hgetall(job_key(&job_id)).await?;
    let job = Job::from_fields(&fields).map_err(|reason| BrokerError::Corrupt {
        job_id: raw_id,
        reason,
    })?;

    Ok(Some(Claim { job, token }))
}

/// Attach the outcome to an active job and mark it `completed`.
///
/// Returns `false` when the job was no longer held by this claim, in which
/// case nothing is written.
pub async fn complete(
    conn: &mut ConnectionManager,
    claim: &Claim,
    outcome: &ExecutionOutcome,
    retention_secs: u64,
) -> BrokerResult<bool> {
    let payload = serde_json::to_string(outcome)?;
    finish(conn, claim, JobState::Completed, "result", &payload, retention_secs).await
}

/// Mark an active job `failed` with a diagnostic reason.
pub async fn fail(
    conn: &mut ConnectionManager,
    claim: &Claim,
    reason: &str,
    retention_secs: u64,
) -> BrokerResult<bool> {
    finish(conn, claim, JobState::Failed, "error", reason, retention_secs).await
}

async fn finish(
    conn: &mut ConnectionManager,
    claim: &Claim,
    state: JobState,
    field: &str,
    payload: &str,
    retention_secs: u64,
) -> BrokerResult<bool> {
    let job_id = claim.job.id;
    let applied: i64 = Script::new(FINISH_SCRIPT)
        .key(job_key(&job_id))
        .key(lease_key(&job_id))
        .key(PROCESSING_KEY)
        .arg(job_id.to_string())
        .arg(&claim.token)
        .arg(state.as_str())
        .arg(field)
        .arg(payload)
        .arg(Utc::now().timestamp_millis())
        .arg(retention_secs.max(1))
        .invoke_async(conn)
        .await?;

    if applied == 0 {
        warn!(job_id = %job_id, state = %state, "Terminal state not applied; claim no longer held");
    }
    Ok(applied == 1)
}

/// Point-in-time lookup for polling clients. Never mutates anything.
pub async fn poll(conn: &mut ConnectionManager, job_id: &Uuid) -> BrokerResult<JobView> {
    let fields: HashMap<String, String> = conn.hgetall(job_key(job_id)).await?;
    view_from_fields(job_id, &fields)
}

/// Build the polling view from a raw job hash.
pub fn view_from_fields(job_id: &Uuid, fields: &HashMap<String, String>) -> BrokerResult<JobView> {
    if fields.is_empty() {
        return Err(BrokerError::NotFound(job_id.to_string()));
    }

    let corrupt = |reason: String| BrokerError::Corrupt {
        job_id: job_id.to_string(),
        reason,
    };

    let state = fields
        .get("state")
        .ok_or_else(|| corrupt("missing state".to_string()))?
        .parse::<JobState>()
        .map_err(corrupt)?;

    let result = match state {
        JobState::Completed => {
            let raw = fields
                .get("result")
                .ok_or_else(|| corrupt("completed job has no result".to_string()))?;
            Some(serde_json::from_str::<ExecutionOutcome>(raw)?)
        }
        _ => None,
    };

    let error = match state {
        JobState::Failed => Some(fields.get("error").cloned().unwrap_or_default()),
        _ => None,
    };

    Ok(JobView {
        job_id: *job_id,
        state,
        result,
        error,
    })
}

/// Return jobs whose claim lease expired back to the queue.
///
/// This is the at-least-once half of the contract: a worker that died
/// mid-execution leaves an `active` job without a lease, which is reset to
/// `queued` and redelivered. Returns the number of jobs requeued.
pub async fn requeue_stalled(conn: &mut ConnectionManager) -> BrokerResult<usize> {
    let in_flight: Vec<String> = conn.lrange(PROCESSING_KEY, 0, -1).await?;
    let mut requeued = 0;

    for id in in_flight {
        let moved: i64 = Script::new(REQUEUE_SCRIPT)
            .key(PROCESSING_KEY)
            .key(QUEUE_KEY)
            .arg(JOB_PREFIX)
            .arg(LEASE_PREFIX)
            .arg(&id)
            .invoke_async(conn)
            .await?;

        if moved == 1 {
            warn!(job_id = %id, "Requeued stalled job after lease expiry");
            requeued += 1;
        }
    }

    Ok(requeued)
}

/// Number of jobs waiting to be claimed
pub async fn queue_depth(conn: &mut ConnectionManager) -> BrokerResult<usize> {
    Ok(conn.llen(QUEUE_KEY).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;

    #[test]
    fn test_key_naming_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(job_key(&id), job_key(&id));
        assert!(job_key(&id).starts_with("codepad:job:"));
        assert!(lease_key(&id).ends_with(&id.to_string()));
        assert_ne!(job_key(&id), lease_key(&id));
    }

    #[test]
    fn test_validate_rejects_empty_code() {
        let err = validate_submission("", "5\n").unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_accepts_empty_stdin() {
        assert!(validate_submission("int main() {}", "").is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_inputs() {
        let big = "x".repeat(MAX_SOURCE_CODE_BYTES + 1);
        assert!(validate_submission(&big, "").is_err());

        let big_stdin = "1".repeat(MAX_STDIN_BYTES + 1);
        assert!(validate_submission("int main() {}", &big_stdin).is_err());
    }

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_view_not_found_for_missing_hash() {
        let id = Uuid::new_v4();
        let err = view_from_fields(&id, &HashMap::new()).unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(ref s) if *s == id.to_string()));
    }

    #[test]
    fn test_view_queued_has_no_payload() {
        let id = Uuid::new_v4();
        let view = view_from_fields(&id, &fields(&[("state", "queued")])).unwrap();
        assert_eq!(view.state, JobState::Queued);
        assert!(view.result.is_none());
        assert!(view.error.is_none());
    }

    #[test]
    fn test_view_completed_carries_outcome() {
        let id = Uuid::new_v4();
        let outcome = ExecutionOutcome {
            stdout: "Hello\n".to_string(),
            stderr: String::new(),
            compile_output: String::new(),
            status: Status::Accepted,
            time: Some("0.003".to_string()),
            memory: Some(1536),
        };
        let raw = serde_json::to_string(&outcome).unwrap();
        let hash = fields(&[("state", "completed"), ("result", &raw), ("error", "ignored")]);

        let first = view_from_fields(&id, &hash).unwrap();
        let second = view_from_fields(&id, &hash).unwrap();
        assert_eq!(first.result.as_ref(), Some(&outcome));
        assert!(first.error.is_none());
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_view_failed_carries_reason() {
        let id = Uuid::new_v4();
        let view = view_from_fields(
            &id,
            &fields(&[("state", "failed"), ("error", "Failed to connect to Docker daemon")]),
        )
        .unwrap();
        assert_eq!(view.error.as_deref(), Some("Failed to connect to Docker daemon"));
        assert!(view.result.is_none());
    }

    #[test]
    fn test_view_rejects_corrupt_records() {
        let id = Uuid::new_v4();
        assert!(matches!(
            view_from_fields(&id, &fields(&[("state", "completed")])),
            Err(BrokerError::Corrupt { .. })
        ));
        assert!(matches!(
            view_from_fields(&id, &fields(&[("state", "running")])),
            Err(BrokerError::Corrupt { .. })
        ));
    }

    /// Redis tests share one queue; run them one at a time.
    static REDIS_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    async fn connect() -> ConnectionManager {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(url).expect("Failed to create Redis client");
        ConnectionManager::new(client).await.expect("Failed to connect to Redis")
    }

    /// Claim until `job_id` comes up, returning every other claim seen on the way.
    async fn claim_job(conn: &mut ConnectionManager, job_id: &Uuid, lease: Duration) -> (Claim, Vec<Uuid>) {
        let mut skipped = Vec::new();
        loop {
            let claim = claim_next(conn, "test-worker", lease)
                .await
                .unwrap()
                .expect("queue should not be empty");
            if claim.job.id == *job_id {
                return (claim, skipped);
            }
            skipped.push(claim.job.id);
        }
    }

    fn accepted() -> ExecutionOutcome {
        ExecutionOutcome {
            stdout: String::new(),
            stderr: String::new(),
            compile_output: String::new(),
            status: Status::Accepted,
            time: Some("0.001".to_string()),
            memory: Some(1024),
        }
    }

    /// Full lifecycle against a live broker: queued -> active -> completed, polled twice.
    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_lifecycle_against_redis() {
        let _guard = REDIS_LOCK.lock().await;
        let mut conn = connect().await;
        let id = submit(&mut conn, "int main() { return 0; }", "").await.unwrap();
        assert_eq!(poll(&mut conn, &id).await.unwrap().state, JobState::Queued);

        let (claim, _) = claim_job(&mut conn, &id, Duration::from_secs(30)).await;
        assert_eq!(claim.job.attempts, 1);
        assert_eq!(poll(&mut conn, &id).await.unwrap().state, JobState::Active);

        assert!(complete(&mut conn, &claim, &accepted(), 60).await.unwrap());
        // Terminal state is set exactly once.
        assert!(!fail(&mut conn, &claim, "late failure", 60).await.unwrap());

        let first = serde_json::to_vec(&poll(&mut conn, &id).await.unwrap()).unwrap();
        let second = serde_json::to_vec(&poll(&mut conn, &id).await.unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_expired_lease_is_redelivered() {
        let _guard = REDIS_LOCK.lock().await;
        let mut conn = connect().await;
        let id = submit(&mut conn, "int main() { return 0; }", "").await.unwrap();

        let (stale, _) = claim_job(&mut conn, &id, Duration::from_secs(1)).await;
        assert_eq!(stale.job.attempts, 1);

        // A live lease keeps the job where it is.
        requeue_stalled(&mut conn).await.unwrap();
        assert_eq!(poll(&mut conn, &id).await.unwrap().state, JobState::Active);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(requeue_stalled(&mut conn).await.unwrap() >= 1);
        assert_eq!(poll(&mut conn, &id).await.unwrap().state, JobState::Queued);

        let (fresh, _) = claim_job(&mut conn, &id, Duration::from_secs(30)).await;
        assert_eq!(fresh.job.attempts, 2);
        assert_ne!(fresh.token, stale.token);

        // The worker that lost its lease can no longer write a result.
        assert!(!complete(&mut conn, &stale, &accepted(), 60).await.unwrap());
        assert!(!fail(&mut conn, &stale, "lost lease", 60).await.unwrap());
        assert_eq!(poll(&mut conn, &id).await.unwrap().state, JobState::Active);

        assert!(complete(&mut conn, &fresh, &accepted(), 60).await.unwrap());
        let view = poll(&mut conn, &id).await.unwrap();
        assert_eq!(view.state, JobState::Completed);
        assert_eq!(view.result, Some(accepted()));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_claim_skips_terminal_jobs() {
        let _guard = REDIS_LOCK.lock().await;
        let mut conn = connect().await;
        let done = submit(&mut conn, "int main() { return 0; }", "").await.unwrap();
        let (claim, _) = claim_job(&mut conn, &done, Duration::from_secs(30)).await;
        assert!(fail(&mut conn, &claim, "sandbox unavailable", 60).await.unwrap());

        // A stray queue entry for a finished job must never be handed out again.
        let _: () = conn.rpush(QUEUE_KEY, done.to_string()).await.unwrap();
        let next = submit(&mut conn, "int main() { return 1; }", "").await.unwrap();

        let (claim, skipped) = claim_job(&mut conn, &next, Duration::from_secs(30)).await;
        assert!(!skipped.contains(&done));
        assert_eq!(claim.job.attempts, 1);

        let view = poll(&mut conn, &done).await.unwrap();
        assert_eq!(view.state, JobState::Failed);
        assert_eq!(view.error.as_deref(), Some("sandbox unavailable"));
        assert!(complete(&mut conn, &claim, &accepted(), 60).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_unknown_job_is_not_found() {
        let _guard = REDIS_LOCK.lock().await;
        let mut conn = connect().await;
        let err = poll(&mut conn, &Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }
}
