use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a job inside the broker.
///
/// Transitions are strictly `Queued -> Active -> Completed | Failed`. A crashed
/// worker can cause `Active -> Queued` through stalled-job recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Closed outcome taxonomy. The numeric ids are part of the public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "StatusBody", try_from = "StatusBody")]
pub enum Status {
    Accepted,
    RuntimeError,
    TimeLimitExceeded,
    CompilationError,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Accepted,
        Status::RuntimeError,
        Status::TimeLimitExceeded,
        Status::CompilationError,
    ];

    pub fn id(&self) -> u8 {
        match self {
            Status::Accepted => 3,
            Status::RuntimeError => 4,
            Status::TimeLimitExceeded => 5,
            Status::CompilationError => 6,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Status::Accepted => "Accepted",
            Status::RuntimeError => "Runtime Error",
            Status::TimeLimitExceeded => "Time Limit Exceeded",
            Status::CompilationError => "Compilation Error",
        }
    }

    pub fn from_id(id: u8) -> Option<Status> {
        Status::ALL.into_iter().find(|s| s.id() == id)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Wire shape of [`Status`]: `{"id": 3, "description": "Accepted"}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBody {
    pub id: u8,
    pub description: String,
}

impl From<Status> for StatusBody {
    fn from(status: Status) -> Self {
        StatusBody {
            id: status.id(),
            description: status.description().to_string(),
        }
    }
}

impl TryFrom<StatusBody> for Status {
    type Error = String;

    fn try_from(body: StatusBody) -> Result<Self, Self::Error> {
        Status::from_id(body.id).ok_or_else(|| format!("unknown status id {}", body.id))
    }
}

/// Terminal value of a completed job. Created once by the worker, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub compile_output: String,
    pub status: Status,
    /// Elapsed seconds with millisecond precision, e.g. `"0.003"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Peak resident memory in KB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// A job as stored in the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub code: String,
    pub stdin: String,
    pub enqueued_at: DateTime<Utc>,
    pub state: JobState,
    pub attempts: u32,
}

impl Job {
    /// Rebuild a job from its broker hash fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, String> {
        let field = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| format!("job hash is missing field '{}'", name))
        };

        let id = Uuid::parse_str(field("id")?).map_err(|e| format!("bad job id: {}", e))?;
        let state = field("state")?.parse::<JobState>()?;
        let enqueued_ms: i64 = field("enqueued_at")?
            .parse()
            .map_err(|e| format!("bad enqueued_at: {}", e))?;
        let enqueued_at = Utc
            .timestamp_millis_opt(enqueued_ms)
            .single()
            .ok_or_else(|| format!("enqueued_at out of range: {}", enqueued_ms))?;
        let attempts = fields
            .get("attempts")
            .map(|a| a.parse::<u32>())
            .transpose()
            .map_err(|e| format!("bad attempts: {}", e))?
            .unwrap_or(0);

        Ok(Job {
            id,
            code: field("code")?.clone(),
            stdin: fields.get("stdin").cloned().unwrap_or_default(),
            enqueued_at,
            state,
            attempts,
        })
    }
}

/// Point-in-time view of a job served to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: Uuid,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ids_are_stable() {
        assert_eq!(Status::Accepted.id(), 3);
        assert_eq!(Status::RuntimeError.id(), 4);
        assert_eq!(Status::TimeLimitExceeded.id(), 5);
        assert_eq!(Status::CompilationError.id(), 6);
        for status in Status::ALL {
            assert_eq!(Status::from_id(status.id()), Some(status));
        }
        assert_eq!(Status::from_id(0), None);
    }

    #[test]
    fn test_status_wire_shape() {
        let json = serde_json::to_value(Status::TimeLimitExceeded).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": 5, "description": "Time Limit Exceeded"})
        );

        let parsed: Status =
            serde_json::from_value(serde_json::json!({"id": 4, "description": "whatever"})).unwrap();
        assert_eq!(parsed, Status::RuntimeError);

        let bad = serde_json::from_value::<Status>(serde_json::json!({"id": 9, "description": "x"}));
        assert!(bad.is_err());
    }

    #[test]
    fn test_outcome_omits_absent_measurements() {
        let outcome = ExecutionOutcome {
            stdout: String::new(),
            stderr: String::new(),
            compile_output: "main.cpp:1:1: error".to_string(),
            status: Status::CompilationError,
            time: None,
            memory: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("time"));
        assert!(!obj.contains_key("memory"));
        assert_eq!(obj["status"]["id"], 6);
    }

    #[test]
    fn test_job_view_camel_case() {
        let id = Uuid::new_v4();
        let view = JobView {
            job_id: id,
            state: JobState::Failed,
            result: None,
            error: Some("sandbox unavailable".to_string()),
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["jobId"], id.to_string());
        assert_eq!(json["state"], "failed");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_job_state_round_trip() {
        for state in [JobState::Queued, JobState::Active, JobState::Completed, JobState::Failed] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!(JobState::Completed.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn test_job_from_fields() {
        let id = Uuid::new_v4();
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), id.to_string());
        fields.insert("code".to_string(), "int main(){}".to_string());
        fields.insert("state".to_string(), "active".to_string());
        fields.insert("enqueued_at".to_string(), "1700000000000".to_string());
        fields.insert("attempts".to_string(), "2".to_string());

        let job = Job::from_fields(&fields).unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.stdin, "");
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.enqueued_at.timestamp_millis(), 1_700_000_000_000);

        fields.remove("code");
        assert!(Job::from_fields(&fields).is_err());
    }
}
