// HTTP route handlers for the Codepad API

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use codepad_common::connection;
use codepad_common::queue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub code: String,
    #[serde(default, alias = "input")]
    pub stdin: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    #[serde(rename = "jobId")]
    pub job_id: Option<String>,
}

/// POST /api/run - Submit a program for execution
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload.map_err(|rejection| {
        metrics::record_submission("rejected");
        ApiError::BadRequest(rejection.body_text())
    })?;

    if let Err(e) = queue::validate_submission(&payload.code, &payload.stdin) {
        metrics::record_submission("rejected");
        return Err(e.into());
    }

    let mut conn = connection::shared(&state.broker).await.map_err(|e| {
        metrics::record_submission("unavailable");
        ApiError::from(e)
    })?;

    match queue::submit(&mut conn, &payload.code, &payload.stdin).await {
        Ok(job_id) => {
            metrics::record_submission("accepted");
            info!(
                job_id = %job_id,
                source_size = payload.code.len(),
                stdin_size = payload.stdin.len(),
                "Job queued"
            );
            Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })).into_response())
        }
        Err(e) => {
            metrics::record_submission("unavailable");
            error!(error = %e, "Failed to queue job");
            Err(e.into())
        }
    }
}

/// GET /api/result?jobId=... - Poll a job
pub async fn get_result_by_query(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResultQuery>,
) -> Result<Response, ApiError> {
    match query.job_id {
        Some(job_id) => lookup(&state, &job_id).await,
        None => {
            metrics::record_poll("invalid");
            Err(ApiError::BadRequest("jobId is required".to_string()))
        }
    }
}

/// GET /api/result/{job_id} - Poll a job
pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    lookup(&state, &job_id).await
}

async fn lookup(state: &AppState, job_id: &str) -> Result<Response, ApiError> {
    let job_uuid = Uuid::parse_str(job_id.trim()).map_err(|_| {
        metrics::record_poll("invalid");
        ApiError::BadRequest("Invalid job ID format".to_string())
    })?;

    let mut conn = connection::shared(&state.broker).await?;
    match queue::poll(&mut conn, &job_uuid).await {
        Ok(view) => {
            metrics::record_poll(view.state.as_str());
            debug!(job_id = %job_uuid, state = %view.state, "Job polled");
            Ok((StatusCode::OK, Json(view)).into_response())
        }
        Err(e) => {
            if matches!(e, codepad_common::BrokerError::NotFound(_)) {
                metrics::record_poll("not_found");
            } else {
                warn!(job_id = %job_uuid, error = %e, "Failed to fetch job");
            }
            Err(e.into())
        }
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus scrape endpoint
pub async fn export_metrics() -> Result<Response, ApiError> {
    let body = metrics::render().map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        ApiError::Internal
    })?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codepad_common::config::BrokerConfig;

    fn state() -> Arc<AppState> {
        Arc::new(AppState {
            broker: BrokerConfig::default(),
        })
    }

    #[test]
    fn test_submit_request_accepts_input_alias() {
        let req: SubmitRequest =
            serde_json::from_str(r#"{"code":"int main(){}","input":"5\n"}"#).unwrap();
        assert_eq!(req.stdin, "5\n");
    }

    #[test]
    fn test_submit_request_defaults_stdin() {
        let req: SubmitRequest = serde_json::from_str(r#"{"code":"int main(){}"}"#).unwrap();
        assert_eq!(req.stdin, "");
    }

    #[test]
    fn test_submit_request_requires_string_code() {
        assert!(serde_json::from_str::<SubmitRequest>(r#"{"stdin":""}"#).is_err());
        assert!(serde_json::from_str::<SubmitRequest>(r#"{"code":42}"#).is_err());
    }

    #[test]
    fn test_submit_response_shape() {
        let job_id = Uuid::new_v4();
        let json = serde_json::to_value(SubmitResponse { job_id }).unwrap();
        assert_eq!(json, serde_json::json!({ "jobId": job_id.to_string() }));
    }

    #[tokio::test]
    async fn test_empty_code_is_rejected_before_broker() {
        let payload = Ok(Json(SubmitRequest {
            code: String::new(),
            stdin: String::new(),
        }));
        let err = submit_job(State(state()), payload).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_job_id_is_bad_request() {
        let err = get_result(State(state()), Path("not-a-uuid".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_job_id_is_bad_request() {
        let err = get_result_by_query(State(state()), Query(ResultQuery { job_id: None }))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::record_submission("rejected");
        let response = export_metrics().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
