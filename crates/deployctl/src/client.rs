//! HTTP client for the deployd daemon.

use deploy_core::types::{DeploymentRun, InstalledAppVersion, Pipeline, RunStatus, WorkflowStage, WorkflowType};
use deploy_core::TimelineEntry;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: deployd\n  → or set DEPLOYD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check DEPLOYD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure deployd is running\n  → check DEPLOYD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for POST /runs.
#[derive(Debug, Serialize)]
pub struct CreateRunRequest {
    pub pipeline_id: i64,
    pub workflow_type: WorkflowType,
    pub name: String,
    pub triggered_by: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRunResponse {
    pub run: DeploymentRun,
    pub superseded: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListPipelinesResponse {
    pipelines: Vec<Pipeline>,
}

#[derive(Debug, Deserialize)]
struct ListRunsResponse {
    runs: Vec<DeploymentRun>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: DeploymentRun,
}

#[derive(Debug, Deserialize)]
struct TimelineResponse {
    timeline: Vec<TimelineEntry>,
}

#[derive(Debug, Deserialize)]
struct StagesResponse {
    stages: BTreeMap<String, Vec<WorkflowStage>>,
}

#[derive(Debug, Deserialize)]
struct DeploymentResponse {
    version: InstalledAppVersion,
}

/// One entry of a deploy response.
#[derive(Debug, Deserialize)]
pub struct EnqueueResult {
    pub version_id: String,
    pub msg_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeployResponse {
    pub history_id: String,
    pub results: Vec<EnqueueResult>,
}

#[derive(Debug, Deserialize)]
pub struct SupersedeResponse {
    pub superseded: Vec<String>,
    pub queued: Vec<String>,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for deployd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Probe /health. `Ok(false)` on an unhealthy response, `Err` when the
    /// connection failed.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon with exponential backoff starting at 200ms.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms.min(remaining)))
                        .await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| "unknown error".to_string(), |e| e.error);

        match status {
            404 => ClientError::NotFound(message),
            400 | 409 => ClientError::Rejected(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        self.decode(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(body)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// GET /pipelines
    pub async fn list_pipelines(&self) -> Result<Vec<Pipeline>, ClientError> {
        let body: ListPipelinesResponse = self.get_json("/pipelines").await?;
        Ok(body.pipelines)
    }

    /// POST /runs
    pub async fn create_run(&self, req: &CreateRunRequest) -> Result<CreateRunResponse, ClientError> {
        self.post_json("/runs", req).await
    }

    /// GET /runs?pipeline_id=...&status=...
    pub async fn list_runs(
        &self,
        pipeline_id: Option<i64>,
        status: Option<RunStatus>,
    ) -> Result<Vec<DeploymentRun>, ClientError> {
        let path = runs_query(pipeline_id, status);
        let body: ListRunsResponse = self.get_json(&path).await?;
        Ok(body.runs)
    }

    /// GET /runs/{id}
    pub async fn get_run(&self, run_id: &str) -> Result<DeploymentRun, ClientError> {
        let body: RunResponse = self
            .get_json(&format!("/runs/{}", urlencoding::encode(run_id)))
            .await?;
        Ok(body.run)
    }

    /// GET /runs/{id}/timeline
    pub async fn run_timeline(&self, run_id: &str) -> Result<Vec<TimelineEntry>, ClientError> {
        let body: TimelineResponse = self
            .get_json(&format!("/runs/{}/timeline", urlencoding::encode(run_id)))
            .await?;
        Ok(body.timeline)
    }

    /// GET /histories/{id}/timeline
    pub async fn history_timeline(&self, history_id: &str) -> Result<Vec<TimelineEntry>, ClientError> {
        let body: TimelineResponse = self
            .get_json(&format!("/histories/{}/timeline", urlencoding::encode(history_id)))
            .await?;
        Ok(body.timeline)
    }

    /// GET /runs/{id}/stages
    pub async fn run_stages(
        &self,
        run_id: &str,
    ) -> Result<BTreeMap<String, Vec<WorkflowStage>>, ClientError> {
        let body: StagesResponse = self
            .get_json(&format!("/runs/{}/stages", urlencoding::encode(run_id)))
            .await?;
        Ok(body.stages)
    }

    /// POST /runs/{id}/status
    pub async fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        user_id: i32,
    ) -> Result<DeploymentRun, ClientError> {
        let body: RunResponse = self
            .post_json(
                &format!("/runs/{}/status", urlencoding::encode(run_id)),
                &serde_json::json!({ "status": status.as_str(), "user_id": user_id }),
            )
            .await?;
        Ok(body.run)
    }

    /// POST /runs/{id}/fail
    pub async fn fail_run(
        &self,
        run_id: &str,
        message: &str,
        superseded: bool,
        user_id: i32,
    ) -> Result<DeploymentRun, ClientError> {
        let body: RunResponse = self
            .post_json(
                &format!("/runs/{}/fail", urlencoding::encode(run_id)),
                &serde_json::json!({
                    "message": message,
                    "superseded": superseded,
                    "user_id": user_id,
                }),
            )
            .await?;
        Ok(body.run)
    }

    /// POST /pipelines/{id}/supersede
    pub async fn supersede(
        &self,
        pipeline_id: i64,
        run_id: &str,
        user_id: i32,
    ) -> Result<SupersedeResponse, ClientError> {
        self.post_json(
            &format!("/pipelines/{pipeline_id}/supersede"),
            &serde_json::json!({ "run_id": run_id, "user_id": user_id }),
        )
        .await
    }

    /// GET /deployments/{id}
    pub async fn get_deployment(&self, version_id: &str) -> Result<InstalledAppVersion, ClientError> {
        let body: DeploymentResponse = self
            .get_json(&format!("/deployments/{}", urlencoding::encode(version_id)))
            .await?;
        Ok(body.version)
    }

    /// POST /deployments/{id}/deploy
    pub async fn deploy(
        &self,
        version_id: &str,
        history_id: Option<&str>,
        run_id: Option<&str>,
        user_id: i32,
    ) -> Result<DeployResponse, ClientError> {
        self.post_json(
            &format!("/deployments/{}/deploy", urlencoding::encode(version_id)),
            &serde_json::json!({ "history_id": history_id, "run_id": run_id, "user_id": user_id }),
        )
        .await
    }

    /// GET /pipelines/{id}/resource-tree
    pub async fn resource_tree(&self, pipeline_id: i64) -> Result<serde_json::Value, ClientError> {
        self.get_json(&format!("/pipelines/{pipeline_id}/resource-tree"))
            .await
    }

    /// GET /pipelines/{id}/configuration?run_id=...
    pub async fn configuration(
        &self,
        pipeline_id: i64,
        run_id: Option<&str>,
    ) -> Result<serde_json::Value, ClientError> {
        let mut path = format!("/pipelines/{pipeline_id}/configuration");
        if let Some(run_id) = run_id {
            path = format!("{path}?run_id={}", urlencoding::encode(run_id));
        }
        self.get_json(&path).await
    }

    /// Stream GET /runs/{id}/report to `out`.
    pub async fn write_report(&self, run_id: &str, out: &mut impl Write) -> Result<(), ClientError> {
        use futures::StreamExt;

        let url = format!("{}/runs/{}/report", self.base_url, urlencoding::encode(run_id));
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            out.write_all(&chunk)
                .map_err(|e| ClientError::IoError(e.to_string()))?;
        }
        out.flush().map_err(|e| ClientError::IoError(e.to_string()))
    }
}

fn runs_query(pipeline_id: Option<i64>, status: Option<RunStatus>) -> String {
    let mut params = vec![];
    if let Some(id) = pipeline_id {
        params.push(format!("pipeline_id={id}"));
    }
    if let Some(s) = status {
        params.push(format!("status={}", urlencoding::encode(s.as_str())));
    }
    if params.is_empty() {
        "/runs".to_string()
    } else {
        format!("/runs?{}", params.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_query_combines_filters() {
        assert_eq!(runs_query(None, None), "/runs");
        assert_eq!(runs_query(Some(3), None), "/runs?pipeline_id=3");
        assert_eq!(
            runs_query(Some(3), Some(RunStatus::WaitingToStart)),
            "/runs?pipeline_id=3&status=WaitingToStart"
        );
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:7800/", None);
        assert_eq!(client.addr(), "http://localhost:7800");
    }

    #[test]
    fn client_headers_include_auth_when_token_set() {
        let client = Client::new("http://localhost:7800", Some("test-token"));
        let headers = client.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer test-token");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn client_headers_omit_auth_when_no_token() {
        let client = Client::new("http://localhost:7800", None);
        assert!(client.headers().get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn check_health_fails_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19998", None);
        assert!(client.check_health().await.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19998", None);
        match client.wait_for_ready_with_timeout(100).await {
            Err(ClientError::DaemonNotReady { addr, timeout_ms }) => {
                assert_eq!(addr, "http://127.0.0.1:19998");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected DaemonNotReady error, got {other:?}"),
        }
    }

    #[test]
    fn error_messages_point_at_env_vars() {
        let err = ClientError::ConnectionFailed {
            addr: "http://127.0.0.1:7800".to_string(),
        };
        assert!(err.to_string().contains("DEPLOYD_ADDR"));
        assert!(ClientError::Unauthorized.to_string().contains("--token"));
    }
}
