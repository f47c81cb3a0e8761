//! Runner → coordinator HTTP client.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use tracing::trace;

use super::model::{RunnerState, RunnerTask, TaskResult};
use crate::error::RunnerError;

/// The calls a runner makes to its coordinator.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Fetch the next task assigned to this runner, if any.
    async fn next_task(&self, runner_id: &str) -> Result<Option<RunnerTask>, RunnerError>;

    /// Push the latest state snapshot.
    async fn report_state(&self, state: &RunnerState) -> Result<(), RunnerError>;

    /// Hand back the outcome of a task.
    async fn submit_result(&self, runner_id: &str, result: &TaskResult) -> Result<(), RunnerError>;
}

/// [`CoordinatorClient`] speaking the coordinator's REST API.
pub struct HttpCoordinatorClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Result<Self, RunnerError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| RunnerError::Coordinator(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self.token.expose_secret();
        if token.is_empty() {
            request
        } else {
            request.bearer_auth(token)
        }
    }
}

fn request_failed(e: reqwest::Error) -> RunnerError {
    RunnerError::Coordinator(e.to_string())
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RunnerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RunnerError::Coordinator(format!(
        "{} {}",
        status,
        body.chars().take(200).collect::<String>()
    )))
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn next_task(&self, runner_id: &str) -> Result<Option<RunnerTask>, RunnerError> {
        let response = self
            .authorized(self.http.get(self.url(&format!("/runner/{runner_id}/next-task"))))
            .send()
            .await
            .map_err(request_failed)?;

        if response.status() == StatusCode::NO_CONTENT {
            trace!(runner_id, "No task available");
            return Ok(None);
        }

        let task = ensure_success(response)
            .await?
            .json::<RunnerTask>()
            .await
            .map_err(request_failed)?;
        Ok(Some(task))
    }

    async fn report_state(&self, state: &RunnerState) -> Result<(), RunnerError> {
        let response = self
            .authorized(
                self.http
                    .post(self.url(&format!("/runner/{}/state", state.runner_id)))
                    .json(state),
            )
            .send()
            .await
            .map_err(request_failed)?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn submit_result(&self, runner_id: &str, result: &TaskResult) -> Result<(), RunnerError> {
        let response = self
            .authorized(
                self.http
                    .post(self.url(&format!("/runner/{runner_id}/result")))
                    .json(result),
            )
            .send()
            .await
            .map_err(request_failed)?;
        ensure_success(response).await?;
        Ok(())
    }
}
