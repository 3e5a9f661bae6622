//! HTTP implementation of the control-plane client.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use buildhand_core::{BuildRecord, LogRecord, Secret, SecretSpec, ServiceRecord, StepRecord};

use crate::error::{ClientError, Result};
use crate::ControlPlane;

/// HTTP client for the control-plane API.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    base_url: String,
    token: String,
    client: Client,
}

impl HttpControlPlane {
    /// Creates a client against the given base URL using the worker's
    /// shared secret as bearer token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            client: Client::new(),
        }
    }

    /// Creates a client with a preconfigured [`reqwest::Client`]
    /// (timeouts, proxies, TLS).
    pub fn with_client(
        base_url: impl Into<String>,
        token: impl Into<String>,
        client: Client,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{path}", self.base_url)
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()));
        }

        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(message));
        }
        Err(ClientError::api(status.as_u16(), message))
    }

    async fn put<B: serde::Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .put(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        self.handle_response(response).await
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn update_build(&self, build: &BuildRecord) -> Result<BuildRecord> {
        self.put(&format!("builds/{}", build.id), build).await
    }

    async fn update_step(&self, step: &StepRecord) -> Result<StepRecord> {
        self.put(
            &format!("builds/{}/steps/{}", step.build_id, step.number),
            step,
        )
        .await
    }

    async fn update_service(&self, service: &ServiceRecord) -> Result<ServiceRecord> {
        self.put(
            &format!("builds/{}/services/{}", service.build_id, service.number),
            service,
        )
        .await
    }

    async fn get_step_log(&self, build_id: Uuid, number: u32) -> Result<LogRecord> {
        self.get(&format!("builds/{build_id}/steps/{number}/logs")).await
    }

    async fn update_step_log(&self, log: &LogRecord) -> Result<LogRecord> {
        self.put(
            &format!("builds/{}/steps/{}/logs", log.build_id, log.number),
            log,
        )
        .await
    }

    async fn get_service_log(&self, build_id: Uuid, number: u32) -> Result<LogRecord> {
        self.get(&format!("builds/{build_id}/services/{number}/logs"))
            .await
    }

    async fn update_service_log(&self, log: &LogRecord) -> Result<LogRecord> {
        self.put(
            &format!("builds/{}/services/{}/logs", log.build_id, log.number),
            log,
        )
        .await
    }

    async fn get_secret(&self, spec: &SecretSpec) -> Result<Secret> {
        self.get(&format!(
            "secrets/{}/{}/{}",
            spec.engine, spec.kind, spec.name
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = HttpControlPlane::new("http://localhost:8080/", "s3cr3t");
        assert_eq!(client.url("builds/x"), "http://localhost:8080/api/v1/builds/x");
    }
}
