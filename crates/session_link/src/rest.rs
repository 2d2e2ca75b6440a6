use reqwest::Client;
use serde::de::DeserializeOwned;
use shared::error::ApiError;
use tracing::debug;

use crate::{
    config::LinkSettings,
    error::LinkError,
    retry::{RetryError, RetryExecutor},
};

/// JSON over HTTP against the session's backend. Reads go through the
/// retry executor; only transient failures are repeated.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    retry: RetryExecutor,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, retry: RetryExecutor) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }

    pub fn from_settings(settings: &LinkSettings) -> Self {
        Self::new(settings.server_url.clone(), settings.retry_executor())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Cancelling the executor aborts every pending retry of this client.
    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, LinkError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        match self
            .retry
            .run_if(|| self.get_once(&url), LinkError::is_transient)
            .await
        {
            Ok(value) => Ok(value),
            Err(RetryError::Failed { last, .. }) => Err(last),
            Err(RetryError::Cancelled) => Err(LinkError::Cancelled),
        }
    }

    async fn get_once<T: DeserializeOwned>(&self, url: &str) -> Result<T, LinkError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%url, status = status.as_u16(), "rest: request failed");
            return Err(match serde_json::from_str::<ApiError>(&body) {
                Ok(api) => LinkError::Api(api),
                Err(_) => LinkError::Http {
                    status: status.as_u16(),
                    body,
                },
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
