//! Configuration env catalog client
//!
//! Resolves a configuration id to the secret-bearing files it places in the
//! sandbox. Results are never cached: every scrub/re-apply pair fetches fresh.

use super::ConfigurationEnvSpec;
use crate::config::{
    CATALOG_MAX_RETRIES, CATALOG_REQUEST_TIMEOUT_SECS, CATALOG_RETRY_BASE_MS,
};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

/// Errors that can occur while fetching configuration env files
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Unknown configuration id
    #[error("configuration not found: {0}")]
    NotFound(String),
    /// Transport or server failure
    #[error("configuration catalog request failed: {0}")]
    Request(String),
    /// Response body was not a valid env spec
    #[error("invalid configuration catalog response: {0}")]
    Decode(String),
}

impl CatalogError {
    const fn is_transient(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

/// Source of configuration env specs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigurationCatalog: Send + Sync {
    /// Files and keys carrying secrets for `configuration_id`
    async fn get_configuration_env_files(
        &self,
        configuration_id: &str,
    ) -> Result<ConfigurationEnvSpec, CatalogError>;
}

/// HTTP client for the configuration catalog service
pub struct HttpConfigurationCatalog {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpConfigurationCatalog {
    /// Create a catalog client for `base_url`
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::Request` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CATALOG_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| CatalogError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn env_files_url(&self, configuration_id: &str) -> String {
        format!(
            "{}/configurations/{}/env-files",
            self.base_url,
            urlencoding::encode(configuration_id)
        )
    }

    async fn fetch_once(&self, configuration_id: &str) -> Result<ConfigurationEnvSpec, CatalogError> {
        let mut request = self.client.get(self.env_files_url(configuration_id));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CatalogError::Request(e.without_url().to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound(configuration_id.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| CatalogError::Request(e.without_url().to_string()))?;

        response
            .json::<ConfigurationEnvSpec>()
            .await
            .map_err(|e| CatalogError::Decode(e.without_url().to_string()))
    }
}

#[async_trait]
impl ConfigurationCatalog for HttpConfigurationCatalog {
    async fn get_configuration_env_files(
        &self,
        configuration_id: &str,
    ) -> Result<ConfigurationEnvSpec, CatalogError> {
        let retry_strategy = ExponentialBackoff::from_millis(CATALOG_RETRY_BASE_MS)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(CATALOG_MAX_RETRIES);

        let spec = RetryIf::start(
            retry_strategy,
            || self.fetch_once(configuration_id),
            CatalogError::is_transient,
        )
        .await
        .map_err(|e| {
            warn!(configuration_id, error = %e, "Configuration catalog fetch failed");
            e
        })?;

        debug!(
            configuration_id,
            files = spec.files.len(),
            "Fetched configuration env files"
        );
        Ok(spec)
    }
}

/// Catalog that reports no secret files for any configuration.
///
/// Used when no catalog service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyConfigurationCatalog;

#[async_trait]
impl ConfigurationCatalog for EmptyConfigurationCatalog {
    async fn get_configuration_env_files(
        &self,
        _configuration_id: &str,
    ) -> Result<ConfigurationEnvSpec, CatalogError> {
        Ok(ConfigurationEnvSpec::default())
    }
}
