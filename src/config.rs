//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! the timing constants shared by the hub, the snapshot lifecycle and billing.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Address the HTTP/WebSocket server binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// HMAC secret used to sign billing tokens
    #[serde(default)]
    pub billing_token_secret: String,

    /// Bearer token required on control routes (session creation, revocation)
    pub control_token: Option<String>,

    /// Base URL of the configuration catalog service
    pub config_catalog_url: Option<String>,
    /// Bearer token for the configuration catalog service
    pub config_catalog_token: Option<String>,

    /// Docker image used for new sandboxes
    #[serde(default = "default_sandbox_image")]
    pub sandbox_image: String,

    /// Capacity of each hub's inbound command queue
    #[serde(default = "default_hub_queue_capacity")]
    pub hub_queue_capacity: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_sandbox_image() -> String {
    SANDBOX_IMAGE.to_string()
}

const fn default_hub_queue_capacity() -> usize {
    HUB_QUEUE_CAPACITY
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or the billing secret is missing.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Not checked into git
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Environment::default() maps UPPER_SNAKE_CASE to snake_case
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        if settings.billing_token_secret.is_empty() {
            if let Ok(val) = std::env::var("BILLING_TOKEN_SECRET") {
                settings.billing_token_secret = val;
            }
        }
        if settings.billing_token_secret.is_empty() {
            return Err(ConfigError::Message(
                "billing_token_secret must not be empty".to_string(),
            ));
        }

        if settings.config_catalog_url.is_none() {
            if let Ok(val) = std::env::var("CONFIG_CATALOG_URL") {
                if !val.is_empty() {
                    settings.config_catalog_url = Some(val);
                }
            }
        }

        Ok(settings)
    }
}

// Snapshot lifecycle
/// Timeout shared by the env scrub and env re-apply sandbox commands
pub const ENV_SCRUB_TIMEOUT_MS: u64 = 15_000;
/// CLI inside the sandbox that owns the scrub/apply subcommands
pub const SANDBOX_CLI: &str = "proliferate";

// Billing
/// Billing token lifetime; matches the maximum sandbox lifetime
pub const BILLING_TOKEN_TTL_SECS: u64 = 60 * 60;
/// Attempts made by the token-version compare-and-set loop before giving up
pub const TOKEN_VERSION_CAS_ATTEMPTS: usize = 8;

// Hub
/// Default capacity of a hub's inbound command queue
pub const HUB_QUEUE_CAPACITY: usize = 64;
/// Timeout for a forwarded (non-intercepted) tool call
pub const TOOL_CALL_TIMEOUT_SECS: u64 = 300;
/// Timeout for snapshot capture
pub const SNAPSHOT_CAPTURE_TIMEOUT_SECS: u64 = 600;

// Sandbox
/// Docker image for the sandbox
pub const SANDBOX_IMAGE: &str = "sandbox-hub-sandbox:latest";
/// Repository name used when committing sandbox snapshots
pub const SNAPSHOT_REPOSITORY: &str = "sandbox-hub-snapshot";

// Configuration catalog
/// Per-request timeout when fetching configuration env files
pub const CATALOG_REQUEST_TIMEOUT_SECS: u64 = 10;
/// Maximum retry attempts for configuration catalog requests
pub const CATALOG_MAX_RETRIES: usize = 3;
/// Initial backoff between catalog retries
pub const CATALOG_RETRY_BASE_MS: u64 = 200;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Environment-mutating assertions live in one test to avoid races
    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("BILLING_TOKEN_SECRET", "test-secret");
        env::set_var("CONFIG_CATALOG_URL", "https://catalog.test");

        let settings = Settings::new()?;
        assert_eq!(settings.billing_token_secret, "test-secret");
        assert_eq!(
            settings.config_catalog_url,
            Some("https://catalog.test".to_string())
        );
        assert_eq!(settings.bind_addr, "127.0.0.1:8787");
        assert_eq!(settings.hub_queue_capacity, HUB_QUEUE_CAPACITY);

        env::remove_var("CONFIG_CATALOG_URL");
        env::set_var("CONFIG_CATALOG_URL", "");

        let settings = Settings::new()?;
        assert_eq!(settings.config_catalog_url, None);

        env::remove_var("CONFIG_CATALOG_URL");
        env::remove_var("BILLING_TOKEN_SECRET");
        Ok(())
    }

    #[test]
    fn billing_ttl_matches_sandbox_lifetime() {
        assert_eq!(BILLING_TOKEN_TTL_SECS, 3600);
        assert_eq!(ENV_SCRUB_TIMEOUT_MS, 15_000);
    }
}
