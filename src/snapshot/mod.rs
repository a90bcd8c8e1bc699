//! Snapshot lifecycle
//!
//! Secret-bearing env files are scrubbed from the sandbox before any image
//! capture and optionally restored afterwards. The scrub and the restore
//! always operate on one fetched `ConfigurationEnvSpec`, serialized once.

mod catalog;
mod lifecycle;
mod logger;

pub use catalog::{
    CatalogError, ConfigurationCatalog, EmptyConfigurationCatalog, HttpConfigurationCatalog,
};
pub use lifecycle::{
    env_command_argv, prepare_for_snapshot, CleanupGuard, EnvCommandFailure, FailureMode,
    SnapshotError, SnapshotPrepareOptions,
};
pub use logger::{LoggedError, SnapshotLogPayload, SnapshotLogger, TracingSnapshotLogger};

#[cfg(test)]
pub use catalog::MockConfigurationCatalog;

use serde::{Deserialize, Serialize};

/// One secret-bearing file inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvFileSpec {
    /// Absolute path of the file
    pub path: String,
    /// Keys inside the file that carry secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

/// Secret-bearing files for one configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationEnvSpec {
    /// Files to scrub and restore
    #[serde(default)]
    pub files: Vec<EnvFileSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_serializes_compactly() -> Result<(), serde_json::Error> {
        let spec = ConfigurationEnvSpec::default();
        assert_eq!(serde_json::to_string(&spec)?, r#"{"files":[]}"#);
        Ok(())
    }

    #[test]
    fn missing_keys_are_not_invented() -> Result<(), serde_json::Error> {
        let spec: ConfigurationEnvSpec =
            serde_json::from_str(r#"{"files":[{"path":"/app/.env"}]}"#)?;
        assert_eq!(spec.files[0].keys, None);
        assert_eq!(
            serde_json::to_string(&spec)?,
            r#"{"files":[{"path":"/app/.env"}]}"#
        );
        Ok(())
    }
}
