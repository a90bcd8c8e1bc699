//! `save_snapshot` intercepted tool
//!
//! Lets the agent ask for a snapshot without the sandbox ever holding the
//! credentials the capture needs.

use super::{InterceptedTool, ToolOutcome};
use crate::hub::SessionHub;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct SaveSnapshotArgs {
    #[serde(default = "default_reapply")]
    reapply: bool,
}

const fn default_reapply() -> bool {
    true
}

/// Captures the session's sandbox from inside the hub
pub struct SaveSnapshotTool;

#[async_trait]
impl InterceptedTool for SaveSnapshotTool {
    fn name(&self) -> &'static str {
        "save_snapshot"
    }

    async fn execute(
        &self,
        hub: &mut SessionHub,
        args: serde_json::Value,
    ) -> anyhow::Result<ToolOutcome> {
        let args: SaveSnapshotArgs = if args.is_null() {
            SaveSnapshotArgs {
                reapply: default_reapply(),
            }
        } else {
            match serde_json::from_value(args) {
                Ok(args) => args,
                Err(e) => return Ok(ToolOutcome::failure(format!("Invalid arguments: {e}"))),
            }
        };

        let configuration_id = hub.session().configuration_id.clone();
        match hub
            .request_snapshot(configuration_id.as_deref(), args.reapply)
            .await
        {
            Ok(image) => Ok(ToolOutcome::ok_with_data(
                "Snapshot saved",
                serde_json::json!({ "image_id": image.image_id }),
            )),
            Err(e) => {
                warn!(session_id = %hub.session().id, error = %e, "save_snapshot failed");
                Ok(ToolOutcome::failure(format!("Snapshot failed: {e}")))
            }
        }
    }
}
