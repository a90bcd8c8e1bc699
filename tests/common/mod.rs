#![allow(dead_code)]

use async_trait::async_trait;
use sandbox_hub::sandbox::{
    ExecOptions, ExecResult, SandboxError, SandboxProvider, SnapshotImage,
};
use sandbox_hub::snapshot::{
    CatalogError, ConfigurationCatalog, ConfigurationEnvSpec, SnapshotLogPayload, SnapshotLogger,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Stderr every fake command emits; must never show up in logs
pub const LEAKY_STDERR: &str = "API_KEY=sk-live-should-never-be-logged";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExec {
    /// Address of the provider the call was made on
    pub receiver: usize,
    pub argv: Vec<String>,
    pub timeout_ms: u64,
}

#[derive(Default)]
pub struct RecordingProvider {
    pub execs: Mutex<Vec<RecordedExec>>,
    pub exit_codes: Mutex<VecDeque<i64>>,
    pub hang_execs: bool,
    pub fail_attach: bool,
    pub fail_capture: bool,
    pub forwarded: Mutex<Vec<(String, serde_json::Value)>>,
    pub captures: AtomicUsize,
    pub terminated: AtomicUsize,
}

impl RecordingProvider {
    /// Provider whose execs exit with `codes` in order, then 0
    pub fn with_exit_codes(codes: &[i64]) -> Self {
        Self {
            exit_codes: Mutex::new(codes.iter().copied().collect()),
            ..Self::default()
        }
    }

    pub fn execs(&self) -> Vec<RecordedExec> {
        lock(&self.execs).clone()
    }

    pub fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }
}

#[async_trait]
impl SandboxProvider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn attach(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        if self.fail_attach {
            return Err(SandboxError::Unavailable(format!("{sandbox_id} not found")));
        }
        Ok(())
    }

    async fn execute(
        &self,
        _sandbox_id: &str,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<ExecResult, SandboxError> {
        lock(&self.execs).push(RecordedExec {
            receiver: self.address(),
            argv: argv.to_vec(),
            timeout_ms: options.timeout_ms,
        });
        if self.hang_execs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let exit_code = lock(&self.exit_codes).pop_front().unwrap_or(0);
        Ok(ExecResult {
            stdout: String::new(),
            stderr: LEAKY_STDERR.to_string(),
            exit_code,
        })
    }

    async fn capture_snapshot(&self, sandbox_id: &str) -> Result<SnapshotImage, SandboxError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.fail_capture {
            return Err(SandboxError::Capture("registry rejected push".to_string()));
        }
        Ok(SnapshotImage {
            image_id: format!("snap-{sandbox_id}"),
        })
    }

    async fn forward_tool_call(
        &self,
        _sandbox_id: &str,
        name: &str,
        args: &serde_json::Value,
        _options: ExecOptions,
    ) -> Result<serde_json::Value, SandboxError> {
        lock(&self.forwarded).push((name.to_string(), args.clone()));
        Ok(serde_json::json!({ "ok": true, "tool": name }))
    }

    async fn terminate(&self, _sandbox_id: &str) -> Result<(), SandboxError> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLogger {
    infos: Mutex<Vec<String>>,
    errors: Mutex<Vec<(SnapshotLogPayload, String)>>,
}

impl RecordingLogger {
    pub fn infos(&self) -> Vec<String> {
        lock(&self.infos).clone()
    }

    pub fn errors(&self) -> Vec<(SnapshotLogPayload, String)> {
        lock(&self.errors).clone()
    }
}

impl SnapshotLogger for RecordingLogger {
    fn info(&self, message: &str) {
        lock(&self.infos).push(message.to_string());
    }

    fn error(&self, payload: &SnapshotLogPayload, message: &str) {
        lock(&self.errors).push((payload.clone(), message.to_string()));
    }
}

/// Catalog serving one fixed spec and counting fetches
#[derive(Default)]
pub struct StaticCatalog {
    pub spec: ConfigurationEnvSpec,
    pub fetches: AtomicUsize,
}

impl StaticCatalog {
    pub fn new(spec: ConfigurationEnvSpec) -> Self {
        Self {
            spec,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigurationCatalog for StaticCatalog {
    async fn get_configuration_env_files(
        &self,
        _configuration_id: &str,
    ) -> Result<ConfigurationEnvSpec, CatalogError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.spec.clone())
    }
}
