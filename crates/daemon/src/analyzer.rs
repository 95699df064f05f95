// crates/daemon/src/analyzer.rs
//! External analyzer subprocess driver.
//!
//! The analyzer is a black-box CLI: we pass it a provider/model pair, the
//! current system-prompt file, a capability list, no-session mode and a user
//! prompt; it streams newline-delimited JSON events on stdout. We read until
//! the `agent_end` event and take the last assistant message as the response.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL on timeout.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("Failed to spawn analyzer: {0}")]
    SpawnFailed(String),

    #[error("Analyzer timed out after {0:?}")]
    Timeout(Duration),

    #[error("Analyzer exited with code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Analyzer produced no assistant message")]
    NoResponse,

    #[error("Analyzer is not available: {0}")]
    NotAvailable(String),
}

/// A capability (skill) the analyzer is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub required: bool,
}

impl Capability {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

/// One analysis invocation.
#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub provider: String,
    pub model: String,
    pub system_prompt_path: PathBuf,
    pub capabilities: Vec<Capability>,
    pub user_prompt: String,
    pub timeout: Duration,
}

/// Seam for the external analyzer; mocked in worker tests.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Run one analysis and return the final assistant message text.
    async fn analyze(&self, request: &AnalyzeRequest) -> Result<String, AnalyzerError>;

    /// Cheap availability probe (binary on PATH, responds to --version).
    async fn health_check(&self) -> Result<(), AnalyzerError>;

    fn name(&self) -> &str;
}

/// Analyzer backed by the `pi` CLI.
pub struct PiCliAnalyzer {
    binary: String,
}

impl PiCliAnalyzer {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for PiCliAnalyzer {
    fn default() -> Self {
        Self::new("pi")
    }
}

#[async_trait]
impl Analyzer for PiCliAnalyzer {
    async fn analyze(&self, request: &AnalyzeRequest) -> Result<String, AnalyzerError> {
        let t0 = std::time::Instant::now();
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--provider")
            .arg(&request.provider)
            .arg("--model")
            .arg(&request.model)
            .arg("--system-prompt-file")
            .arg(&request.system_prompt_path)
            .arg("--no-session")
            .arg("--mode")
            .arg("json");
        for capability in &request.capabilities {
            if capability.required {
                cmd.arg("--tool").arg(&capability.name);
            } else {
                cmd.arg("--optional-tool").arg(&capability.name);
            }
        }
        cmd.arg(&request.user_prompt)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        info!(
            model = %request.model,
            provider = %request.provider,
            timeout_secs = request.timeout.as_secs(),
            "analyzer: spawning"
        );

        let mut child = cmd.spawn().map_err(|e| {
            warn!(error = %e, binary = %self.binary, "analyzer: failed to spawn");
            AnalyzerError::SpawnFailed(e.to_string())
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AnalyzerError::SpawnFailed("failed to capture stdout".to_string()))?;

        let read_events = async {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            let mut last_assistant: Option<String> = None;
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(event) = serde_json::from_str::<serde_json::Value>(&line) else {
                    debug!("analyzer: skipping non-JSON stdout line");
                    continue;
                };
                match event.get("type").and_then(|t| t.as_str()) {
                    Some("message_end") => {
                        if let Some(text) = extract_assistant_text(&event) {
                            last_assistant = Some(text);
                        }
                    }
                    Some("agent_end") => {
                        // The final event may carry the message inline.
                        if let Some(text) = extract_assistant_text(&event) {
                            last_assistant = Some(text);
                        }
                        break;
                    }
                    _ => {}
                }
            }
            last_assistant
        };

        let last_assistant = match tokio::time::timeout(request.timeout, read_events).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    elapsed_ms = t0.elapsed().as_millis() as u64,
                    "analyzer: timed out, terminating subprocess"
                );
                terminate(&mut child).await;
                return Err(AnalyzerError::Timeout(request.timeout));
            }
        };

        let status = child
            .wait()
            .await
            .map_err(|e| AnalyzerError::SpawnFailed(format!("failed to wait for analyzer: {e}")))?;

        if !status.success() {
            let stderr = match child.stderr.take() {
                Some(mut pipe) => {
                    use tokio::io::AsyncReadExt;
                    let mut buf = String::new();
                    let _ = pipe.read_to_string(&mut buf).await;
                    buf
                }
                None => String::new(),
            };
            warn!(exit_code = ?status.code(), "analyzer: non-zero exit");
            return Err(AnalyzerError::NonZeroExit {
                code: status.code(),
                stderr: stderr.chars().take(500).collect(),
            });
        }

        info!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "analyzer: response received"
        );
        last_assistant.ok_or(AnalyzerError::NoResponse)
    }

    async fn health_check(&self) -> Result<(), AnalyzerError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| AnalyzerError::NotAvailable(format!("{} not found: {e}", self.binary)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AnalyzerError::NotAvailable(format!(
                "{} --version failed",
                self.binary
            )))
        }
    }

    fn name(&self) -> &str {
        "pi-cli"
    }
}

/// SIGTERM the process tree, wait a grace period, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Pull assistant text out of a stream event's `message` payload.
fn extract_assistant_text(event: &serde_json::Value) -> Option<String> {
    let message = event.get("message")?;
    if message.get("role").and_then(|r| r.as_str()) != Some("assistant") {
        return None;
    }
    match message.get("content") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Array(blocks)) => {
            let text: String = blocks
                .iter()
                .filter_map(|block| {
                    (block.get("type").and_then(|t| t.as_str()) == Some("text"))
                        .then(|| block.get("text").and_then(|t| t.as_str()))
                        .flatten()
                })
                .collect::<Vec<_>>()
                .join("\n");
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}
