//! Out-of-process script execution.
//!
//! Each call spawns a fresh interpreter with an empty environment. The host
//! and the script only share the JSON written to the child's stdin and the
//! JSON it prints back:
//!
//! ```text
//! stdin:  {"entrypoint": "handle", "source": "...", "args": <value>}
//! stdout: {"result": <value>} | {"error": "<message>"} | {"missing": "<name>"}
//! ```

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::ScriptError;

/// Node.js harness implementing the stdin/stdout contract.
pub const NODE_HARNESS: &str = include_str!("../../scripts/sandbox_harness.js");

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::node("node")
    }
}

impl SandboxConfig {
    /// Run scripts with the bundled harness under the given `node` binary.
    pub fn node(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec!["-e".to_string(), NODE_HARNESS.to_string()],
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct Invocation<'a> {
    entrypoint: &'a str,
    source: &'a str,
    args: &'a Value,
}

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    missing: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptSandbox {
    config: SandboxConfig,
}

impl ScriptSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Call `entrypoint(args)` defined by `source` and return its value.
    pub async fn run(
        &self,
        source: &str,
        entrypoint: &str,
        args: &Value,
    ) -> Result<Value, ScriptError> {
        if !is_identifier(entrypoint) {
            return Err(ScriptError::InvalidEntrypoint(entrypoint.to_string()));
        }

        let payload = serde_json::to_vec(&Invocation {
            entrypoint,
            source,
            args,
        })
        .map_err(|e| ScriptError::Protocol(e.to_string()))?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ScriptError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("Sandbox closed stdin early: {}", e);
                }
            });
        }

        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| ScriptError::Timeout(self.config.timeout))?
            .map_err(ScriptError::Spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply: Reply = match serde_json::from_str(stdout.trim()) {
            Ok(reply) => reply,
            Err(e) if output.status.success() => {
                return Err(ScriptError::Protocol(e.to_string()));
            }
            Err(_) => {
                return Err(ScriptError::Exited {
                    code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
        };

        if let Some(message) = reply.error {
            return Err(ScriptError::Runtime(message));
        }
        if let Some(name) = reply.missing {
            return Err(ScriptError::MissingEntrypoint(name));
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
