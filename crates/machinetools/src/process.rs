use async_trait::async_trait;
use machinecore::{CodeImplementation, CodeRunner, ToolError, ToolOutput};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs generated code in a child interpreter process.
///
/// The input is written to stdin as JSON. The program prints its answer on
/// stdout: either plain text, or a JSON object whose `result` is the value
/// and whose optional `confidence` is a number in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ProcessCodeRunner {
    interpreters: BTreeMap<String, Vec<String>>,
    timeout: Duration,
}

impl ProcessCodeRunner {
    pub fn new(timeout: Duration) -> Self {
        let mut interpreters = BTreeMap::new();
        interpreters.insert("python".to_string(), vec!["python3".to_string(), "-c".to_string()]);
        interpreters.insert("sh".to_string(), vec!["sh".to_string(), "-c".to_string()]);
        interpreters.insert("javascript".to_string(), vec!["node".to_string(), "-e".to_string()]);
        Self {
            interpreters,
            timeout,
        }
    }

    /// Map a language name to an interpreter command line; the code is
    /// appended as the final argument.
    pub fn with_interpreter(mut self, language: impl Into<String>, argv: Vec<String>) -> Self {
        self.interpreters.insert(language.into().to_lowercase(), argv);
        self
    }

    fn command_for(&self, language: &str) -> Result<&[String], ToolError> {
        let language = language.to_lowercase();
        let key = match language.as_str() {
            "py" | "python3" => "python",
            "bash" | "shell" => "sh",
            "js" | "node" => "javascript",
            other => other,
        };
        self.interpreters
            .get(key)
            .filter(|argv| !argv.is_empty())
            .map(Vec::as_slice)
            .ok_or_else(|| ToolError::Configuration(format!("no interpreter for language '{}'", language)))
    }

    fn parse_output(stdout: &str) -> Result<ToolOutput, ToolError> {
        let trimmed = stdout.trim();
        let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            return Ok(ToolOutput::new(serde_json::Value::String(trimmed.to_string())));
        };

        let serde_json::Value::Object(mut map) = json else {
            return Ok(ToolOutput::new(json));
        };
        let confidence = match map.remove("confidence") {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => {
                let c = value.as_f64().ok_or_else(|| {
                    ToolError::ExecutionFailed("confidence must be a number".to_string())
                })?;
                Some(c.clamp(0.0, 1.0))
            }
        };
        let value = match map.remove("result") {
            Some(result) => result,
            None => serde_json::Value::Object(map),
        };

        let mut output = ToolOutput::new(value);
        output.confidence = confidence;
        Ok(output)
    }
}

impl Default for ProcessCodeRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl CodeRunner for ProcessCodeRunner {
    async fn run(
        &self,
        code: &CodeImplementation,
        input: serde_json::Value,
        cancellation: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let argv = self.command_for(&code.language)?;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .arg(&code.code)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(language = %code.language, interpreter = %argv[0], "Spawning generated code");
        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to spawn {}: {}", argv[0], e)))?;

        let payload = serde_json::to_vec(&input)
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to encode input: {}", e)))?;
        // Fed from its own task so a child that never drains stdin cannot
        // hold the call past the timeout.
        let feeder = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!("stdin not fully consumed: {}", e);
                }
            })
        });

        let millis = self.timeout.as_millis() as u64;
        let waited = tokio::select! {
            _ = cancellation.cancelled() => Err(ToolError::Cancelled),
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(output) => output.map_err(|e| {
                    ToolError::ExecutionFailed(format!("Failed to wait for process: {}", e))
                }),
                Err(_) => {
                    tracing::warn!(millis, "Generated code timed out");
                    Err(ToolError::Timeout { millis })
                }
            },
        };
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        let output = waited?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(ToolError::ExecutionFailed(format!(
                "Process exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if !stderr.trim().is_empty() {
            tracing::debug!(stderr = %stderr.trim(), "Generated code wrote to stderr");
        }

        Self::parse_output(&stdout)
    }
}
