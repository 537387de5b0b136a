//! Shell tool: run an allow-listed command through `sh -c`.

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use toolweave_core::error::ToolError;
use toolweave_core::tool::{Tool, ToolOutput};
use tracing::{debug, warn};

const SHELL_OPERATORS: [&str; 8] = [";", "&", "|", "`", "$(", ">", "<", "\n"];

/// Execute shell commands whose first word is on the allow-list.
pub struct ShellTool {
    /// If empty, every command is allowed.
    allowed_commands: Vec<String>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self { allowed_commands }
    }

    fn base_command(command: &str) -> &str {
        command.split_whitespace().next().unwrap_or("")
    }

    /// Only the first word is checked, so an allow-list also rules out
    /// chaining, substitution and redirection.
    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }
        if SHELL_OPERATORS.iter().any(|op| command.contains(op)) {
            return false;
        }
        let base = Self::base_command(command);
        self.allowed_commands.iter().any(|a| a == base)
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command and return its stdout and stderr. Only allow-listed commands are permitted."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let command = arguments["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'command'".into()))?;

        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: "shell".into(),
                reason: format!("command '{}' is not allow-listed", Self::base_command(command)),
            });
        }

        debug!(command = %command, "Executing shell command");
        let mut cmd = if cfg!(target_os = "windows") {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        };
        // A timed-out call drops this future; the child must not outlive it.
        let output = cmd.kill_on_drop(true).output().await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: "shell".into(),
            reason: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            return Err(ToolError::ExecutionFailed {
                tool_name: "shell".into(),
                reason: format!("exit code {code}: {}", format!("{stdout}\n{stderr}").trim()),
            });
        }

        let text = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            format!("{}\n[stderr]: {}", stdout.trim(), stderr.trim())
        };
        Ok(ToolOutput::text(text).with_data(serde_json::json!({ "exit_code": 0 })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_check() {
        let tool = ShellTool::new(vec!["ls".into(), "cat".into()]);
        assert!(tool.is_command_allowed("ls -la"));
        assert!(tool.is_command_allowed("cat file.txt"));
        assert!(!tool.is_command_allowed("rm -rf /"));
        assert!(!tool.is_command_allowed(""));
    }

    #[test]
    fn allowlist_rejects_chaining() {
        let tool = ShellTool::new(vec!["ls".into(), "echo".into()]);
        assert!(!tool.is_command_allowed("ls; rm -rf /"));
        assert!(!tool.is_command_allowed("echo $(whoami)"));
        assert!(!tool.is_command_allowed("echo hi > /etc/passwd"));
        assert!(!tool.is_command_allowed("ls && curl example.com"));
    }

    #[test]
    fn empty_allowlist_allows_all() {
        let tool = ShellTool::new(vec![]);
        assert!(tool.is_command_allowed("anything goes"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_echo() {
        let tool = ShellTool::new(vec!["echo".into()]);
        let out = tool
            .execute(serde_json::json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(out.content, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_execution_failure() {
        let tool = ShellTool::new(vec![]);
        let err = tool
            .execute(serde_json::json!({"command": "exit 3"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
        assert!(!err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_command_is_killed() {
        let marker = std::env::temp_dir().join(format!("toolweave-shell-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);
        let tool = ShellTool::new(vec![]);
        let command = format!("sleep 1 && touch {}", marker.display());

        let run = tool.execute(serde_json::json!({ "command": command }));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(200), run)
                .await
                .is_err()
        );

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert!(!marker.exists(), "command kept running after the call was dropped");
    }

    #[tokio::test]
    async fn blocked_command() {
        let tool = ShellTool::new(vec!["ls".into()]);
        let result = tool.execute(serde_json::json!({"command": "rm -rf /"})).await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
    }
}
