use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, error};

/// Executes a query as a shell command, capturing stdout and stderr.
///
/// A non-zero exit code is tolerated; non-empty stderr is logged at error
/// severity but does not suppress the stdout result.
pub struct CommandExecutor;

impl CommandExecutor {
    pub async fn execute(&self, query: &str) -> Result<Option<String>> {
        debug!(query, "executing query");

        let output = Command::new("sh")
            .arg("-c")
            .arg(query)
            .output()
            .await
            .with_context(|| format!("spawning query command {query:?}"))?;

        if !output.stderr.is_empty() {
            error!(
                query,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "query error",
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

        debug!(query, result = %stdout, "query success");

        Ok(Some(stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_captures_trimmed_stdout() {
        let exec = CommandExecutor;
        let out = exec.execute("echo '1 2 3'").await.unwrap();
        assert_eq!(out.as_deref(), Some("1 2 3"));
    }

    #[tokio::test]
    async fn test_execute_tolerates_non_zero_exit() {
        let exec = CommandExecutor;
        let out = exec.execute("echo partial; exit 3").await.unwrap();
        assert_eq!(out.as_deref(), Some("partial"));
    }

    #[tokio::test]
    async fn test_execute_stderr_does_not_suppress_stdout() {
        let exec = CommandExecutor;
        let out = exec.execute("echo out; echo err >&2").await.unwrap();
        assert_eq!(out.as_deref(), Some("out"));
    }
}
