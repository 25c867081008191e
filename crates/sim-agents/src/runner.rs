//! Code runner that pipes a snippet into a local interpreter.
//!
//! Meant for development; production deployments put a sandbox behind the
//! same [`CodeRunner`] trait.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use sim_coordination::{CodeRunner, RunOutput, RunnerError, StructuredError};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::RunnerSettings;

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([A-Za-z_][A-Za-z0-9_.]*(?:Error|Exception)):\s*(.*)$")
        .expect("error line regex should compile")
});

static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bline (\d+)").expect("location regex should compile"));

/// Runs snippets with `program args...`, feeding the code on stdin.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `None` when no program is configured.
    pub fn from_settings(settings: &RunnerSettings) -> Option<Self> {
        let program = settings.program.as_ref()?;
        Some(
            Self::new(program.clone())
                .args(settings.args.iter().cloned())
                .timeout(settings.timeout()),
        )
    }
}

#[async_trait]
impl CodeRunner for CommandRunner {
    async fn run(&self, code: &str) -> Result<RunOutput, RunnerError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Unavailable(format!("{}: {e}", self.program)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(code.as_bytes())
                .await
                .map_err(|e| RunnerError::Failed(format!("writing snippet: {e}")))?;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(RunnerError::Failed(e.to_string())),
            Err(_) => return Err(RunnerError::Timeout(self.timeout.as_millis() as u64)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let structured_error = parse_structured_error(&stderr);
        debug!(
            program = %self.program,
            status = ?output.status.code(),
            structured = structured_error.is_some(),
            "Snippet finished"
        );
        Ok(RunOutput {
            stdout,
            stderr,
            structured_error,
        })
    }
}

/// Last `SomethingError: message` line of a traceback, with the last
/// reported line number before it.
pub fn parse_structured_error(stderr: &str) -> Option<StructuredError> {
    let caps = ERROR_LINE_RE.captures_iter(stderr).last()?;
    let whole = caps.get(0)?;
    let line = LOCATION_RE
        .captures_iter(&stderr[..whole.start()])
        .last()
        .and_then(|c| c[1].parse().ok());
    Some(StructuredError {
        kind: caps[1].to_string(),
        message: caps[2].trim().to_string(),
        line,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACEBACK: &str = "Traceback (most recent call last):\n  File \"<stdin>\", line 3, in <module>\n  File \"<stdin>\", line 2, in step\nZeroDivisionError: float division by zero\n";

    #[test]
    fn test_parse_python_traceback() {
        let err = parse_structured_error(TRACEBACK).unwrap();
        assert_eq!(err.kind, "ZeroDivisionError");
        assert_eq!(err.message, "float division by zero");
        assert_eq!(err.line, Some(2));
    }

    #[test]
    fn test_warnings_are_not_errors() {
        assert!(parse_structured_error("RuntimeWarning: overflow encountered").is_none());
        assert!(parse_structured_error("").is_none());
    }

    #[test]
    fn test_from_settings_requires_program() {
        assert!(CommandRunner::from_settings(&RunnerSettings::default()).is_none());
        let settings = RunnerSettings {
            program: Some("python3".into()),
            ..Default::default()
        };
        let runner = CommandRunner::from_settings(&settings).unwrap();
        assert_eq!(runner.args, vec!["-"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_snippet_round_trip() {
        let runner = CommandRunner::new("sh");
        let out = runner
            .run("echo hi\necho 'ValueError: bad mass' >&2\n")
            .await
            .unwrap();
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.structured_error.unwrap().kind, "ValueError");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_snippet_times_out() {
        let runner = CommandRunner::new("sh").timeout(Duration::from_millis(200));
        let err = runner.run("sleep 5\n").await.unwrap_err();
        assert_eq!(err, RunnerError::Timeout(200));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let runner = CommandRunner::new("definitely-not-an-interpreter-7f3a");
        let err = runner.run("x = 1").await.unwrap_err();
        assert!(matches!(err, RunnerError::Unavailable(_)));
    }
}
