//! External formatting step for canonicalization overrides.
//!
//! The formatter receives the raw artifact on stdin and must write the
//! formatted artifact to stdout. It runs under a timeout and observes the run's
//! cancellation token; on either, the child process is killed.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::{Builder, Handle};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::DurationSpec;
use crate::error::FormatterError;

/// Byte-to-byte formatting capability.
pub trait Formattable: Send + Sync {
    fn name(&self) -> &str;

    fn format(&self, input: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, FormatterError>;
}

/// What to do when the formatter fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep the unformatted bytes and log a warning.
    #[default]
    Warn,
    /// Fail the target.
    Error,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatterConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides `limits.formatter_timeout`.
    #[serde(default)]
    pub timeout: Option<DurationSpec>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone)]
pub struct ExternalFormatter {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalFormatter {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &FormatterConfig, default_timeout: Duration) -> Self {
        Self::new(
            config.command.clone(),
            config.args.clone(),
            config
                .timeout
                .map(|t| t.as_duration())
                .unwrap_or(default_timeout),
        )
    }

    fn spawn_error(&self, err: impl ToString) -> FormatterError {
        FormatterError::Spawn {
            command: self.command.clone(),
            message: err.to_string(),
        }
    }

    /// Runs the child to completion. Dropping the future kills it.
    async fn run(&self, input: &[u8], cancel: &CancellationToken) -> Result<Output, FormatterError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let mut stdin = child.stdin.take().ok_or_else(|| self.spawn_error("stdin unavailable"))?;
        let payload = input.to_vec();
        let feed = async move {
            // A formatter may exit before reading all of its input.
            let _ = stdin.write_all(&payload).await;
        };
        let finished = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FormatterError::Cancelled {
                command: self.command.clone(),
            }),
            result = time::timeout(self.timeout, finished) => match result {
                Ok(output) => output.map_err(|e| self.spawn_error(e)),
                Err(_) => Err(FormatterError::Timeout {
                    command: self.command.clone(),
                    bound: self.timeout,
                }),
            },
        }
    }
}

/// Drives `future` from synchronous pipeline code. Inside the runtime this
/// must be a blocking thread (`spawn_blocking`); outside it a private
/// current-thread runtime is used.
fn block_on<F: Future>(future: F) -> std::io::Result<F::Output> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => Ok(Builder::new_current_thread().enable_all().build()?.block_on(future)),
    }
}

impl Formattable for ExternalFormatter {
    fn name(&self) -> &str {
        &self.command
    }

    fn format(&self, input: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, FormatterError> {
        let started = Instant::now();
        let output = block_on(self.run(input, cancel)).map_err(|e| self.spawn_error(e))??;

        if !output.status.success() {
            return Err(FormatterError::Failed {
                command: self.command.clone(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(
            formatter = %self.command,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "formatter finished"
        );
        Ok(output.stdout)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sh(script: &str, timeout: Duration) -> ExternalFormatter {
        ExternalFormatter::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[test]
    fn pipes_input_through_command() {
        let fmt = sh("tr a-z A-Z", Duration::from_secs(5));
        let out = fmt.format(b"hello\n", &CancellationToken::new()).unwrap();
        assert_eq!(out, b"HELLO\n");
    }

    #[test]
    fn large_input_does_not_deadlock_on_pipes() {
        let input = "abcdefgh\n".repeat(128 * 1024);
        let fmt = sh("cat", Duration::from_secs(10));
        let out = fmt.format(input.as_bytes(), &CancellationToken::new()).unwrap();
        assert_eq!(out.len(), input.len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_on_blocking_threads_inside_the_runtime() {
        let fmt = sh("tr a-z A-Z", Duration::from_secs(5));
        let out = tokio::task::spawn_blocking(move || fmt.format(b"abc", &CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, b"ABC");
    }

    #[test]
    fn non_zero_exit_is_reported_with_stderr() {
        let fmt = sh("echo broken >&2; exit 3", Duration::from_secs(5));
        let err = fmt.format(b"x", &CancellationToken::new()).unwrap_err();
        assert_matches!(err, FormatterError::Failed { status: Some(3), ref stderr, .. } if stderr == "broken");
    }

    #[test]
    fn slow_formatter_is_killed_at_timeout() {
        let fmt = sh("sleep 5", Duration::from_millis(100));
        let started = Instant::now();
        let err = fmt.format(b"", &CancellationToken::new()).unwrap_err();
        assert_matches!(err, FormatterError::Timeout { .. });
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn cancellation_kills_formatter() {
        let fmt = sh("sleep 5", Duration::from_secs(30));
        let token = CancellationToken::new();
        token.cancel();
        let err = fmt.format(b"", &token).unwrap_err();
        assert_matches!(err, FormatterError::Cancelled { .. });
    }

    #[test]
    fn missing_binary_fails_to_spawn() {
        let fmt = ExternalFormatter::new("definitely-not-a-formatter-binary", vec![], Duration::from_secs(1));
        let err = fmt.format(b"", &CancellationToken::new()).unwrap_err();
        assert_matches!(err, FormatterError::Spawn { .. });
    }
}
