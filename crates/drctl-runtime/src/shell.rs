use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

use drctl_core::config::{ExecutorConfig, VcenterConfig, secret_from_env};
use drctl_core::{DrError, Result};

use crate::script::{ENV_VI_PASSWORD, ENV_VI_SERVER, ENV_VI_USER, Script};

/// Captured result of one script run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs rendered scripts out of process.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run `script` to completion and capture everything it wrote. Only
    /// spawn failures and timeouts are errors here; the exit code is
    /// reported as-is.
    async fn run(&self, script: &Script) -> Result<ScriptOutput>;

    /// Run `script` and return its stdout, mapping a non-zero exit to
    /// [`DrError::NonZeroExit`] with the captured stderr.
    async fn execute(&self, script: &Script) -> Result<String> {
        let output = self.run(script).await?;
        if output.exit_code != 0 {
            let stderr = output.stderr.trim();
            return Err(DrError::NonZeroExit {
                operation: script.operation.to_string(),
                code: output.exit_code,
                stderr: if stderr.is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    stderr.to_string()
                },
            });
        }
        Ok(output.stdout)
    }
}

/// vCenter login handed to the child through its environment.
#[derive(Debug, Clone)]
pub struct ViCredentials {
    pub server: String,
    pub user: String,
    /// Name of the variable holding the password in drctl's own environment.
    pub password_env: String,
}

impl From<&VcenterConfig> for ViCredentials {
    fn from(vc: &VcenterConfig) -> Self {
        Self {
            server: vc.server.clone(),
            user: vc.username.clone(),
            password_env: vc.password_env.clone(),
        }
    }
}

/// Runs scripts with PowerShell, one non-interactive process per script.
#[derive(Debug, Clone)]
pub struct PowerShell {
    interpreter: String,
    timeout: Duration,
    credentials: ViCredentials,
}

impl PowerShell {
    pub fn new(interpreter: &str, timeout: Duration, credentials: ViCredentials) -> Self {
        Self {
            interpreter: interpreter.to_string(),
            timeout,
            credentials,
        }
    }

    pub fn from_config(executor: &ExecutorConfig, vcenter: &VcenterConfig) -> Self {
        Self::new(
            &executor.interpreter,
            Duration::from_secs(executor.timeout_secs),
            ViCredentials::from(vcenter),
        )
    }

    /// Resolve the interpreter on PATH (or as a path).
    fn resolve(&self) -> Result<PathBuf> {
        which::which(&self.interpreter).map_err(|e| DrError::SpawnFailure {
            interpreter: self.interpreter.clone(),
            reason: e.to_string(),
        })
    }

    fn spawn_error(&self, reason: impl std::fmt::Display) -> DrError {
        DrError::SpawnFailure {
            interpreter: self.interpreter.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ScriptRunner for PowerShell {
    async fn run(&self, script: &Script) -> Result<ScriptOutput> {
        let interpreter = self.resolve()?;
        let password = secret_from_env(&self.credentials.password_env)?;

        // The script file must outlive the child.
        let mut file = tempfile::Builder::new()
            .prefix("drctl-")
            .suffix(".ps1")
            .tempfile()
            .map_err(|e| self.spawn_error(format!("failed to stage script: {}", e)))?;
        file.write_all(script.text.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| self.spawn_error(format!("failed to stage script: {}", e)))?;

        let started = Instant::now();
        debug!(
            operation = script.operation,
            interpreter = %interpreter.display(),
            "Running script"
        );

        let child = Command::new(&interpreter)
            .args([
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-File",
            ])
            .arg(file.path())
            .env(ENV_VI_SERVER, &self.credentials.server)
            .env(ENV_VI_USER, &self.credentials.user)
            .env(ENV_VI_PASSWORD, password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| self.spawn_error(e))?,
            Err(_) => {
                warn!(
                    operation = script.operation,
                    timeout_secs = self.timeout.as_secs(),
                    "Script timed out, killed"
                );
                return Err(DrError::TimedOut {
                    operation: script.operation.to_string(),
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let result = ScriptOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        info!(
            operation = script.operation,
            exit_code = result.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Script finished"
        );
        trace!(
            operation = script.operation,
            stdout = %result.stdout,
            stderr = %result.stderr,
            "Script output"
        );

        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::script::{Operation, build_script};
    use std::os::unix::fs::PermissionsExt;

    const PASSWORD_VAR: &str = "DRCTL_SHELL_TEST_PASSWORD";

    /// Write an executable stand-in for pwsh. It receives the same argv:
    /// `-NoProfile -NonInteractive -ExecutionPolicy Bypass -File <path>`.
    fn fake_interpreter(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("fake-pwsh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn runner(interpreter: &str, timeout: Duration) -> PowerShell {
        // SAFETY: tests in this module share one fixed value.
        unsafe { std::env::set_var(PASSWORD_VAR, "s3cret") };
        PowerShell::new(
            interpreter,
            timeout,
            ViCredentials {
                server: "vcenter01".to_string(),
                user: "administrator".to_string(),
                password_env: PASSWORD_VAR.to_string(),
            },
        )
    }

    fn power_on() -> Script {
        build_script(&Operation::PowerOn {
            vm_name: "VM-1".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_captures_stdout_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let pwsh = fake_interpreter(
            &dir,
            r#"echo "connected to $DRCTL_VI_SERVER"
test -f "$6" && head -1 "$6"
echo "{\"user\":\"$DRCTL_VI_USER\",\"password\":\"$DRCTL_VI_PASSWORD\"}""#,
        );
        let out = runner(&pwsh, Duration::from_secs(10))
            .run(&power_on())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("connected to vcenter01"));
        assert!(out.stdout.contains("# drctl: power_on"));
        assert!(out.stdout.contains("\"password\":\"s3cret\""));
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let pwsh = fake_interpreter(&dir, "echo 'VM VM-1 not found' >&2\nexit 3");
        let err = runner(&pwsh, Duration::from_secs(10))
            .execute(&power_on())
            .await
            .unwrap_err();
        match err {
            DrError::NonZeroExit {
                operation,
                code,
                stderr,
            } => {
                assert_eq!(operation, "power_on");
                assert_eq!(code, 3);
                assert_eq!(stderr, "VM VM-1 not found");
            }
            other => panic!("expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hung_script_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let pwsh = fake_interpreter(&dir, "sleep 30");
        let err = runner(&pwsh, Duration::from_millis(200))
            .run(&power_on())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timed_out");
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_failure() {
        let err = runner("drctl-no-such-pwsh", Duration::from_secs(1))
            .run(&power_on())
            .await
            .unwrap_err();
        assert!(matches!(err, DrError::SpawnFailure { .. }));
    }
}
