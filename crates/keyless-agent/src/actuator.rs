//! Lock output drivers.
//!
//! - [`CommandActuator`] drives a digital output through the gateway's I/O
//!   tool, which reads commands on stdin.
//! - [`DryRunActuator`] only logs what it would do.

use std::process::Stdio;

use async_trait::async_trait;
use keyless_core::{ActuatorConfig, ActuatorError, ActuatorKind, LockActuator};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Build the driver selected by `config.kind`.
#[must_use]
pub fn from_config(config: &ActuatorConfig) -> Box<dyn LockActuator> {
    match config.kind {
        ActuatorKind::Command => Box::new(CommandActuator::new(config.clone())),
        ActuatorKind::DryRun => Box::new(DryRunActuator),
    }
}

/// Drives the lock output by running the I/O tool once per write.
#[derive(Debug, Clone)]
pub struct CommandActuator {
    config: ActuatorConfig,
}

impl CommandActuator {
    /// Create a driver for the output described by `config`.
    #[must_use]
    pub const fn new(config: ActuatorConfig) -> Self {
        Self { config }
    }

    /// Commands written to the tool's stdin.
    #[must_use]
    pub fn script(&self, locked: bool) -> String {
        let level = if locked {
            self.config.locked_level
        } else {
            self.config.unlocked_level
        };
        format!("IOSet DIGOUT {} {level}\nEXIT\n", self.config.output)
    }

    async fn invoke(&self, script: &str) -> Result<(), ActuatorError> {
        let program = &self.config.program;
        let spawn_error = |e: std::io::Error| ActuatorError::Spawn {
            program: program.clone(),
            message: e.to_string(),
        };

        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        // The exit status below decides success; a tool that quits early
        // closes the pipe.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(script.as_bytes()).await {
                debug!(program = %program, error = %e, "I/O tool closed stdin");
            }
        }

        let output = tokio::time::timeout(self.config.timeout(), child.wait_with_output())
            .await
            .map_err(|_| ActuatorError::Timeout {
                program: program.clone(),
                timeout_ms: self.config.timeout_ms,
            })?
            .map_err(spawn_error)?;

        if output.status.success() {
            Ok(())
        } else {
            debug!(
                program = %program,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "I/O tool failed"
            );
            Err(ActuatorError::ExitStatus {
                program: program.clone(),
                status: output.status.to_string(),
            })
        }
    }
}

#[async_trait]
impl LockActuator for CommandActuator {
    async fn set_locked(&self, locked: bool) -> Result<(), ActuatorError> {
        let script = self.script(locked);
        debug!(output = self.config.output, locked, "Driving lock output");
        self.invoke(&script).await
    }
}

/// Logs lock commands without touching any hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunActuator;

#[async_trait]
impl LockActuator for DryRunActuator {
    async fn set_locked(&self, locked: bool) -> Result<(), ActuatorError> {
        info!(locked, "Dry run: lock output not driven");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(program: &str) -> ActuatorConfig {
        ActuatorConfig {
            program: program.to_string(),
            ..ActuatorConfig::default()
        }
    }

    #[test]
    fn test_script_uses_configured_levels() {
        let actuator = CommandActuator::new(ActuatorConfig::default());
        assert_eq!(actuator.script(true), "IOSet DIGOUT 6 1\nEXIT\n");
        assert_eq!(actuator.script(false), "IOSet DIGOUT 6 0\nEXIT\n");

        let inverted = CommandActuator::new(ActuatorConfig {
            output: 2,
            locked_level: 0,
            unlocked_level: 1,
            ..ActuatorConfig::default()
        });
        assert_eq!(inverted.script(true), "IOSet DIGOUT 2 0\nEXIT\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let actuator = CommandActuator::new(config("/nonexistent/keyless-io-tool"));
        let err = actuator.set_locked(true).await.unwrap_err();
        assert!(matches!(err, ActuatorError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_reads_script_from_stdin() {
        let actuator = CommandActuator::new(config("cat"));
        actuator.set_locked(false).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_tool_reports_exit_status() {
        let actuator = CommandActuator::new(config("false"));
        let err = actuator.set_locked(true).await.unwrap_err();
        assert!(matches!(err, ActuatorError::ExitStatus { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_always_succeeds() {
        let actuator = from_config(&ActuatorConfig {
            kind: ActuatorKind::DryRun,
            ..ActuatorConfig::default()
        });
        assert!(actuator.set_locked(true).await.is_ok());
        assert!(actuator.set_locked(false).await.is_ok());
    }
}
