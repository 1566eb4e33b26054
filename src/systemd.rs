use std::io;
use std::process::{Command, ExitStatus};
use thiserror::Error;
use tracing::debug;

/// How a start/stop interacts with jobs already queued for the unit;
/// the engine always uses `fail` so it never cancels work in flight
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobMode {
    Fail,
}

impl JobMode {
    fn as_str(&self) -> &'static str {
        match self {
            JobMode::Fail => "fail",
        }
    }
}

/// Activation state of a unit as systemd reports it
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActiveState {
    Active,
    Inactive,
    Unknown,
}

impl ActiveState {
    /// Interpret the output of `systemctl is-active`
    fn parse(output: &str) -> ActiveState {
        match output.trim() {
            "active" => ActiveState::Active,
            "inactive" | "failed" => ActiveState::Inactive,
            _ => ActiveState::Unknown,
        }
    }
}

/// Gateway to the service supervisor, driven through systemctl
#[derive(Clone, Copy, Debug, Default)]
pub struct Systemd;

impl Systemd {
    /// Verify systemd is reachable at all; run once at startup
    pub fn check(&self) -> Result<(), SystemdError> {
        let status = Command::new("systemctl")
            .arg("--version")
            .output()
            .map_err(SystemdError::Spawn)?
            .status;
        if status.success() {
            Ok(())
        } else {
            Err(SystemdError::Unavailable(status))
        }
    }

    /// Enqueue a start without waiting for activation; the waiter holding
    /// the packet polls the unit state itself, and a start that blocked
    /// until active would leave it nothing to observe
    pub fn start(&self, unit: &str, mode: JobMode) -> Result<(), SystemdError> {
        self.job("start", unit, mode, true)
    }

    pub fn stop(&self, unit: &str, mode: JobMode) -> Result<(), SystemdError> {
        self.job("stop", unit, mode, false)
    }

    /// Query activation; the command's exit status encodes the state and
    /// is never an error by itself
    pub fn active_state(&self, unit: &str) -> Result<ActiveState, SystemdError> {
        let output = Command::new("systemctl")
            .args(["is-active", unit])
            .output()
            .map_err(SystemdError::Spawn)?;
        let state = ActiveState::parse(&String::from_utf8_lossy(&output.stdout));
        debug!(unit, ?state, "queried unit state");
        Ok(state)
    }

    fn job(
        &self,
        verb: &'static str,
        unit: &str,
        mode: JobMode,
        no_block: bool,
    ) -> Result<(), SystemdError> {
        let mut command = Command::new("systemctl");
        command.arg(verb);
        if no_block {
            command.arg("--no-block");
        }
        let output = command
            .args(["--job-mode", mode.as_str(), unit])
            .output()
            .map_err(SystemdError::Spawn)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SystemdError::Job {
                verb,
                unit: unit.to_owned(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum SystemdError {
    #[error("failed to run systemctl: {0}")]
    Spawn(io::Error),
    #[error("systemctl is unusable ({0})")]
    Unavailable(ExitStatus),
    #[error("systemctl {verb} {unit} failed ({status}): {stderr}")]
    Job {
        verb: &'static str,
        unit: String,
        status: ExitStatus,
        stderr: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_is_active_output() {
        assert_eq!(ActiveState::parse("active\n"), ActiveState::Active);
        assert_eq!(ActiveState::parse("inactive\n"), ActiveState::Inactive);
        assert_eq!(ActiveState::parse("failed\n"), ActiveState::Inactive);
        assert_eq!(ActiveState::parse("activating\n"), ActiveState::Unknown);
        assert_eq!(ActiveState::parse(""), ActiveState::Unknown);
    }
}
