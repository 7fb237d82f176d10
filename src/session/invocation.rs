//! Remote command bookkeeping.

use std::fmt;

use serde::Serialize;

/// Progress of one remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    /// Output may still arrive
    Running,
    /// Exit code received
    Completed,
    /// Polling failed; output is incomplete
    Failed,
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvocationState::Running => "running",
            InvocationState::Completed => "completed",
            InvocationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A command started in a shell, with the output gathered so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub(crate) command_id: String,
    pub(crate) command: String,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) state: InvocationState,
}

impl CommandInvocation {
    pub(crate) fn new(command_id: String, command: String) -> Self {
        Self {
            command_id,
            command,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            state: InvocationState::Running,
        }
    }

    /// Server-assigned command id.
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// Command line as issued.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Accumulated stdout.
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    /// Accumulated stderr.
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Exit code, once completed.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == InvocationState::Running
    }

    /// Mark failed and drop partial output.
    pub(crate) fn fail(&mut self, discard_output: bool) {
        self.state = InvocationState::Failed;
        if discard_output {
            self.stdout.clear();
            self.stderr.clear();
        }
    }
}

/// Output returned by one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChunk {
    /// New stdout bytes
    pub stdout: Vec<u8>,
    /// New stderr bytes
    pub stderr: Vec<u8>,
    /// Whether the command finished with this chunk
    pub done: bool,
}

impl OutputChunk {
    /// Nothing new arrived.
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty() && !self.done
    }
}

/// Final result of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// Exit code
    pub exit_code: i32,
    /// Decoded stdout (lossy UTF-8)
    pub stdout: String,
    /// Decoded stderr (lossy UTF-8)
    pub stderr: String,
    /// `exit_code == 0`
    pub success: bool,
}

impl CommandOutput {
    pub(crate) fn from_invocation(invocation: &CommandInvocation) -> Self {
        let exit_code = invocation.exit_code.unwrap_or_default();
        Self {
            exit_code,
            stdout: String::from_utf8_lossy(&invocation.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&invocation.stderr).into_owned(),
            success: exit_code == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_discards_partial_output() {
        let mut invocation = CommandInvocation::new("C".into(), "whoami".into());
        invocation.stdout.extend_from_slice(b"part");
        invocation.fail(true);
        assert_eq!(invocation.state(), InvocationState::Failed);
        assert!(invocation.stdout().is_empty());
    }

    #[test]
    fn test_command_output() {
        let mut invocation = CommandInvocation::new("C".into(), "cmd".into());
        invocation.stdout.extend_from_slice(b"ok\r\n");
        invocation.exit_code = Some(3);
        let output = CommandOutput::from_invocation(&invocation);
        assert_eq!(output.stdout, "ok\r\n");
        assert!(!output.success);
    }
}
