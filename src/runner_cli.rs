use run_script::ScriptOptions;
use thiserror::Error;
use tracing::{error, trace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CliError {
    #[error("{0} is not supported")]
    UnsupportedPlatform(String),
    #[error("failed to execute {cmd:?}: {reason}")]
    Spawn { cmd: String, reason: String },
    #[error("{cmd:?} exited with code {code}: {stderr}")]
    ExitStatus {
        cmd: String,
        code: i32,
        stderr: String,
    },
}

/// Read-only access to the external tools (fdesetup, kmutil, diskutil...).
/// Implementations block until the command completes.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &str) -> Result<String, CliError>;
}

/// Runs commands through the system shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, cmd: &str) -> Result<String, CliError> {
        run_cli(cmd)
    }
}

// Blocking, no timeout and no retry: callers wrap their own cancellation
pub fn run_cli(cmd: &str) -> Result<String, CliError> {
    // Verify platform support
    check_platform_support()?;

    let (code, stdout, stderr) = execute_unix_command(cmd)?;

    trace!(
        "Execution results for {:?} - code : {:?} - stdout : {:?} - stderr : {:?}",
        cmd,
        code,
        stdout,
        stderr
    );

    if execution_failed(code) {
        Err(CliError::ExitStatus {
            cmd: cmd.to_string(),
            code,
            stderr: stderr.trim().to_string(),
        })
    } else {
        Ok(stdout)
    }
}

// Any non-zero exit is inconclusive, even with an empty stderr
fn execution_failed(code: i32) -> bool {
    code != 0
}

fn check_platform_support() -> Result<(), CliError> {
    if cfg!(target_os = "windows") {
        error!("Windows is not supported");
        return Err(CliError::UnsupportedPlatform("Windows".to_string()));
    }
    Ok(())
}

fn execute_unix_command(cmd: &str) -> Result<(i32, String, String), CliError> {
    let options = ScriptOptions::new();
    let args = vec![];

    trace!("Executing shell command: {}", cmd);
    run_script::run(cmd, &args, &options).map_err(|e| {
        error!("Error executing {:?} : {:?}", cmd, e);
        CliError::Spawn {
            cmd: cmd.to_string(),
            reason: e.to_string(),
        }
    })
}
