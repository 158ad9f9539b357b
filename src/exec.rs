use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::GrimError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Outcome of one external process invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub command: Vec<String>,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: f64,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.returncode == 0 && !self.timed_out
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// Short diagnostic for logs: stderr, else stdout, else the exit code.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.lines().last().unwrap_or(stdout).to_string();
        }
        format!("exit code {}", self.returncode)
    }

    fn launch_failure(command: &[String], message: String, started: Instant) -> Self {
        Self {
            command: command.to_vec(),
            returncode: -1,
            stdout: String::new(),
            stderr: message,
            timed_out: false,
            elapsed: started.elapsed().as_secs_f64(),
        }
    }
}

pub trait ProcessRunner: Send + Sync {
    fn execute(
        &self,
        command: &[String],
        working_dir: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<ProcessResult, GrimError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn execute(
        &self,
        command: &[String],
        working_dir: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<ProcessResult, GrimError> {
        execute(command, working_dir, timeout)
    }
}

/// Runs `command` to completion or until `timeout` elapses.
///
/// Only an empty argument vector is an error. Non-zero exits, timeouts,
/// missing executables and launch failures are all reported through the
/// returned [`ProcessResult`] with `returncode == -1` for the latter three.
pub fn execute(
    command: &[String],
    working_dir: Option<&Path>,
    timeout: Option<Duration>,
) -> Result<ProcessResult, GrimError> {
    let Some((program, args)) = command.split_first() else {
        return Err(GrimError::EmptyCommand);
    };
    if program.trim().is_empty() {
        return Err(GrimError::EmptyCommand);
    }

    debug!(command = %command.join(" "), "executing command");
    if let Some(dir) = working_dir {
        debug!(cwd = %dir.display(), "working directory");
    }
    if let Some(limit) = timeout {
        debug!(seconds = limit.as_secs(), "timeout");
    }

    let started = Instant::now();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let message = format!("Executable not found: {program}");
            error!("{message}");
            return Ok(ProcessResult::launch_failure(command, message, started));
        }
        Err(err) => {
            let message = format!("Unexpected error executing command: {err}");
            error!("{message}");
            return Ok(ProcessResult::launch_failure(command, message, started));
        }
    };

    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                let message = format!("Unexpected error executing command: {err}");
                error!("{message}");
                return Ok(ProcessResult::launch_failure(command, message, started));
            }
        }

        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                // Readers are detached: grandchildren may keep the pipes open.
                let message = format!("Command timed out after {} seconds", limit.as_secs());
                error!("{message}");
                return Ok(ProcessResult {
                    command: command.to_vec(),
                    returncode: -1,
                    stdout: String::new(),
                    stderr: message,
                    timed_out: true,
                    elapsed: started.elapsed().as_secs_f64(),
                });
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader.map(join_reader).unwrap_or_default();
    let stderr = stderr_reader.map(join_reader).unwrap_or_default();
    let result = ProcessResult {
        command: command.to_vec(),
        returncode: status.code().unwrap_or(-1),
        stdout,
        stderr,
        timed_out: false,
        elapsed: started.elapsed().as_secs_f64(),
    };

    if result.success() {
        debug!(elapsed = result.elapsed, "command completed");
    } else {
        warn!(code = result.returncode, "command failed");
        if !result.stderr.trim().is_empty() {
            debug!(stderr = %result.stderr.trim(), "command stderr");
        }
    }
    Ok(result)
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = source.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolStatus {
    Available {
        path: PathBuf,
        version: Option<String>,
    },
    Missing,
}

impl ToolStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, ToolStatus::Available { .. })
    }
}

/// Presence check for an external tool. The check command's exit code is ignored:
/// some programs (MOPAC) exit non-zero when called without input.
pub fn check_executable(
    runner: &dyn ProcessRunner,
    executable: &str,
    check_args: &[&str],
    timeout: Duration,
) -> ToolStatus {
    let Some(path) = locate_executable(executable) else {
        debug!(executable, "executable not found in PATH");
        return ToolStatus::Missing;
    };

    let mut command = vec![path.to_string_lossy().to_string()];
    command.extend(check_args.iter().map(|arg| arg.to_string()));
    let version = match runner.execute(&command, None, Some(timeout)) {
        Ok(result) if result.returncode == -1 && !result.timed_out => {
            warn!(executable, reason = %result.stderr, "executable could not be started");
            return ToolStatus::Missing;
        }
        Ok(result) => first_line(&result.stdout).or_else(|| first_line(&result.stderr)),
        Err(_) => None,
    };
    debug!(executable, path = %path.display(), "executable available");
    ToolStatus::Available { path, version }
}

pub fn locate_executable(executable: &str) -> Option<PathBuf> {
    let candidate = Path::new(executable);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    find_in_path(executable)
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_requires_zero_and_no_timeout() {
        let mut result = ProcessResult {
            command: vec!["true".to_string()],
            returncode: 0,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            elapsed: 0.0,
        };
        assert!(result.success());
        result.timed_out = true;
        assert!(!result.success());
        result.timed_out = false;
        result.returncode = 2;
        assert!(!result.success());
        assert_eq!(result.diagnostic(), "exit code 2");
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(execute(&[], None, None), Err(GrimError::EmptyCommand)));
        assert!(matches!(
            execute(&[String::new()], None, None),
            Err(GrimError::EmptyCommand)
        ));
    }
}
