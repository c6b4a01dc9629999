//! QF-010/011: Shell transports — local and SSH execution.
//!
//! A [`Shell`] runs one bash script to completion and reports its exit code
//! and captured output. Scripts are piped to stdin. Children are supervised so
//! that a timeout or an interrupt kills the whole process group.

pub mod local;
pub mod signal;
pub mod ssh;

use crate::core::config::ParameterMap;
use std::io::{Read, Write};
use std::path::Path;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Output from executing a script.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Shared interrupt flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Limits applied while a script runs.
#[derive(Debug, Clone, Default)]
pub struct ExecControl {
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
}

/// Why a script did not produce an exit status.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{0}")]
    Spawn(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Io(String),
}

/// Something that can run a bash script.
pub trait Shell {
    fn exec(&self, script: &str, cwd: &Path, ctl: &ExecControl) -> Result<ExecOutput, TransportError>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Pick the shell from configuration: `runner_host` selects SSH, otherwise local.
pub fn from_params(params: &ParameterMap) -> Box<dyn Shell> {
    match params.get_str("runner_host").filter(|h| !h.is_empty()) {
        Some(host) => Box::new(ssh::SshShell {
            host: host.to_string(),
            user: params.get_str("runner_user").map(String::from),
            ssh_key: params.get_str("runner_ssh_key").map(String::from),
        }),
        None => Box::new(local::LocalShell),
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Kill the child's process group (it was spawned as a group leader).
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill")
            .args(["-KILL", "--", &format!("-{}", child.id())])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Feed `script` to a spawned child and wait for it under `ctl`.
pub(crate) fn supervise(
    mut child: Child,
    script: &str,
    ctl: &ExecControl,
) -> Result<ExecOutput, TransportError> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(script.as_bytes()) {
            terminate(&mut child);
            return Err(TransportError::Io(format!("stdin write error: {}", e)));
        }
    }

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if ctl.cancel.is_cancelled() {
                    terminate(&mut child);
                    return Err(TransportError::Cancelled);
                }
                if let Some(limit) = ctl.timeout {
                    if started.elapsed() >= limit {
                        terminate(&mut child);
                        return Err(TransportError::TimedOut(limit));
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                terminate(&mut child);
                return Err(TransportError::Io(format!("wait error: {}", e)));
            }
        }
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_exec_output_success() {
        let ok = ExecOutput { exit_code: 0, stdout: "ok".into(), stderr: "".into() };
        assert!(ok.success());
        let fail = ExecOutput { exit_code: 1, stdout: "".into(), stderr: "err".into() };
        assert!(!fail.success());
        let sig = ExecOutput { exit_code: -1, stdout: "".into(), stderr: "killed".into() };
        assert!(!sig.success());
    }

    #[test]
    fn test_transport_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_transport_from_params_local_by_default() {
        let shell = from_params(&ParameterMap::default());
        assert_eq!(shell.describe(), "local bash");
    }

    #[test]
    fn test_transport_from_params_ssh() {
        let params = ParameterMap::from_pairs([("runner_host", "hpc01"), ("runner_user", "qtl")]);
        let shell = from_params(&params);
        assert_eq!(shell.describe(), "ssh qtl@hpc01");
    }

    #[test]
    fn test_transport_empty_host_is_local() {
        let params = ParameterMap::from_pairs([("runner_host", "")]);
        assert_eq!(from_params(&params).describe(), "local bash");
    }
}
