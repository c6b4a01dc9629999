//! QF-010: Local execution transport.

use super::{supervise, ExecControl, ExecOutput, Shell, TransportError};
use std::path::Path;
use std::process::{Command, Stdio};

/// Runs scripts with the local `bash`; stage scripts need `set -o pipefail`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalShell;

impl Shell for LocalShell {
    fn exec(&self, script: &str, cwd: &Path, ctl: &ExecControl) -> Result<ExecOutput, TransportError> {
        let mut cmd = Command::new("bash");
        cmd.current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("failed to spawn bash in {}: {}", cwd.display(), e)))?;
        supervise(child, script, ctl)
    }

    fn describe(&self) -> String {
        "local bash".to_string()
    }
}

/// Execute a script in the current directory with no limits.
pub fn exec_local(script: &str) -> Result<ExecOutput, TransportError> {
    LocalShell.exec(script, Path::new("."), &ExecControl::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_qf010_local_echo() {
        let out = exec_local("echo hello").unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_qf010_local_failure() {
        let out = exec_local("exit 42").unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 42);
    }

    #[test]
    fn test_qf010_local_multiline() {
        let out = exec_local("echo line1\necho line2").unwrap();
        let lines: Vec<_> = out.stdout.lines().collect();
        assert_eq!(lines, vec!["line1", "line2"]);
    }

    #[test]
    fn test_qf010_local_stderr() {
        let out = exec_local("echo err >&2").unwrap();
        assert!(out.success());
        assert!(out.stderr.contains("err"));
    }

    #[test]
    fn test_qf010_local_pipefail() {
        let out = exec_local("set -o pipefail\nfalse | true").unwrap();
        assert!(!out.success(), "pipefail should catch false in pipeline");
    }

    #[test]
    fn test_qf010_local_runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let out = LocalShell
            .exec("pwd", dir.path(), &ExecControl::default())
            .unwrap();
        let reported = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_qf010_local_missing_cwd_is_spawn_error() {
        let err = LocalShell
            .exec("true", Path::new("/nonexistent/qtlflow/dir"), &ExecControl::default())
            .unwrap_err();
        assert!(matches!(err, TransportError::Spawn(_)));
    }

    #[test]
    fn test_qf010_local_timeout_kills_child() {
        let ctl = ExecControl {
            timeout: Some(Duration::from_millis(200)),
            ..ExecControl::default()
        };
        let started = Instant::now();
        let err = LocalShell.exec("sleep 10", Path::new("."), &ctl).unwrap_err();
        assert!(matches!(err, TransportError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_qf010_local_cancelled_before_finish() {
        let ctl = ExecControl::default();
        let token = ctl.cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            token.cancel();
        });
        let err = LocalShell.exec("sleep 10", Path::new("."), &ctl).unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, TransportError::Cancelled));
    }
}
