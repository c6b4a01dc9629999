//! QF-011: SSH execution transport.
//!
//! Runs stages through the system `ssh` client with `bash` on the far side.
//! The stage script travels over stdin, prefixed with a `cd` into the task's
//! working directory, so the remote host must see the same paths.

use super::{supervise, ExecControl, ExecOutput, Shell, TransportError};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Runs scripts on a remote host that shares the pipeline's filesystem.
#[derive(Debug, Clone)]
pub struct SshShell {
    pub host: String,
    pub user: Option<String>,
    pub ssh_key: Option<String>,
}

impl SshShell {
    fn destination(&self) -> String {
        match &self.user {
            Some(user) if !user.is_empty() => format!("{}@{}", user, self.host),
            _ => self.host.clone(),
        }
    }
}

/// Expand a leading `~/` to `$HOME`.
fn expand_home(key: &str) -> String {
    match (key.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home, rest),
        _ => key.to_string(),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// The remote login shell starts in `$HOME`, so relative directories are
/// resolved against the local working directory first.
fn remote_dir(cwd: &Path) -> Result<PathBuf, TransportError> {
    std::path::absolute(cwd)
        .map_err(|e| TransportError::Spawn(format!("cannot resolve {}: {}", cwd.display(), e)))
}

/// Prefix a script so the remote shell starts in `cwd`.
fn remote_script(script: &str, cwd: &Path) -> String {
    format!("cd {} || exit 1\n{}", shell_quote(&cwd.display().to_string()), script)
}

impl Shell for SshShell {
    fn exec(&self, script: &str, cwd: &Path, ctl: &ExecControl) -> Result<ExecOutput, TransportError> {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .args(["-o", "ConnectTimeout=5"])
            .args(["-o", "StrictHostKeyChecking=accept-new"]);

        if let Some(key) = self.ssh_key.as_deref().filter(|k| !k.is_empty()) {
            cmd.args(["-i", &expand_home(key)]);
        }

        cmd.arg(self.destination())
            .arg("bash")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let script = remote_script(script, &remote_dir(cwd)?);
        let child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("failed to spawn ssh to {}: {}", self.host, e)))?;
        supervise(child, &script, ctl)
    }

    fn describe(&self) -> String {
        format!("ssh {}", self.destination())
    }
}
