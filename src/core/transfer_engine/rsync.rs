use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use super::{ProbeResult, RemoteBackend, RemoteOptions, TransferFile, run_remote};
use crate::adapters::{CommandOutput, CommandSpec, SharedRunner};
use crate::core::models::{AuthInput, Endpoint, NetworkLocation};
use crate::error::{Result, SyncError};

// Regex: "  12,345,678   45%  10.2MB/s ..."
static PROGRESS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([\d,]+)\s+(\d+)%").expect("static regex"));

/// ssh exits 255 on its own errors; these mark a credential problem rather
/// than a network one.
const AUTH_MARKERS: &[&str] = &[
    "Permission denied",
    "Authentication failed",
    "Too many authentication failures",
    "Host key verification failed",
];

/// sshpass exit code for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// Printed by the size query when the remote file does not exist.
pub(crate) const ABSENT: &str = "__absent__";

/// SSH remote reached with `ssh` for commands and `rsync` for data.
///
/// Password auth wraps both in `sshpass -e` with the password in `SSHPASS`.
pub struct SshBackend {
    destination: String,
    port: u16,
    key_path: Option<PathBuf>,
    password: Option<String>,
    runner: SharedRunner,
    options: RemoteOptions,
}

impl SshBackend {
    pub fn new(
        location: &NetworkLocation,
        auth: &AuthInput,
        runner: SharedRunner,
        options: RemoteOptions,
    ) -> Self {
        let port = match &location.endpoint {
            Endpoint::Port { port } => *port,
            Endpoint::Share { .. } => 22,
        };
        let (key_path, password) = match auth {
            AuthInput::Key(path) => (Some(path.clone()), None),
            AuthInput::Password(p) => (None, Some(p.clone())),
        };
        Self {
            destination: format!("{}@{}", location.username, location.server),
            port,
            key_path,
            password,
            runner,
            options,
        }
    }

    /// Options shared by ssh and rsync's `-e` transport.
    fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        match &self.key_path {
            Some(key) => {
                opts.extend([
                    "-i".to_string(),
                    key.display().to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                ]);
            }
            None => {
                opts.extend([
                    "-o".to_string(),
                    "PreferredAuthentications=password,keyboard-interactive".to_string(),
                    "-o".to_string(),
                    "NumberOfPasswordPrompts=1".to_string(),
                ]);
            }
        }
        opts
    }

    /// rsync `-e` value. rsync splits it on whitespace but honours quotes.
    fn transport(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.ssh_options().iter().map(|o| sh_quote(o)));
        parts.join(" ")
    }

    /// Wrap `program` in sshpass when authenticating with a password.
    fn base_command(&self, program: &str) -> CommandSpec {
        match &self.password {
            Some(password) => CommandSpec::new("sshpass")
                .args(["-e", program])
                .env("SSHPASS", password.as_str()),
            None => CommandSpec::new(program),
        }
    }

    fn remote_command(&self, command: &str, timeout: std::time::Duration) -> CommandSpec {
        self.base_command("ssh")
            .args(self.ssh_options())
            .arg(&self.destination)
            .arg("--")
            .arg(command)
            .timeout(timeout)
    }

    async fn exec(&self, command: &str, timeout: std::time::Duration) -> Result<CommandOutput> {
        let spec = self.remote_command(command, timeout);
        let out = run_remote(self.runner.as_ref(), &spec, &self.target()).await?;
        if is_auth_failure(&out, self.password.is_some()) {
            return Err(SyncError::AuthFailed {
                target: self.target(),
                detail: out.summary(),
            });
        }
        Ok(out)
    }

    fn unreachable(&self, what: &str, out: &CommandOutput) -> SyncError {
        SyncError::Unreachable {
            target: self.target(),
            detail: format!("{}: {}", what, out.summary()),
        }
    }
}

fn is_auth_failure(out: &CommandOutput, via_sshpass: bool) -> bool {
    if out.is_success() {
        return false;
    }
    if via_sshpass && out.code == Some(SSHPASS_BAD_PASSWORD) {
        return true;
    }
    let text = out.combined();
    AUTH_MARKERS.iter().any(|m| text.contains(m))
}

/// Single-quote for the remote shell.
pub(crate) fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn remote_file(remote_dir: &str, file_name: &str) -> String {
    if remote_dir.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", remote_dir.trim_end_matches('/'), file_name)
    }
}

/// Last `--info=progress2` reading in rsync output: bytes and percent.
pub(crate) fn last_progress(output: &[u8]) -> Option<(u64, u8)> {
    let text = String::from_utf8_lossy(output);
    text.split(['\r', '\n'])
        .filter_map(|line| {
            let caps = PROGRESS_LINE.captures(line)?;
            let bytes: u64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
            let percentage: u8 = caps.get(2)?.as_str().parse().ok()?;
            Some((bytes, percentage))
        })
        .last()
}

#[async_trait]
impl RemoteBackend for SshBackend {
    fn target(&self) -> String {
        format!("{}:{}", self.destination, self.port)
    }

    async fn probe(&self) -> ProbeResult {
        match self.exec("true", self.options.connect_timeout * 2).await {
            Ok(out) if out.is_success() => ProbeResult::Valid,
            Ok(out) => ProbeResult::Unreachable(out.summary()),
            Err(SyncError::AuthFailed { detail, .. }) => ProbeResult::AuthFailed(detail),
            Err(e) => ProbeResult::Unreachable(e.to_string()),
        }
    }

    async fn ensure_dir(&self, remote_dir: &str) -> Result<()> {
        if remote_dir.is_empty() {
            return Ok(());
        }
        let out = self
            .exec(
                &format!("mkdir -p {}", sh_quote(remote_dir)),
                self.options.operation_timeout,
            )
            .await?;
        if !out.is_success() {
            return Err(self.unreachable(&format!("mkdir {}", remote_dir), &out));
        }
        Ok(())
    }

    async fn remote_size(&self, remote_dir: &str, file_name: &str) -> Result<Option<u64>> {
        let path = sh_quote(&remote_file(remote_dir, file_name));
        let command = format!(
            "if [ -f {p} ]; then stat -c %s {p}; else echo {absent}; fi",
            p = path,
            absent = ABSENT
        );
        let out = self.exec(&command, self.options.operation_timeout).await?;
        if !out.is_success() {
            return Err(self.unreachable(&format!("stat {}", file_name), &out));
        }

        let stdout = out.stdout_str();
        let value = stdout.trim();
        if value == ABSENT {
            return Ok(None);
        }
        value
            .parse()
            .map(Some)
            .map_err(|_| self.unreachable(&format!("stat {}", file_name), &out))
    }

    async fn upload(&self, file: &TransferFile, remote_dir: &str) -> Result<()> {
        let name = file.name.clone();
        let transport = self.transport();
        let spec = self
            .base_command("rsync")
            .args(["-a", "--partial", "--protect-args", "--info=progress2"])
            .args(["-e", transport.as_str()])
            .arg(file.path.display().to_string())
            .arg(format!(
                "{}:{}",
                self.destination,
                remote_file(remote_dir, &name)
            ))
            .timeout(self.options.operation_timeout);

        let out = run_remote(self.runner.as_ref(), &spec, &self.target()).await?;
        if is_auth_failure(&out, self.password.is_some()) {
            return Err(SyncError::AuthFailed {
                target: self.target(),
                detail: out.summary(),
            });
        }
        if !out.is_success() {
            return Err(SyncError::UploadFailed {
                artifact: name,
                detail: out.summary(),
            });
        }

        if let Some((bytes, percentage)) = last_progress(&out.stdout) {
            debug!(artifact = %name, bytes, percentage, "rsync finished");
        }
        Ok(())
    }

    async fn prune(&self, remote_dir: &str, keep: &[String]) -> Result<()> {
        if remote_dir.is_empty() || remote_dir == "/" {
            return Ok(());
        }
        let mut command = format!("find {} -maxdepth 1 -type f", sh_quote(remote_dir));
        for name in keep {
            command.push_str(&format!(" ! -name {}", sh_quote(name)));
        }
        command.push_str(" -print -delete");

        let out = self.exec(&command, self.options.operation_timeout).await?;
        if !out.is_success() {
            return Err(self.unreachable(&format!("prune {}", remote_dir), &out));
        }
        let removed = out.stdout_str();
        let removed: Vec<&str> = removed.lines().filter(|l| !l.is_empty()).collect();
        if !removed.is_empty() {
            info!(count = removed.len(), dir = %remote_dir, "Removed stale remote files");
        }
        Ok(())
    }
}
