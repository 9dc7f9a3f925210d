use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{ProbeResult, RemoteBackend, RemoteOptions, TransferFile, run_remote};
use crate::adapters::{CommandOutput, CommandSpec, SharedRunner};
use crate::core::models::{AuthInput, Endpoint, NetworkLocation};
use crate::error::{Result, SyncError};

/// smbclient `ls` line: `  rlog   A   4096  Mon Jan  8 12:00:00 2024`
static LS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s+(?P<name>.+?)\s+(?P<attr>[A-Za-z]*)\s+(?P<size>\d+)\s+\w{3}\s+\w{3}\s+\d+\s+\d{1,2}:\d{2}:\d{2}\s+\d{4}\s*$",
    )
    .expect("static regex")
});

const AUTH_STATUSES: &[&str] = &[
    "NT_STATUS_LOGON_FAILURE",
    "NT_STATUS_ACCESS_DENIED",
    "NT_STATUS_WRONG_PASSWORD",
    "NT_STATUS_ACCOUNT_DISABLED",
    "NT_STATUS_ACCOUNT_LOCKED_OUT",
    "NT_STATUS_PASSWORD_EXPIRED",
];

const NOT_FOUND_STATUSES: &[&str] = &[
    "NT_STATUS_NO_SUCH_FILE",
    "NT_STATUS_OBJECT_NAME_NOT_FOUND",
    "NT_STATUS_OBJECT_PATH_NOT_FOUND",
];

const EXISTS_STATUS: &str = "NT_STATUS_OBJECT_NAME_COLLISION";

/// SMB share access through `smbclient`.
///
/// The password is handed over in the `PASSWD` environment variable so it
/// never shows up in the process list.
pub struct SmbBackend {
    service: String,
    username: String,
    password: Option<String>,
    runner: SharedRunner,
    options: RemoteOptions,
}

impl SmbBackend {
    pub fn new(
        location: &NetworkLocation,
        auth: &AuthInput,
        runner: SharedRunner,
        options: RemoteOptions,
    ) -> Self {
        let share = match &location.endpoint {
            Endpoint::Share { share } => share.clone(),
            Endpoint::Port { .. } => String::new(),
        };
        let password = match auth {
            AuthInput::Password(p) => Some(p.clone()),
            AuthInput::Key(_) => None,
        };
        Self {
            service: format!("//{}/{}", location.server, share),
            username: location.username.clone(),
            password,
            runner,
            options,
        }
    }

    fn command(&self, commands: &str, timeout: std::time::Duration) -> CommandSpec {
        let mut spec = CommandSpec::new("smbclient")
            .arg(&self.service)
            .args(["-U", self.username.as_str()])
            .args(["-c", commands])
            .timeout(timeout);
        match &self.password {
            Some(password) => spec = spec.env("PASSWD", password.as_str()),
            None => spec = spec.arg("-N"),
        }
        spec
    }

    async fn exec(&self, commands: &str, timeout: std::time::Duration) -> Result<CommandOutput> {
        let spec = self.command(commands, timeout);
        let out = run_remote(self.runner.as_ref(), &spec, &self.service).await?;
        if let Some(status) = find_status(&out, AUTH_STATUSES) {
            return Err(SyncError::AuthFailed {
                target: self.service.clone(),
                detail: status.to_string(),
            });
        }
        Ok(out)
    }
}

/// First of `statuses` mentioned in the command's output.
fn find_status<'a>(out: &CommandOutput, statuses: &[&'a str]) -> Option<&'a str> {
    let text = out.combined();
    statuses.iter().copied().find(|s| text.contains(s))
}

fn has_error_status(out: &CommandOutput) -> bool {
    out.combined().contains("NT_STATUS_")
}

/// smbclient takes double-quoted arguments; a quote in a name cannot be
/// expressed.
fn quote(path: &str) -> Result<String> {
    if path.contains('"') {
        return Err(SyncError::InvalidLocation(format!(
            "path contains a double quote: {}",
            path
        )));
    }
    Ok(format!("\"{}\"", path))
}

fn smb_path(remote_dir: &str, file_name: &str) -> String {
    let dir = remote_dir.trim_matches('/');
    if dir.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", dir, file_name)
    }
}

/// Size of `file_name` from smbclient `ls` output.
pub(crate) fn parse_ls_size(output: &str, file_name: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let caps = LS_LINE.captures(line)?;
        if caps.name("name")?.as_str() != file_name {
            return None;
        }
        caps.name("size")?.as_str().parse().ok()
    })
}

#[async_trait]
impl RemoteBackend for SmbBackend {
    fn target(&self) -> String {
        self.service.clone()
    }

    async fn probe(&self) -> ProbeResult {
        match self.exec("ls", self.options.connect_timeout).await {
            Ok(out) if out.is_success() && !has_error_status(&out) => ProbeResult::Valid,
            Ok(out) => ProbeResult::Unreachable(out.summary()),
            Err(SyncError::AuthFailed { detail, .. }) => ProbeResult::AuthFailed(detail),
            Err(e) => ProbeResult::Unreachable(e.to_string()),
        }
    }

    async fn ensure_dir(&self, remote_dir: &str) -> Result<()> {
        let mut prefix = String::new();
        for part in remote_dir.split('/').filter(|p| !p.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);

            let out = self
                .exec(
                    &format!("mkdir {}", quote(&prefix)?),
                    self.options.operation_timeout,
                )
                .await?;
            let text = out.combined();
            if text.contains(EXISTS_STATUS) {
                debug!(dir = %prefix, "Remote directory already exists");
                continue;
            }
            if !out.is_success() || has_error_status(&out) {
                return Err(SyncError::Unreachable {
                    target: self.service.clone(),
                    detail: format!("mkdir {}: {}", prefix, out.summary()),
                });
            }
        }
        Ok(())
    }

    async fn remote_size(&self, remote_dir: &str, file_name: &str) -> Result<Option<u64>> {
        let path = smb_path(remote_dir, file_name);
        let out = self
            .exec(
                &format!("ls {}", quote(&path)?),
                self.options.operation_timeout,
            )
            .await?;

        if find_status(&out, NOT_FOUND_STATUSES).is_some() {
            return Ok(None);
        }
        if !out.is_success() || has_error_status(&out) {
            return Err(SyncError::Unreachable {
                target: self.service.clone(),
                detail: format!("ls {}: {}", path, out.summary()),
            });
        }
        Ok(parse_ls_size(&out.stdout_str(), file_name))
    }

    async fn upload(&self, file: &TransferFile, remote_dir: &str) -> Result<()> {
        let name = file.name.clone();
        let local = file.path.to_string_lossy();
        let dir = remote_dir.trim_matches('/');
        let commands = if dir.is_empty() {
            format!("put {} {}", quote(&local)?, quote(&name)?)
        } else {
            format!(
                "cd {}; put {} {}",
                quote(dir)?,
                quote(&local)?,
                quote(&name)?
            )
        };

        let out = self.exec(&commands, self.options.operation_timeout).await?;
        if !out.is_success() || has_error_status(&out) {
            return Err(SyncError::UploadFailed {
                artifact: name,
                detail: out.summary(),
            });
        }
        Ok(())
    }
}
