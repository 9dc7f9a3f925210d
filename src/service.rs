//! Scheduled jobs as marker-delimited blocks in the launch environment file.
//!
//! The file is a shell script sourced at boot. Each job owns one block:
//!
//! ```text
//! # BEGIN routesync:route_sync
//! '/usr/local/bin/routesync' sync-all --location-id '3f2a...' >/dev/null 2>&1 &
//! # END routesync:route_sync
//! ```
//!
//! Installing replaces the job's block in place; removing deletes it. Lines
//! outside our blocks are never touched.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::core::models::Role;
use crate::core::transfer_engine::sh_quote;
use crate::db::atomic_write;
use crate::error::{Result, SyncError};

const MARKER_PREFIX: &str = "routesync";

const JOB_TEMPLATE: &str = "{binary} {command} --location-id {location_id}{extra} >/dev/null 2>&1 &";

/// One scheduled invocation of a sync or backup entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub role: Role,
    pub location_id: String,
    pub command_line: String,
}

impl Job {
    pub fn route_sync(binary: &Path, location_id: &str) -> Self {
        Self::render(Role::RouteSync, binary, "sync-all", location_id, "")
    }

    pub fn device_backup(binary: &Path, location_id: &str, backup_dir: &Path) -> Self {
        let extra = format!(
            " --backup-dir {}",
            sh_quote(&backup_dir.display().to_string())
        );
        Self::render(Role::DeviceBackup, binary, "backup", location_id, &extra)
    }

    fn render(role: Role, binary: &Path, command: &str, location_id: &str, extra: &str) -> Self {
        let command_line = JOB_TEMPLATE
            .replace("{binary}", &sh_quote(&binary.display().to_string()))
            .replace("{command}", command)
            .replace("{location_id}", &sh_quote(location_id))
            .replace("{extra}", extra);
        Self {
            role,
            location_id: location_id.to_string(),
            command_line,
        }
    }
}

fn begin_marker(role: Role) -> String {
    format!("# BEGIN {}:{}", MARKER_PREFIX, role)
}

fn end_marker(role: Role) -> String {
    format!("# END {}:{}", MARKER_PREFIX, role)
}

pub struct JobScheduler {
    launch_env: PathBuf,
}

impl JobScheduler {
    pub fn new(launch_env: impl Into<PathBuf>) -> Self {
        Self {
            launch_env: launch_env.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.launch_env
    }

    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.launch_env) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(SyncError::io(
                format!("read {}", self.launch_env.display()),
                e,
            )),
        }
    }

    fn write(&self, content: &str) -> Result<()> {
        let mode = fs::metadata(&self.launch_env)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(0o755);
        atomic_write(&self.launch_env, content.as_bytes(), mode).map_err(|e| {
            SyncError::io(format!("write {}", self.launch_env.display()), e)
        })
    }

    /// Write or replace the block for `job.role`. Returns false when the
    /// file already had exactly this block.
    pub fn install(&self, job: &Job) -> Result<bool> {
        let current = self.read()?;
        let (mut rest, _) = strip_block(&current, job.role)?;

        if !rest.is_empty() && !rest.ends_with('\n') {
            rest.push('\n');
        }
        rest.push_str(&begin_marker(job.role));
        rest.push('\n');
        rest.push_str(&job.command_line);
        rest.push('\n');
        rest.push_str(&end_marker(job.role));
        rest.push('\n');

        if rest == current {
            return Ok(false);
        }
        self.write(&rest)?;
        info!(
            role = %job.role,
            location_id = %job.location_id,
            file = %self.launch_env.display(),
            "Installed scheduled job"
        );
        Ok(true)
    }

    /// Delete the block for `role`. Returns false if there was none.
    pub fn remove(&self, role: Role) -> Result<bool> {
        let current = self.read()?;
        let (rest, found) = strip_block(&current, role)?;
        if found.is_none() {
            return Ok(false);
        }
        self.write(&rest)?;
        info!(role = %role, file = %self.launch_env.display(), "Removed scheduled job");
        Ok(true)
    }

    /// Command line of the installed block for `role`, if any.
    pub fn installed(&self, role: Role) -> Result<Option<String>> {
        let current = self.read()?;
        Ok(strip_block(&current, role)?.1)
    }
}

/// Split `content` into everything outside `role`'s block and the block's
/// body.
fn strip_block(content: &str, role: Role) -> Result<(String, Option<String>)> {
    let begin = begin_marker(role);
    let end = end_marker(role);

    let mut rest = String::with_capacity(content.len());
    let mut body: Option<Vec<&str>> = None;
    let mut found = None;
    let mut inside = false;

    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if !inside && trimmed == begin {
            inside = true;
            body = Some(Vec::new());
        } else if inside && trimmed == end {
            inside = false;
            found = body.take().map(|lines| lines.join("\n"));
        } else if inside {
            if let Some(lines) = body.as_mut() {
                lines.push(trimmed);
            }
        } else {
            rest.push_str(line);
        }
    }

    if inside {
        return Err(SyncError::io(
            format!("unterminated {} block", begin),
            io::Error::from(io::ErrorKind::InvalidData),
        ));
    }
    Ok((rest, found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PREAMBLE: &str = "#!/usr/bin/env bash\nexport PASSIVE=\"0\"\n";

    fn binary() -> PathBuf {
        PathBuf::from("/data/routesync/bin/routesync")
    }

    #[test]
    fn job_command_lines() {
        let job = Job::route_sync(&binary(), "abc123");
        assert_eq!(
            job.command_line,
            "'/data/routesync/bin/routesync' sync-all --location-id 'abc123' >/dev/null 2>&1 &"
        );

        let job = Job::device_backup(&binary(), "def", Path::new("/data/backups"));
        assert!(job.command_line.contains(" backup --location-id 'def' --backup-dir '/data/backups' "));
    }

    #[test]
    fn install_is_idempotent_and_replaces() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("launch_env.sh");
        fs::write(&path, PREAMBLE).unwrap();
        let scheduler = JobScheduler::new(&path);

        assert!(scheduler.install(&Job::route_sync(&binary(), "one")).unwrap());
        assert!(!scheduler.install(&Job::route_sync(&binary(), "one")).unwrap());
        assert!(scheduler.install(&Job::route_sync(&binary(), "two")).unwrap());

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(PREAMBLE));
        assert_eq!(content.matches("# BEGIN routesync:route_sync").count(), 1);
        assert!(content.contains("'two'"));
        assert!(!content.contains("'one'"));
    }

    #[test]
    fn remove_restores_surroundings() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("launch_env.sh");
        fs::write(&path, PREAMBLE).unwrap();
        let scheduler = JobScheduler::new(&path);

        scheduler
            .install(&Job::route_sync(&binary(), "one"))
            .unwrap();
        scheduler
            .install(&Job::device_backup(&binary(), "two", Path::new("/b")))
            .unwrap();

        assert!(scheduler.remove(Role::RouteSync).unwrap());
        assert!(!scheduler.remove(Role::RouteSync).unwrap());
        assert!(scheduler.installed(Role::RouteSync).unwrap().is_none());
        assert!(scheduler.installed(Role::DeviceBackup).unwrap().is_some());

        assert!(scheduler.remove(Role::DeviceBackup).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), PREAMBLE);
    }

    #[test]
    fn keeps_file_mode() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("launch_env.sh");
        fs::write(&path, PREAMBLE).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700)).unwrap();

        JobScheduler::new(&path)
            .install(&Job::route_sync(&binary(), "x"))
            .unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn unterminated_block_is_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("launch_env.sh");
        fs::write(&path, "# BEGIN routesync:route_sync\nfoo\n").unwrap();

        let scheduler = JobScheduler::new(&path);
        assert!(scheduler.install(&Job::route_sync(&binary(), "x")).is_err());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# BEGIN routesync:route_sync\nfoo\n"
        );
    }
}
