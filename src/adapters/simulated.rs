use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use super::{CommandOutput, CommandRunner, CommandSpec, RunError};
use crate::core::transfer_engine::SSH_ABSENT_MARKER;

type Handler = dyn Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync;

/// Scripted stand-in for external programs.
///
/// Every invocation is recorded; the reply comes from the handler closure,
/// which may also touch the filesystem (e.g. write an ffmpeg output file).
#[derive(Clone)]
pub struct SimulatedRunner {
    handler: Arc<Handler>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl SimulatedRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every command exits 0 with empty output.
    pub fn succeeding() -> Self {
        Self::new(|spec| {
            info!(command = %spec.display(), "(Simulated) command");
            Ok(CommandOutput::success(Vec::new()))
        })
    }

    /// Simulation mode: every command succeeds against an in-memory remote.
    ///
    /// Uploads (smbclient `put`, rsync) record the local file's size so later
    /// size queries over smbclient `ls` or ssh `stat` report it, and ffmpeg
    /// leaves an empty file at its output path.
    pub fn dry_run() -> Self {
        let remote = DryRunRemote::default();
        Self::new(move |spec| {
            info!(command = %spec.display(), "(Simulated) command");
            remote.reply(spec)
        })
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Invocations whose program or arguments contain `needle`.
    pub fn calls_matching(&self, needle: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.display().contains(needle))
            .collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

/// Remote file sizes known to a dry run, keyed by remote path.
#[derive(Default)]
struct DryRunRemote {
    sizes: Mutex<HashMap<String, u64>>,
}

impl DryRunRemote {
    fn reply(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        // `sshpass -e <program> ...`
        let (program, args) = match spec.program.as_str() {
            "sshpass" => (
                spec.args.get(1).map(String::as_str).unwrap_or_default(),
                spec.args.get(2..).unwrap_or_default(),
            ),
            other => (other, spec.args.as_slice()),
        };

        match program {
            "ffmpeg" => {
                if let Some(output) = args.last() {
                    fs::write(Path::new(output), b"").map_err(|source| RunError::Spawn {
                        program: spec.program.clone(),
                        source,
                    })?;
                }
                Ok(CommandOutput::success(Vec::new()))
            }
            "smbclient" => Ok(self.smbclient(args)),
            "rsync" => Ok(self.rsync(args)),
            "ssh" => Ok(self.ssh(args)),
            _ => Ok(CommandOutput::success(Vec::new())),
        }
    }

    fn size(&self, path: &str) -> Option<u64> {
        self.sizes.lock().ok()?.get(path).copied()
    }

    fn record(&self, remote: String, local: &str) -> Option<u64> {
        let size = fs::metadata(local).ok()?.len();
        if let Ok(mut sizes) = self.sizes.lock() {
            sizes.insert(remote, size);
        }
        Some(size)
    }

    fn smbclient(&self, args: &[String]) -> CommandOutput {
        let commands = args
            .iter()
            .position(|a| a == "-c")
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
            .unwrap_or_default();
        let quoted: Vec<&str> = commands.split('"').skip(1).step_by(2).collect();

        if commands.starts_with("ls ") {
            let Some(&path) = quoted.first() else {
                return CommandOutput::success(Vec::new());
            };
            let name = path.rsplit('/').next().unwrap_or(path);
            return match self.size(path) {
                Some(size) => CommandOutput::success(format!(
                    "  {}  A  {}  Mon Jan  8 12:00:00 2024\n",
                    name, size
                )),
                None => {
                    CommandOutput::failure(1, format!("NT_STATUS_NO_SUCH_FILE listing {}", path))
                }
            };
        }

        if commands.contains("put ") {
            let (dir, local, name) = match quoted.as_slice() {
                [dir, local, name] => (*dir, *local, *name),
                [local, name] => ("", *local, *name),
                _ => return CommandOutput::success(Vec::new()),
            };
            let remote = if dir.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", dir, name)
            };
            if self.record(remote, local).is_none() {
                return CommandOutput::failure(1, "NT_STATUS_OBJECT_NAME_NOT_FOUND");
            }
        }
        CommandOutput::success(Vec::new())
    }

    fn rsync(&self, args: &[String]) -> CommandOutput {
        let [.., local, destination] = args else {
            return CommandOutput::success(Vec::new());
        };
        let remote = destination
            .split_once(':')
            .map(|(_, path)| path)
            .unwrap_or(destination);
        match self.record(remote.to_string(), local) {
            Some(size) => CommandOutput::success(format!("{} 100%\n", size)),
            None => CommandOutput::failure(23, format!("rsync: link_stat \"{}\" failed", local)),
        }
    }

    fn ssh(&self, args: &[String]) -> CommandOutput {
        let command = args.last().map(String::as_str).unwrap_or_default();
        if !command.contains("stat -c %s") {
            return CommandOutput::success(Vec::new());
        }
        let path = command.split('\'').nth(1).unwrap_or_default();
        match self.size(path) {
            Some(size) => CommandOutput::success(format!("{}\n", size)),
            None => CommandOutput::success(format!("{}\n", SSH_ABSENT_MARKER)),
        }
    }
}

#[async_trait]
impl CommandRunner for SimulatedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }
        (self.handler)(spec)
    }
}
