#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use routesync::adapters::{CommandOutput, SimulatedRunner};
use routesync::config::AppConfig;
use routesync::core::models::{AuthInput, Endpoint, NewLocation, Protocol, Role};

pub const DEVICE: &str = "a2a0ccea32023010";
pub const ROUTE: &str = "2024-01-08--12-00-00";

/// Paths under `dir`, no retry delay, device id written.
pub fn config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::rooted_at(dir);
    config.retry_delay_secs = 0;
    config.progress_interval_ms = 10;
    fs::write(&config.device_id_file, format!("{}\n", DEVICE)).unwrap();
    config
}

pub fn segment(config: &AppConfig, route: &str, index: u32, file: &str, body: &[u8]) {
    let dir = config.routes_root.join(format!("{}--{}", route, index));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(file), body).unwrap();
}

pub fn home_nas(role: Role, label: &str) -> NewLocation {
    NewLocation {
        protocol: Protocol::Smb,
        role,
        server: "nas.local".into(),
        endpoint: Endpoint::Share {
            share: "routes".into(),
        },
        remote_path: "comma".into(),
        label: label.into(),
        username: "pi".into(),
        auth: AuthInput::Password("hunter2".into()),
    }
}

/// In-memory SMB share answering the smbclient commands the backend sends.
#[derive(Clone, Default)]
pub struct FakeShare {
    files: Arc<Mutex<HashMap<String, u64>>>,
    puts: Arc<Mutex<Vec<String>>>,
}

fn quoted(commands: &str) -> Vec<String> {
    commands
        .split('"')
        .skip(1)
        .step_by(2)
        .map(String::from)
        .collect()
}

impl FakeShare {
    pub fn seed(&self, path: &str, size: u64) {
        self.files.lock().unwrap().insert(path.to_string(), size);
    }

    pub fn size(&self, path: &str) -> Option<u64> {
        self.files.lock().unwrap().get(path).copied()
    }

    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn runner(&self) -> SimulatedRunner {
        self.runner_with(|| true)
    }

    /// `on_put` runs before each upload; returning false fails it.
    pub fn runner_with<F>(&self, on_put: F) -> SimulatedRunner
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let share = self.clone();
        SimulatedRunner::new(move |spec| {
            if spec.program != "smbclient" {
                return Ok(CommandOutput::success(Vec::new()));
            }
            let commands = spec
                .args
                .iter()
                .position(|a| a == "-c")
                .and_then(|i| spec.args.get(i + 1))
                .cloned()
                .unwrap_or_default();
            let args = quoted(&commands);

            if commands == "ls" {
                return Ok(CommandOutput::success(
                    "  .                                   D        0  Mon Jan  8 12:00:00 2024\n",
                ));
            }
            if commands.starts_with("mkdir ") {
                return Ok(CommandOutput::success(Vec::new()));
            }
            if commands.starts_with("ls ") {
                let path = &args[0];
                let name = path.rsplit('/').next().unwrap_or(path);
                return Ok(match share.size(path) {
                    Some(size) => CommandOutput::success(format!(
                        "  {}                                   A     {}  Mon Jan  8 12:00:00 2024\n",
                        name, size
                    )),
                    None => CommandOutput::failure(
                        1,
                        format!("NT_STATUS_NO_SUCH_FILE listing \\{}", path),
                    ),
                });
            }

            let (dir, local, name) = if commands.starts_with("cd ") {
                (args[0].clone(), args[1].clone(), args[2].clone())
            } else {
                (String::new(), args[0].clone(), args[1].clone())
            };
            if !on_put() {
                return Ok(CommandOutput::failure(1, "NT_STATUS_DISK_FULL"));
            }
            let size = fs::metadata(&local).unwrap().len();
            let path = if dir.is_empty() {
                name
            } else {
                format!("{}/{}", dir, name)
            };
            share.puts.lock().unwrap().push(path.clone());
            share.seed(&path, size);
            Ok(CommandOutput::success(Vec::new()))
        })
    }
}
