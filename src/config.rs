use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::transfer_engine::{FailureLogPolicy, RemoteOptions, RetryPolicy};

pub const DEFAULT_CONFIG_PATH: &str = "/data/routesync/config.toml";
pub const ENV_PREFIX: &str = "ROUTESYNC_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding `<route>--<index>` segment directories.
    pub routes_root: PathBuf,
    /// Scratch space for concatenated artifacts, one subdirectory per route.
    pub work_dir: PathBuf,
    pub locations_file: PathBuf,
    pub credentials_dir: PathBuf,
    pub key_file: PathBuf,
    pub state_dir: PathBuf,
    pub transfer_log_file: PathBuf,
    pub device_id_file: PathBuf,
    /// Shell file sourced at boot; scheduled jobs are written into it.
    pub launch_env_file: PathBuf,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub connect_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub log_failed_transfers: bool,
    /// Remove remote files that are not part of the uploaded set (SSH only).
    pub mirror_remote: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub simulation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            routes_root: PathBuf::from("/data/media/0/realdata"),
            work_dir: PathBuf::from("/data/routesync/work"),
            locations_file: PathBuf::from("/data/routesync/network_locations.json"),
            credentials_dir: PathBuf::from("/data/routesync/credentials"),
            key_file: PathBuf::from("/data/routesync/credential.key"),
            state_dir: PathBuf::from("/data/routesync/transfer_state"),
            transfer_log_file: PathBuf::from("/data/routesync/transfer_log.json"),
            device_id_file: PathBuf::from("/data/params/d/DongleId"),
            launch_env_file: PathBuf::from("/data/openpilot/launch_env.sh"),
            retry_attempts: 3,
            retry_delay_secs: 5,
            connect_timeout_secs: 5,
            operation_timeout_secs: 3600,
            progress_interval_ms: 1000,
            log_failed_transfers: false,
            mirror_remote: true,
            verbose: false,
            json_logs: false,
            simulation: false,
        }
    }
}

impl AppConfig {
    /// Defaults, then the TOML file, then `ROUTESYNC_*` variables, then
    /// whatever `overrides` serializes (CLI flags, skip-if-none).
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }
        figment.extract()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            delay: Duration::from_secs(self.retry_delay_secs),
            timeout: Duration::from_secs(self.operation_timeout_secs),
        }
    }

    pub fn remote_options(&self) -> RemoteOptions {
        RemoteOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
        }
    }

    pub fn failure_policy(&self) -> FailureLogPolicy {
        if self.log_failed_transfers {
            FailureLogPolicy::LogFailures
        } else {
            FailureLogPolicy::SuccessOnly
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Every path rooted under `dir`; used by tests and simulation runs.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            routes_root: dir.join("realdata"),
            work_dir: dir.join("work"),
            locations_file: dir.join("network_locations.json"),
            credentials_dir: dir.join("credentials"),
            key_file: dir.join("credential.key"),
            state_dir: dir.join("transfer_state"),
            transfer_log_file: dir.join("transfer_log.json"),
            device_id_file: dir.join("DongleId"),
            launch_env_file: dir.join("launch_env.sh"),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Flags {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_attempts: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
    }

    #[test]
    fn missing_file_gives_defaults() {
        let temp = tempdir().unwrap();
        let config = AppConfig::new(Some(&temp.path().join("none.toml")), None::<&Flags>).unwrap();

        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.connect_timeout_secs, 5);
        assert!(!config.log_failed_transfers);
        assert_eq!(config.failure_policy(), FailureLogPolicy::SuccessOnly);
    }

    #[test]
    fn file_then_flags_take_precedence() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "retry_attempts = 7\nlog_failed_transfers = true\nverbose = false\n",
        )
        .unwrap();

        let flags = Flags {
            retry_attempts: None,
            verbose: Some(true),
        };
        let config = AppConfig::new(Some(&path), Some(&flags)).unwrap();

        assert_eq!(config.retry_attempts, 7);
        assert!(config.verbose);
        assert_eq!(config.failure_policy(), FailureLogPolicy::LogFailures);
    }

    #[test]
    fn toml_output_reloads() {
        let temp = tempdir().unwrap();
        let config = AppConfig::rooted_at(temp.path());
        let path = temp.path().join("config.toml");
        fs::write(&path, config.to_toml().unwrap()).unwrap();

        assert_eq!(AppConfig::new(Some(&path), None::<&Flags>).unwrap(), config);
    }
}
