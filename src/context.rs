use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::adapters::{self, SharedRunner};
use crate::config::AppConfig;
use crate::core::concat::Concatenator;
use crate::core::prober::ConnectivityProber;
use crate::core::registry::LocationRegistry;
use crate::core::transfer_engine::TransferEngine;
use crate::core::vault::CredentialVault;
use crate::db::{TransferLog, TransferStateStore};
use crate::service::JobScheduler;

/// Shared configuration, command runner and interruption token. Components
/// are built on demand from it.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub runner: SharedRunner,
    pub cancel: CancellationToken,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let runner = adapters::get_runner(config.simulation);
        Self::with_runner(config, runner)
    }

    pub fn with_runner(config: AppConfig, runner: SharedRunner) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            cancel: CancellationToken::new(),
        }
    }

    pub fn vault(&self) -> CredentialVault {
        CredentialVault::new(&self.config.key_file, &self.config.credentials_dir)
    }

    pub fn registry(&self) -> LocationRegistry {
        LocationRegistry::new(&self.config.locations_file, self.vault())
    }

    pub fn prober(&self) -> ConnectivityProber {
        ConnectivityProber::new(
            self.runner.clone(),
            self.vault(),
            self.config.remote_options(),
        )
    }

    pub fn concatenator(&self) -> Concatenator {
        Concatenator::new(&self.config.routes_root, self.runner.clone())
            .with_progress_interval(self.config.progress_interval())
            .with_timeout(self.config.remote_options().operation_timeout)
            .with_cancel(self.cancel.clone())
    }

    pub fn transfer_states(&self) -> TransferStateStore {
        TransferStateStore::new(&self.config.state_dir)
    }

    pub fn transfer_log(&self) -> TransferLog {
        TransferLog::new(&self.config.transfer_log_file)
    }

    pub fn engine(&self) -> TransferEngine {
        TransferEngine::new(self.runner.clone(), self.transfer_log())
            .with_retry(self.config.retry_policy())
            .with_options(self.config.remote_options())
            .with_mirror(self.config.mirror_remote)
            .with_failure_policy(self.config.failure_policy())
            .with_cancel(self.cancel.clone())
    }

    pub fn scheduler(&self) -> JobScheduler {
        JobScheduler::new(&self.config.launch_env_file)
    }
}
