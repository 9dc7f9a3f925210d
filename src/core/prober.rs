//! Reachability and authentication checks against a network location.

use tracing::{debug, info, warn};

use crate::adapters::SharedRunner;
use crate::core::models::{Auth, AuthInput, NetworkLocation};
use crate::core::transfer_engine::{ProbeResult, RemoteOptions, create_backend};
use crate::core::vault::CredentialVault;
use crate::error::Result;

/// One-shot connectivity check. Never retries; callers decide whether to.
#[derive(Clone)]
pub struct ConnectivityProber {
    runner: SharedRunner,
    vault: CredentialVault,
    options: RemoteOptions,
}

impl ConnectivityProber {
    pub fn new(runner: SharedRunner, vault: CredentialVault, options: RemoteOptions) -> Self {
        Self {
            runner,
            vault,
            options,
        }
    }

    /// Probe a stored location, decrypting its password if it has one.
    ///
    /// Vault errors are returned as errors; network outcomes are values.
    pub async fn probe(&self, location: &NetworkLocation) -> Result<ProbeResult> {
        let auth = match &location.auth {
            Auth::Password { credential_ref } => {
                AuthInput::Password(self.vault.decrypt_ref(credential_ref)?)
            }
            Auth::Key { key_path } => AuthInput::Key(key_path.clone()),
        };
        Ok(self.probe_with(location, &auth).await)
    }

    /// Probe with credential material supplied by the caller, e.g. before
    /// the location has been saved.
    pub async fn probe_with(&self, location: &NetworkLocation, auth: &AuthInput) -> ProbeResult {
        let backend = create_backend(location, auth, self.runner.clone(), self.options);
        let target = backend.target();
        debug!(target = %target, protocol = %location.protocol, "Probing location");

        let result = backend.probe().await;
        match &result {
            ProbeResult::Valid => info!(target = %target, "Location reachable"),
            ProbeResult::Unreachable(detail) => {
                warn!(target = %target, detail = %detail, "Location unreachable")
            }
            ProbeResult::AuthFailed(detail) => {
                warn!(target = %target, detail = %detail, "Authentication failed")
            }
        }
        result
    }
}
