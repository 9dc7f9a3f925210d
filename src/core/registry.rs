//! Configured network locations, at most one per role.
//!
//! Backed by a single `{"locations": [...]}` JSON document. Password
//! credentials live beside it in the vault and follow the entry's lifecycle.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::models::{
    Auth, AuthInput, Endpoint, NetworkLocation, NewLocation, Protocol, Role,
};
use crate::core::vault::CredentialVault;
use crate::db::{JsonStore, StoreError};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationsDoc {
    #[serde(default)]
    pub locations: Vec<NetworkLocation>,
}

/// What `add` does when the role is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacePolicy {
    Reject,
    /// Caller confirmed: drop the existing entry and its credential.
    Replace,
}

/// Stable id from the identifying fields. Path, username and credentials
/// are deliberately left out.
pub fn location_id(server: &str, endpoint: &Endpoint, label: &str, role: Role) -> String {
    let material = format!("{}|{}|{}|{}", server, endpoint.key(), label, role.as_str());
    blake3::hash(material.as_bytes()).to_hex()[..16].to_string()
}

/// Deterministic credential file name for a location.
pub fn credential_ref(protocol: Protocol, role: Role, server: &str, endpoint: &Endpoint) -> String {
    let material = format!("{}|{}", server, endpoint.key());
    let digest = blake3::hash(material.as_bytes()).to_hex();
    format!("{}_{}_{}.enc", protocol, role, &digest[..12])
}

/// The entry `new` would be stored as, without touching disk.
pub fn preview(new: &NewLocation) -> NetworkLocation {
    let auth = match &new.auth {
        AuthInput::Password(_) => Auth::Password {
            credential_ref: credential_ref(new.protocol, new.role, &new.server, &new.endpoint),
        },
        AuthInput::Key(path) => Auth::Key {
            key_path: path.clone(),
        },
    };
    NetworkLocation {
        location_id: location_id(&new.server, &new.endpoint, &new.label, new.role),
        protocol: new.protocol,
        role: new.role,
        server: new.server.clone(),
        endpoint: new.endpoint.clone(),
        remote_path: new.remote_path.clone(),
        label: new.label.clone(),
        username: new.username.clone(),
        auth,
    }
}

#[derive(Debug, Clone)]
pub struct LocationRegistry {
    store: JsonStore<LocationsDoc>,
    vault: CredentialVault,
}

impl LocationRegistry {
    pub fn new(locations_file: impl Into<PathBuf>, vault: CredentialVault) -> Self {
        Self {
            store: JsonStore::new(locations_file).with_mode(0o600),
            vault,
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// Read the document without repairing it.
    pub fn inspect(&self) -> std::result::Result<LocationsDoc, StoreError> {
        self.store.load()
    }

    /// Load the document. An unparsable file is moved aside, replaced with an
    /// empty one and reported as `ConfigCorrupt`.
    fn load(&self) -> Result<LocationsDoc> {
        match self.store.load() {
            Ok(doc) => Ok(doc),
            Err(StoreError::Corrupt { path, source }) => {
                warn!(path = %path.display(), error = %source, "Location config is corrupt");
                let backup = self.store.quarantine()?;
                Err(SyncError::ConfigCorrupt { path, backup })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Register a location for `new.role`.
    pub fn add(&self, new: NewLocation, policy: ReplacePolicy) -> Result<NetworkLocation> {
        validate(&new)?;
        let doc = self.load()?;

        let existing = doc.locations.iter().find(|l| l.role == new.role).cloned();
        let mut replaced_blob = None;
        if let Some(existing) = &existing {
            if policy == ReplacePolicy::Reject {
                return Err(SyncError::DuplicateRoleConflict {
                    role: new.role,
                    label: existing.label.clone(),
                });
            }
            // Never two live credential files for one role.
            if let Auth::Password { credential_ref } = &existing.auth {
                if let Some(blob) = self.vault.read_blob(credential_ref)? {
                    replaced_blob = Some((credential_ref.clone(), blob));
                }
                self.vault.remove(credential_ref)?;
            }
        }

        let location = preview(&new);
        if let Err(e) = self.persist(&new, &location) {
            if let Some((credential_ref, blob)) = &replaced_blob {
                if let Err(restore) = self.vault.restore_blob(credential_ref, blob) {
                    warn!(error = %restore, "Failed to restore replaced credential");
                }
            }
            return Err(e);
        }

        info!(
            role = %location.role,
            label = %location.label,
            location_id = %location.location_id,
            replaced = existing.is_some(),
            "Saved network location"
        );
        Ok(location)
    }

    /// Encrypt the credential and save the entry. On failure the new
    /// credential file is removed again.
    fn persist(&self, new: &NewLocation, location: &NetworkLocation) -> Result<()> {
        let written = match (&new.auth, &location.auth) {
            (AuthInput::Password(password), Auth::Password { credential_ref }) => {
                self.vault.ensure_key_file()?;
                self.vault.encrypt(credential_ref, password)?;
                Some(credential_ref.as_str())
            }
            _ => None,
        };

        let saved = self.store.update(|doc| {
            doc.locations.retain(|l| l.role != location.role);
            doc.locations.push(location.clone());
        });
        if let Err(e) = saved {
            if let Some(cred) = written {
                if let Err(cleanup) = self.vault.remove(cred) {
                    warn!(error = %cleanup, "Failed to remove credential after aborted add");
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove the location for `role` together with its credential.
    pub fn remove(&self, role: Role) -> Result<NetworkLocation> {
        let doc = self.load()?;
        let location = doc
            .locations
            .iter()
            .find(|l| l.role == role)
            .cloned()
            .ok_or_else(|| SyncError::LocationNotFound(role.to_string()))?;

        self.store.update(|doc| doc.locations.retain(|l| l.role != role))?;
        if let Auth::Password { credential_ref } = &location.auth {
            self.vault.remove(credential_ref)?;
        }

        info!(role = %role, label = %location.label, "Removed network location");
        Ok(location)
    }

    pub fn get(&self, role: Role) -> Result<Option<NetworkLocation>> {
        Ok(self.load()?.locations.into_iter().find(|l| l.role == role))
    }

    pub fn get_by_id(&self, location_id: &str) -> Result<NetworkLocation> {
        self.load()?
            .locations
            .into_iter()
            .find(|l| l.location_id == location_id)
            .ok_or_else(|| SyncError::LocationNotFound(location_id.to_string()))
    }

    pub fn list_all(&self) -> Result<Vec<NetworkLocation>> {
        Ok(self.load()?.locations)
    }

    pub fn label(&self, location_id: &str) -> Result<String> {
        self.get_by_id(location_id).map(|l| l.label)
    }

    /// Credential material for a location, decrypted at point of use.
    pub fn resolve(&self, location: &NetworkLocation) -> Result<AuthInput> {
        match &location.auth {
            Auth::Password { credential_ref } => {
                Ok(AuthInput::Password(self.vault.decrypt_ref(credential_ref)?))
            }
            Auth::Key { key_path } => Ok(AuthInput::Key(key_path.clone())),
        }
    }
}

fn invalid(msg: impl Into<String>) -> SyncError {
    SyncError::InvalidLocation(msg.into())
}

/// Reject input that could never produce a working location.
pub fn validate(new: &NewLocation) -> Result<()> {
    let server = new.server.trim();
    if server.is_empty() || server.contains(char::is_whitespace) || server.contains('/') {
        return Err(invalid(format!("bad server name {:?}", new.server)));
    }
    if new.label.trim().is_empty() {
        return Err(invalid("label must not be empty"));
    }
    if new.username.trim().is_empty() {
        return Err(invalid("username must not be empty"));
    }
    if new.remote_path.contains('"') {
        return Err(invalid("remote path must not contain double quotes"));
    }

    match (new.protocol, &new.endpoint) {
        (Protocol::Smb, Endpoint::Share { share }) => {
            if share.trim().is_empty() || share.contains('/') {
                return Err(invalid(format!("bad share name {:?}", share)));
            }
        }
        (Protocol::Ssh, Endpoint::Port { port }) => {
            if *port == 0 {
                return Err(invalid("port must be between 1 and 65535"));
            }
        }
        (Protocol::Smb, Endpoint::Port { .. }) => {
            return Err(invalid("smb locations need a share, not a port"));
        }
        (Protocol::Ssh, Endpoint::Share { .. }) => {
            return Err(invalid("ssh locations need a port, not a share"));
        }
    }

    match (&new.auth, new.protocol) {
        (AuthInput::Key(_), Protocol::Smb) => {
            Err(invalid("smb locations only support password authentication"))
        }
        (AuthInput::Key(path), Protocol::Ssh) if !path.is_file() => {
            Err(invalid(format!("key file {} does not exist", path.display())))
        }
        _ => Ok(()),
    }
}
