//! Password encryption for network locations.
//!
//! Blobs use the OpenSSL `enc` container so they stay readable with
//! `openssl enc -d -aes-256-cbc -pbkdf2 -pass file:<key file>`:
//! `"Salted__" || salt[8] || AES-256-CBC(PKCS#7)`, with key and IV derived by
//! PBKDF2-HMAC-SHA256 from the first line of the device key file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use tracing::{debug, info};

use crate::db::atomic_write;
use crate::error::{Result, SyncError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
/// OpenSSL's default iteration count for `-pbkdf2`.
const PBKDF2_ROUNDS: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct CredentialVault {
    key_file: PathBuf,
    credentials_dir: PathBuf,
}

impl CredentialVault {
    pub fn new(key_file: impl Into<PathBuf>, credentials_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
            credentials_dir: credentials_dir.into(),
        }
    }

    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    pub fn credentials_dir(&self) -> &Path {
        &self.credentials_dir
    }

    pub fn path_for(&self, credential_ref: &str) -> PathBuf {
        self.credentials_dir.join(credential_ref)
    }

    /// Create a random key file if none exists. Returns true if one was made.
    pub fn ensure_key_file(&self) -> Result<bool> {
        if self.key_file.exists() {
            return Ok(false);
        }
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let mut body: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
        body.push('\n');

        atomic_write(&self.key_file, body.as_bytes(), 0o600)
            .map_err(|e| SyncError::io(format!("write key file {}", self.key_file.display()), e))?;
        info!(path = %self.key_file.display(), "Generated credential key file");
        Ok(true)
    }

    /// Encrypt `plaintext` into `<credentials_dir>/<credential_ref>`.
    pub fn encrypt(&self, credential_ref: &str, plaintext: &str) -> Result<PathBuf> {
        let passphrase = self.passphrase()?;

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let (key, iv) = derive_key_iv(&passphrase, &salt);

        let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|_| SyncError::VaultUnavailable(self.key_file.clone()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut blob = Vec::with_capacity(MAGIC.len() + SALT_LEN + ciphertext.len());
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&ciphertext);

        let path = self.path_for(credential_ref);
        atomic_write(&path, &blob, 0o600)
            .map_err(|e| SyncError::io(format!("write credential {}", path.display()), e))?;
        debug!(path = %path.display(), "Stored encrypted credential");
        Ok(path)
    }

    pub fn decrypt(&self, path: &Path) -> Result<String> {
        let passphrase = self.passphrase()?;
        let blob = fs::read(path)
            .map_err(|e| SyncError::io(format!("read credential {}", path.display()), e))?;

        let failed = || SyncError::DecryptionFailed {
            path: path.to_path_buf(),
        };

        if blob.len() < MAGIC.len() + SALT_LEN || &blob[..MAGIC.len()] != MAGIC {
            return Err(failed());
        }
        let salt = &blob[MAGIC.len()..MAGIC.len() + SALT_LEN];
        let ciphertext = &blob[MAGIC.len() + SALT_LEN..];

        let (key, iv) = derive_key_iv(&passphrase, salt);
        let cipher = Aes256CbcDec::new_from_slices(&key, &iv).map_err(|_| failed())?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| failed())?;

        String::from_utf8(plaintext).map_err(|_| failed())
    }

    pub fn decrypt_ref(&self, credential_ref: &str) -> Result<String> {
        self.decrypt(&self.path_for(credential_ref))
    }

    /// Raw blob bytes, `None` if the credential does not exist.
    pub fn read_blob(&self, credential_ref: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(credential_ref);
        match fs::read(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io(format!("read credential {}", path.display()), e)),
        }
    }

    /// Put back a blob taken with [`read_blob`](Self::read_blob).
    pub fn restore_blob(&self, credential_ref: &str, blob: &[u8]) -> Result<()> {
        let path = self.path_for(credential_ref);
        atomic_write(&path, blob, 0o600)
            .map_err(|e| SyncError::io(format!("restore credential {}", path.display()), e))
    }

    /// Delete a credential blob. Missing files are not an error.
    pub fn remove(&self, credential_ref: &str) -> Result<()> {
        let path = self.path_for(credential_ref);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed credential");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io(format!("remove credential {}", path.display()), e)),
        }
    }

    /// File names of every stored credential blob.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.credentials_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SyncError::io(
                    format!("list {}", self.credentials_dir.display()),
                    e,
                ));
            }
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        Ok(names)
    }

    fn passphrase(&self) -> Result<Vec<u8>> {
        let content = match fs::read(&self.key_file) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::VaultUnavailable(self.key_file.clone()));
            }
            Err(e) => {
                return Err(SyncError::io(
                    format!("read key file {}", self.key_file.display()),
                    e,
                ));
            }
        };
        // `-pass file:` uses the first line only.
        let first_line = content.split(|b| *b == b'\n').next().unwrap_or(&[]);
        let first_line = first_line.strip_suffix(b"\r").unwrap_or(first_line);
        if first_line.is_empty() {
            return Err(SyncError::VaultUnavailable(self.key_file.clone()));
        }
        Ok(first_line.to_vec())
    }
}

fn derive_key_iv(passphrase: &[u8], salt: &[u8]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut derived = [0u8; KEY_LEN + IV_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, PBKDF2_ROUNDS, &mut derived);

    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&derived[..KEY_LEN]);
    iv.copy_from_slice(&derived[KEY_LEN..]);
    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn vault(dir: &Path) -> CredentialVault {
        let vault = CredentialVault::new(dir.join("key"), dir.join("creds"));
        vault.ensure_key_file().unwrap();
        vault
    }

    #[test]
    fn roundtrip_various_passwords() {
        let temp = tempdir().unwrap();
        let vault = vault(temp.path());

        let long = "x".repeat(1000);
        for password in ["", "hunter2", "pässwörd 🔑 with spaces", long.as_str()] {
            let path = vault.encrypt("cred.enc", password).unwrap();
            assert_eq!(vault.decrypt(&path).unwrap(), password);
        }
    }

    #[test]
    fn blob_is_not_plaintext_and_private() {
        let temp = tempdir().unwrap();
        let vault = vault(temp.path());

        let path = vault.encrypt("cred.enc", "supersecret").unwrap();
        let blob = fs::read(&path).unwrap();

        assert!(blob.starts_with(MAGIC));
        assert!(!blob.windows(11).any(|w| w == b"supersecret"));
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn same_password_gets_fresh_salt() {
        let temp = tempdir().unwrap();
        let vault = vault(temp.path());

        let a = fs::read(vault.encrypt("a.enc", "pw").unwrap()).unwrap();
        let b = fs::read(vault.encrypt("b.enc", "pw").unwrap()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn missing_key_file_is_unavailable() {
        let temp = tempdir().unwrap();
        let vault = CredentialVault::new(temp.path().join("key"), temp.path().join("creds"));

        let err = vault.encrypt("c.enc", "pw").unwrap_err();
        assert!(matches!(err, SyncError::VaultUnavailable(_)));
    }

    #[test]
    fn changed_key_file_fails_decryption() {
        let temp = tempdir().unwrap();
        let vault = vault(temp.path());
        let path = vault.encrypt("c.enc", "a password long enough").unwrap();

        fs::write(vault.key_file(), "a-different-key\n").unwrap();

        let err = vault.decrypt(&path).unwrap_err();
        assert!(matches!(err, SyncError::DecryptionFailed { .. }));
    }

    #[test]
    fn corrupt_blob_fails_decryption() {
        let temp = tempdir().unwrap();
        let vault = vault(temp.path());
        let path = vault.encrypt("c.enc", "pw").unwrap();

        fs::write(&path, b"Salted__short").unwrap();
        assert!(matches!(
            vault.decrypt(&path),
            Err(SyncError::DecryptionFailed { .. })
        ));

        fs::write(&path, b"not an openssl blob at all").unwrap();
        assert!(matches!(
            vault.decrypt(&path),
            Err(SyncError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn key_file_only_first_line_counts() {
        let temp = tempdir().unwrap();
        let vault = CredentialVault::new(temp.path().join("key"), temp.path().join("creds"));
        fs::write(vault.key_file(), "line-one\n").unwrap();
        let path = vault.encrypt("c.enc", "pw").unwrap();

        fs::write(vault.key_file(), "line-one\nextra trailing content\n").unwrap();
        assert_eq!(vault.decrypt(&path).unwrap(), "pw");
    }

    #[test]
    fn ensure_key_file_is_idempotent() {
        let temp = tempdir().unwrap();
        let vault = CredentialVault::new(temp.path().join("key"), temp.path().join("creds"));

        assert!(vault.ensure_key_file().unwrap());
        let first = fs::read(vault.key_file()).unwrap();
        assert!(!vault.ensure_key_file().unwrap());
        assert_eq!(fs::read(vault.key_file()).unwrap(), first);
    }

    #[test]
    fn remove_and_list() {
        let temp = tempdir().unwrap();
        let vault = vault(temp.path());
        vault.encrypt("b.enc", "pw").unwrap();
        vault.encrypt("a.enc", "pw").unwrap();

        assert_eq!(vault.list().unwrap(), vec!["a.enc", "b.enc"]);
        vault.remove("a.enc").unwrap();
        vault.remove("a.enc").unwrap();
        assert_eq!(vault.list().unwrap(), vec!["b.enc"]);
    }
}
