//! Credential storage for the completion-service API key.
//!
//! The key is kept in the OS keychain when one is reachable. Otherwise it
//! lives in `<data_dir>/credentials`, readable only by the owner on unix.
//! An absent entry or file means no key is stored.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use valet_core::error::ValetError;
use valet_core::store::CredentialStore;

const CREDENTIALS_FILE: &str = "credentials";
const KEYRING_SERVICE: &str = "valet";
const KEYRING_USER: &str = "completion-api-key";

/// Open the preferred credential store for `data_dir`.
///
/// Uses the OS keyring when it answers, moving a key left in the fallback
/// file into it. Falls back to [`FileCredentialStore`] otherwise.
pub fn open_credential_store(data_dir: &Path) -> Arc<dyn CredentialStore> {
    let keyring = match KeyringCredentialStore::new() {
        Ok(store) => Some(store),
        Err(e) => {
            debug!(error = %e, "Keyring entry unavailable");
            None
        }
    };
    select_store(keyring, FileCredentialStore::new(data_dir))
}

fn select_store(
    keyring: Option<KeyringCredentialStore>,
    file: FileCredentialStore,
) -> Arc<dyn CredentialStore> {
    let Some(keyring) = keyring.filter(KeyringCredentialStore::is_available) else {
        warn!(
            path = %file.path().display(),
            "OS keyring unavailable; API key stored in a file"
        );
        return Arc::new(file);
    };

    if let Err(e) = migrate_file_key(&keyring, &file) {
        warn!(error = %e, "Failed to move API key into the keyring");
    }
    info!("Using OS keyring for the API key");
    Arc::new(keyring)
}

fn migrate_file_key(
    keyring: &KeyringCredentialStore,
    file: &FileCredentialStore,
) -> Result<(), ValetError> {
    let stored = file.get()?;
    if stored.is_empty() {
        return Ok(());
    }
    if !keyring.has()? {
        keyring.set(&stored)?;
    }
    file.clear()?;
    info!(path = %file.path().display(), "Moved API key from file into the keyring");
    Ok(())
}

// =============================================================================
// Keyring
// =============================================================================

/// Stores the API key in the OS keychain.
pub struct KeyringCredentialStore {
    entry: keyring::Entry,
}

impl KeyringCredentialStore {
    pub fn new() -> Result<Self, ValetError> {
        Self::for_account(KEYRING_SERVICE, KEYRING_USER)
    }

    pub fn for_account(service: &str, user: &str) -> Result<Self, ValetError> {
        let entry = keyring::Entry::new(service, user).map_err(keyring_error)?;
        Ok(Self { entry })
    }

    /// Whether the platform store answers reads at all.
    pub fn is_available(&self) -> bool {
        keyring_answered(&self.entry.get_password())
    }
}

fn keyring_answered(read: &keyring::Result<String>) -> bool {
    matches!(read, Ok(_) | Err(keyring::Error::NoEntry))
}

fn keyring_error(e: keyring::Error) -> ValetError {
    ValetError::Credential(format!("Keyring error: {}", e))
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self) -> Result<String, ValetError> {
        match self.entry.get_password() {
            Ok(key) => Ok(key.trim().to_string()),
            Err(keyring::Error::NoEntry) => Ok(String::new()),
            Err(e) => Err(keyring_error(e)),
        }
    }

    fn set(&self, key: &str) -> Result<(), ValetError> {
        let key = key.trim();
        if key.is_empty() {
            return self.clear();
        }
        self.entry.set_password(key).map_err(keyring_error)?;
        debug!("API key stored in keyring");
        Ok(())
    }

    fn clear(&self) -> Result<(), ValetError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(keyring_error(e)),
        }
    }
}

// =============================================================================
// File fallback
// =============================================================================

/// Stores the API key as a single-line file under the data directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(CREDENTIALS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Result<String, ValetError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.trim().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(ValetError::Credential(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn set(&self, key: &str) -> Result<(), ValetError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, key.trim()).map_err(|e| {
            ValetError::Credential(format!("Failed to write {}: {}", self.path.display(), e))
        })?;
        restrict_permissions(&self.path)?;
        debug!(path = %self.path.display(), "API key stored");
        Ok(())
    }

    fn clear(&self) -> Result<(), ValetError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "API key cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ValetError::Credential(format!(
                "Failed to remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), ValetError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), ValetError> {
    Ok(())
}
