//! Backend credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. The config file never holds the API
//! key; it lives here or in the environment.

use keyring::Entry;
use tracing::{info, warn};

use crate::error::{PosError, Result};

const SERVICE_NAME: &str = "pos-offline-sync";

// Credential keys
const KEY_REMOTE_URL: &str = "remote_url";
const KEY_REMOTE_API_KEY: &str = "remote_api_key";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_REMOTE_URL, KEY_REMOTE_API_KEY];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

fn keyring_error(e: keyring::Error) -> PosError {
    PosError::Config(format!("credential store: {e}"))
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(keyring_error)?;
    entry.set_password(value).map_err(keyring_error)?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(keyring_error)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(keyring_error(e)),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

pub fn get_api_key() -> Option<String> {
    get_credential(KEY_REMOTE_API_KEY).filter(|k| !k.trim().is_empty())
}

pub fn get_remote_url() -> Option<String> {
    get_credential(KEY_REMOTE_URL).filter(|u| !u.trim().is_empty())
}

/// Persist the backend URL and API key for this terminal.
pub fn store_backend_credentials(remote_url: &str, api_key: &str) -> Result<()> {
    let (remote_url, api_key) = validate_credentials(remote_url, api_key)?;
    set_credential(KEY_REMOTE_URL, &remote_url)?;
    set_credential(KEY_REMOTE_API_KEY, &api_key)?;
    info!(remote_url = %remote_url, "backend credentials stored");
    Ok(())
}

fn validate_credentials(remote_url: &str, api_key: &str) -> Result<(String, String)> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Err(PosError::Validation("Missing required field: api key".into()));
    }
    let remote_url = crate::remote::normalize_base_url(remote_url);
    if remote_url == "https://" || remote_url.is_empty() {
        return Err(PosError::Validation("Missing required field: remote url".into()));
    }
    Ok((remote_url, api_key.to_string()))
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<()> {
    info!("performing factory reset – deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
