//! Ticket API credentials in the OS credential store.
//!
//! Windows Credential Manager, macOS Keychain or the Linux Secret Service,
//! via `keyring`. The access token never touches SQLite or the logs.

use keyring::Entry;
use tracing::{info, warn};
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "the-small-pos-outbox";

const KEY_ACCESS_TOKEN: &str = "ticket_api_access_token";

/// Retrieve a single credential. `None` when the entry does not exist or the
/// platform store cannot be read.
pub fn get_credential(key: &str) -> Option<Zeroizing<String>> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(Zeroizing::new(pw)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), keyring::Error> {
    Entry::new(SERVICE_NAME, key)?.set_password(value)
}

/// Delete a credential. Succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), keyring::Error> {
    match Entry::new(SERVICE_NAME, key)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Bearer token for the ticket API, if one has been provisioned.
pub fn access_token() -> Option<Zeroizing<String>> {
    get_credential(KEY_ACCESS_TOKEN).filter(|token| !token.trim().is_empty())
}

pub fn store_access_token(token: &str) -> Result<(), keyring::Error> {
    set_credential(KEY_ACCESS_TOKEN, token.trim())?;
    info!("Ticket API access token stored");
    Ok(())
}

pub fn clear_access_token() -> Result<(), keyring::Error> {
    delete_credential(KEY_ACCESS_TOKEN)?;
    info!("Ticket API access token cleared");
    Ok(())
}
