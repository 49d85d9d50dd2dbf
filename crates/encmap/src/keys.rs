//! Master-key provider interface and file-key wrapping helpers.
//!
//! The keyring itself lives outside this crate (in the server's keyring
//! plugin, vault, etc.); it is modelled here as a pair of callbacks plus a
//! rotation-request observer. File keys are wrapped (encrypted) under the
//! current master key before they are persisted.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cipher::{StreamCipher, FILE_KEY_LEN};
use crate::error::EncMapResult;

/// Callback returning the key material registered under a name, or `None`
/// if the keyring has no such key.
pub type GetKeyFn = dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync;

/// Callback creating a key under a name; returns `false` on failure.
pub type CreateKeyFn = dyn Fn(&str) -> bool + Send + Sync;

/// Observer invoked when an operator requests a master-key rotation.
/// Returns `true` if the rotation was declined or failed.
pub type RotationObserverFn = dyn Fn() -> bool + Send + Sync;

/// Access to an external keyring holding named master keys.
///
/// Construction injects the two keyring callbacks; consumers register a
/// rotation observer that the embedding server triggers via
/// [`notify_rotation_request`](Self::notify_rotation_request).
pub struct MasterKeyProvider {
    get_key_cb: Box<GetKeyFn>,
    create_key_cb: Box<CreateKeyFn>,
    rotation_observer: Mutex<Box<RotationObserverFn>>,
}

impl MasterKeyProvider {
    pub fn new(get_key: Box<GetKeyFn>, create_key: Box<CreateKeyFn>) -> Self {
        Self {
            get_key_cb: get_key,
            create_key_cb: create_key,
            rotation_observer: Mutex::new(Box::new(|| true)),
        }
    }

    /// Fetches the key registered under `name`, if any.
    pub fn get_key(&self, name: &str) -> Option<Vec<u8>> {
        (self.get_key_cb)(name)
    }

    /// Creates a key under `name`; `false` if the keyring refused.
    pub fn create_key(&self, name: &str) -> bool {
        (self.create_key_cb)(name)
    }

    /// Replaces the rotation observer. The previous observer is dropped.
    pub fn register_key_rotation_request_observer(&self, observer: Box<RotationObserverFn>) {
        *self.rotation_observer.lock() = observer;
    }

    /// Invokes the registered rotation observer, returning its verdict
    /// (`true` means the rotation was declined or failed).
    pub fn notify_rotation_request(&self) -> bool {
        (self.rotation_observer.lock())()
    }
}

impl std::fmt::Debug for MasterKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeyProvider").finish_non_exhaustive()
    }
}

/// Composes the keyring name of a master key from the cache's constant
/// UUID, the current master-key UUID and the monotonic key id.
pub fn master_key_name(const_uuid: &Uuid, mk_uuid: &Uuid, mk_id: u32) -> String {
    format!("CacheKey-{mk_uuid}@{const_uuid}-{mk_id}")
}

/// Generates a fresh random file key.
pub fn generate_file_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; FILE_KEY_LEN]);
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypts `file_key` under `master_key` and returns it base64-encoded,
/// ready for the preamble.
pub fn wrap_key(file_key: &[u8], master_key: &[u8]) -> EncMapResult<String> {
    debug_assert_eq!(file_key.len(), FILE_KEY_LEN);
    let mut cipher = StreamCipher::new(master_key)?;
    let mut wrapped = file_key.to_vec();
    cipher.apply(&mut wrapped);
    Ok(BASE64.encode(&wrapped))
}

/// Decodes and decrypts a wrapped file key. Returns `None` if the base64
/// text or the resulting length is malformed.
pub fn unwrap_key(wrapped_b64: &str, master_key: &[u8]) -> EncMapResult<Option<Zeroizing<Vec<u8>>>> {
    let Ok(mut wrapped) = BASE64.decode(wrapped_b64) else {
        return Ok(None);
    };
    if wrapped.len() != FILE_KEY_LEN {
        return Ok(None);
    }
    let mut cipher = StreamCipher::new(master_key)?;
    cipher.apply(&mut wrapped);
    Ok(Some(Zeroizing::new(wrapped)))
}
