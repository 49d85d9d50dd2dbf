//! Master-key lookup and rotation protocol.
//!
//! The file key that encrypts the ring never changes while the file
//! lives; what rotates is the master key wrapping it. Master keys are
//! named `CacheKey-<mk_uuid>@<const_uuid>-<id>` with a monotonically
//! increasing id, so the presence of id `n + 1` in the keyring while the
//! preamble still points at `n` betrays an interrupted rotation (or a
//! restore from an old backup) — either way the current key chain may be
//! compromised and a brand new one is started.

use encmap::{generate_file_key, master_key_name, unwrap_key, wrap_key, MasterKeyProvider};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{CacheError, CacheResult};
use crate::preamble::EncState;

/// A plaintext file key.
pub type FileKey = Zeroizing<Vec<u8>>;

/// Creates a key that must not exist yet; returns its material.
///
/// `None` when the name is already taken or the keyring refuses.
fn generate_new_master_key(provider: &MasterKeyProvider, name: &str) -> Option<Vec<u8>> {
    if provider.get_key(name).is_some() {
        return None;
    }
    if !provider.create_key(name) {
        return None;
    }
    provider.get_key(name)
}

/// Outcome of [`open_keys`].
pub struct OpenedKeys {
    pub file_key: FileKey,
    /// The persisted key state changed in a way that invalidates the
    /// ring contents (fresh file key).
    pub force_reset: bool,
}

/// Establishes the master key and the plaintext file key at open time,
/// mutating `enc` to reflect any regeneration.
///
/// The caller has already cleared `enc`'s key material if the preamble
/// CRC did not check out.
pub fn open_keys(enc: &mut EncState, provider: &MasterKeyProvider) -> CacheResult<OpenedKeys> {
    let mut force_reset = false;

    let master = loop {
        if enc.mk_id == 0 || enc.mk_uuid.is_nil() {
            enc.mk_uuid = Uuid::new_v4();
            enc.mk_id = 1;
            let name = master_key_name(&enc.const_uuid, &enc.mk_uuid, enc.mk_id);
            info!(key = %name, "master key does not exist, generating a new one");
            // The name is freshly minted; failure here is a keyring
            // problem that a second attempt will not fix.
            break generate_new_master_key(provider, &name);
        }

        let name = master_key_name(&enc.const_uuid, &enc.mk_uuid, enc.mk_id);
        let mut master = provider.get_key(&name);

        let next_name = master_key_name(&enc.const_uuid, &enc.mk_uuid, enc.mk_id + 1);
        if master.is_none() {
            info!(
                key = %name,
                "ring is encrypted with a master key the keyring no longer has, generating a new one"
            );
        } else if provider.get_key(&next_name).is_some() {
            warn!(
                key = %name,
                next_key = %next_name,
                "successor master keys exist; an interrupted rotation or an old backup may have \
                 compromised the chain, starting a brand new key"
            );
            master = None;
        }

        if master.is_some() {
            break master;
        }
        enc.mk_id = 0;
        enc.wrapped_file_key.clear();
    };

    let master = master.ok_or_else(|| {
        CacheError::KeyMissing(
            "master key not generated or not found; check that the keyring is loaded \
             or disable cache encryption"
                .to_string(),
        )
    })?;

    let file_key = if enc.wrapped_file_key.is_empty() {
        info!("file key is empty, generating a new one; this forces a cache reset");
        let file_key = generate_file_key();
        enc.wrapped_file_key = wrap_key(&file_key, &master)?;
        force_reset = true;
        file_key
    } else {
        match unwrap_key(&enc.wrapped_file_key, &master)? {
            Some(key) => key,
            None => {
                warn!("stored file key is malformed, generating a new one; this forces a cache reset");
                let file_key = generate_file_key();
                enc.wrapped_file_key = wrap_key(&file_key, &master)?;
                force_reset = true;
                file_key
            }
        }
    };

    Ok(OpenedKeys {
        file_key,
        force_reset,
    })
}

/// Rotates the master key: re-wraps the file key under a freshly created
/// master key with the next id. Returns `true` when the state changed
/// (the caller must persist the preamble).
///
/// Any failure leaves the state untouched and is reported, not raised:
/// rotation is an operator convenience, not a correctness requirement.
pub fn rotate(enc: &mut EncState, provider: &MasterKeyProvider) -> CacheResult<bool> {
    let old_name = master_key_name(&enc.const_uuid, &enc.mk_uuid, enc.mk_id);
    let Some(old_master) = provider.get_key(&old_name) else {
        warn!(key = %old_name, "cannot rotate: current master key is missing from the keyring");
        return Ok(false);
    };

    let Some(file_key) = unwrap_key(&enc.wrapped_file_key, &old_master)? else {
        warn!("cannot rotate: stored file key does not unwrap");
        return Ok(false);
    };

    let new_name = master_key_name(&enc.const_uuid, &enc.mk_uuid, enc.mk_id + 1);
    let Some(new_master) = generate_new_master_key(provider, &new_name) else {
        info!(key = %new_name, "generation of the next master key failed, rotation skipped");
        return Ok(false);
    };

    enc.mk_id += 1;
    enc.wrapped_file_key = wrap_key(&file_key, &new_master)?;
    info!(key = %new_name, "master key rotated");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use encmap::FILE_KEY_LEN;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn provider() -> Arc<MasterKeyProvider> {
        let keys: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
        let get_keys = Arc::clone(&keys);
        let create_keys = Arc::clone(&keys);
        Arc::new(MasterKeyProvider::new(
            Box::new(move |name| get_keys.lock().get(name).cloned()),
            Box::new(move |name| {
                let mut key = vec![0u8; FILE_KEY_LEN];
                for (i, b) in key.iter_mut().enumerate() {
                    *b = (i + name.len()) as u8;
                }
                create_keys.lock().insert(name.to_string(), key);
                true
            }),
        ))
    }

    fn fresh_state() -> EncState {
        EncState {
            enabled: true,
            const_uuid: Uuid::new_v4(),
            ..EncState::default()
        }
    }

    #[test]
    fn first_open_generates_everything() {
        let provider = provider();
        let mut enc = fresh_state();
        let opened = open_keys(&mut enc, &provider).unwrap();
        assert!(opened.force_reset);
        assert_eq!(enc.mk_id, 1);
        assert!(!enc.mk_uuid.is_nil());
        assert!(!enc.wrapped_file_key.is_empty());
    }

    #[test]
    fn reopen_reuses_keys_without_reset() {
        let provider = provider();
        let mut enc = fresh_state();
        let first = open_keys(&mut enc, &provider).unwrap();

        let mut enc2 = enc.clone();
        let second = open_keys(&mut enc2, &provider).unwrap();
        assert!(!second.force_reset);
        assert_eq!(enc, enc2);
        assert_eq!(&*first.file_key, &*second.file_key);
    }

    #[test]
    fn rotation_bumps_id_and_preserves_file_key() {
        let provider = provider();
        let mut enc = fresh_state();
        let opened = open_keys(&mut enc, &provider).unwrap();

        assert!(rotate(&mut enc, &provider).unwrap());
        assert_eq!(enc.mk_id, 2);

        let reopened = open_keys(&mut enc.clone(), &provider).unwrap();
        assert!(!reopened.force_reset);
        assert_eq!(&*opened.file_key, &*reopened.file_key);
    }

    #[test]
    fn successor_key_forces_fresh_chain() {
        let provider = provider();
        let mut enc = fresh_state();
        open_keys(&mut enc, &provider).unwrap();

        // Plant the next key as if a rotation died before the preamble
        // write.
        let next = master_key_name(&enc.const_uuid, &enc.mk_uuid, enc.mk_id + 1);
        provider.create_key(&next);

        let old_uuid = enc.mk_uuid;
        let opened = open_keys(&mut enc, &provider).unwrap();
        assert!(opened.force_reset);
        assert_eq!(enc.mk_id, 1);
        assert_ne!(enc.mk_uuid, old_uuid);
    }

    #[test]
    fn missing_master_key_regenerates() {
        let provider = provider();
        let mut enc = fresh_state();
        open_keys(&mut enc, &provider).unwrap();

        // Pretend the keyring lost the key chain.
        enc.mk_uuid = Uuid::new_v4();
        let opened = open_keys(&mut enc, &provider).unwrap();
        assert!(opened.force_reset);
        assert_eq!(enc.mk_id, 1);
    }

    #[test]
    fn refusing_keyring_aborts_open() {
        let provider = Arc::new(MasterKeyProvider::new(
            Box::new(|_| None),
            Box::new(|_| false),
        ));
        let mut enc = fresh_state();
        assert!(matches!(
            open_keys(&mut enc, &provider),
            Err(CacheError::KeyMissing(_))
        ));
    }
}
