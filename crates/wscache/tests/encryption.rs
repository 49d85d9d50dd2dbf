//! Encryption-at-rest behaviour: keys, rotation and tampering.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use encmap::{MasterKeyProvider, FILE_KEY_LEN};
use parking_lot::Mutex;
use uuid::Uuid;
use wscache::{CacheConfig, EncryptionConfig, WriteSetCache, PREAMBLE_LEN, SEQNO_ILL};

/// In-memory keyring whose keys survive across cache reopens.
fn provider() -> Arc<MasterKeyProvider> {
    let keys: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    let get_keys = Arc::clone(&keys);
    let create_keys = Arc::clone(&keys);
    Arc::new(MasterKeyProvider::new(
        Box::new(move |name| get_keys.lock().get(name).cloned()),
        Box::new(move |name| {
            let mut key = vec![0u8; FILE_KEY_LEN];
            for (i, b) in key.iter_mut().enumerate() {
                *b = (i * 31 + name.len() * 7) as u8;
            }
            create_keys.lock().insert(name.to_string(), key);
            true
        }),
    ))
}

fn config(dir: &tempfile::TempDir) -> CacheConfig {
    CacheConfig {
        name: dir.path().join("cache.ring"),
        size_bytes: 16384,
        enc: EncryptionConfig {
            enabled: true,
            cache_page_size: 4096,
            cache_total_size: 4 * 4096,
        },
        ..CacheConfig::default()
    }
}

fn open(
    config: &CacheConfig,
    gid: Uuid,
    provider: &Arc<MasterKeyProvider>,
) -> WriteSetCache {
    WriteSetCache::open(config, gid, Some(Arc::clone(provider)), None, None).expect("open cache")
}

fn put(cache: &WriteSetCache, seqno: i64, payload: &[u8]) {
    let off = cache.malloc(payload.len()).unwrap().expect("alloc");
    cache.write(off, payload).unwrap();
    cache.seqno_assign(off, seqno).unwrap();
    cache.free(off).unwrap();
}

#[test]
fn encrypted_ring_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    let gid = Uuid::new_v4();
    let provider = provider();

    let cache = open(&cfg, gid, &provider);
    assert_eq!(cache.master_key_id(), 1);
    for seqno in 1..=3i64 {
        put(&cache, seqno, &vec![0x60 + seqno as u8; 500]);
    }
    cache.close().unwrap();

    // The payload must not appear as plaintext anywhere in the file.
    let bytes = std::fs::read(&cfg.name).unwrap();
    assert!(
        !bytes.windows(500).any(|w| w == vec![0x61u8; 500].as_slice()),
        "payload leaked to disk in plaintext"
    );

    let cache = open(&cfg, gid, &provider);
    assert_eq!(cache.master_key_id(), 1);
    assert_eq!(cache.seqno_min(), 1);
    assert_eq!(cache.seqno_max(), 3);
    for seqno in 1..=3i64 {
        assert_eq!(
            cache.get(seqno).unwrap().unwrap(),
            vec![0x60 + seqno as u8; 500]
        );
    }
}

#[test]
fn master_key_rotation_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    let gid = Uuid::new_v4();
    let provider = provider();

    let cache = open(&cfg, gid, &provider);
    for seqno in 1..=3i64 {
        put(&cache, seqno, &vec![seqno as u8; 400]);
    }
    assert_eq!(cache.master_key_id(), 1);

    // The operator requests a rotation through the keyring side.
    let declined = provider.notify_rotation_request();
    assert!(!declined, "rotation observer must accept");
    assert_eq!(cache.master_key_id(), 2);
    cache.close().unwrap();

    // All write-sets still decrypt under the rewrapped file key.
    let cache = open(&cfg, gid, &provider);
    assert_eq!(cache.master_key_id(), 2);
    for seqno in 1..=3i64 {
        assert_eq!(cache.get(seqno).unwrap().unwrap(), vec![seqno as u8; 400]);
    }
}

#[test]
fn rotation_after_close_is_declined() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    let provider = provider();

    let cache = open(&cfg, Uuid::new_v4(), &provider);
    cache.close().unwrap();
    assert!(provider.notify_rotation_request());
}

#[test]
fn preamble_crc_tamper_forces_reset() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    let gid = Uuid::new_v4();
    let provider = provider();

    let cache = open(&cfg, gid, &provider);
    put(&cache, 1, &[0x77; 300]);
    cache.close().unwrap();

    // Flip one character inside the stored wrapped file key. The
    // preamble is plaintext, so this is a straight byte edit.
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cfg.name)
        .unwrap();
    let mut head = vec![0u8; PREAMBLE_LEN];
    file.read_exact(&mut head).unwrap();
    let text = String::from_utf8_lossy(&head).into_owned();
    let pos = text.find("enc_fk_id: ").expect("wrapped key line") + "enc_fk_id: ".len();
    head[pos] = if head[pos] == b'A' { b'B' } else { b'A' };
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&head).unwrap();
    drop(file);

    // The CRC no longer matches: the file key is abandoned and the ring
    // resets, but stays usable.
    let cache = open(&cfg, gid, &provider);
    assert_eq!(cache.seqno_min(), SEQNO_ILL);
    assert!(cache.get(1).unwrap().is_none());
    put(&cache, 1, &[0x33; 100]);
    assert_eq!(cache.get(1).unwrap().unwrap(), vec![0x33; 100]);
}

#[test]
fn switching_encryption_off_forces_reset() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    let gid = Uuid::new_v4();
    let provider = provider();

    let cache = open(&cfg, gid, &provider);
    put(&cache, 1, &[0x55; 200]);
    cache.close().unwrap();

    let plain_cfg = CacheConfig {
        enc: EncryptionConfig {
            enabled: false,
            ..cfg.enc
        },
        ..cfg.clone()
    };
    let cache = WriteSetCache::open(&plain_cfg, gid, None, None, None).unwrap();
    assert_eq!(cache.seqno_min(), SEQNO_ILL);
    let (cache_size, free, _, _, _) = cache.mem_stats();
    assert_eq!(free, cache_size);
}

#[test]
fn missing_keyring_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    let refusing = Arc::new(MasterKeyProvider::new(
        Box::new(|_| None),
        Box::new(|_| false),
    ));
    let err = WriteSetCache::open(&cfg, Uuid::new_v4(), Some(refusing), None, None);
    assert!(err.is_err());
}

#[test]
fn encryption_without_provider_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    assert!(WriteSetCache::open(&cfg, Uuid::new_v4(), None, None, None).is_err());
}
