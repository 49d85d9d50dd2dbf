//! End-to-end recovery behaviour over real ring files.

use std::io::{Read, Seek, SeekFrom, Write};

use uuid::Uuid;
use wscache::{CacheConfig, Offset, WriteSetCache, HEADER_SIZE, PREAMBLE_LEN, RESERVED_LEN, SEQNO_ILL};

const DATA_START: usize = PREAMBLE_LEN + RESERVED_LEN;

fn config(dir: &tempfile::TempDir, size_bytes: usize) -> CacheConfig {
    CacheConfig {
        name: dir.path().join("cache.ring"),
        size_bytes,
        ..CacheConfig::default()
    }
}

fn open(config: &CacheConfig, gid: Uuid) -> WriteSetCache {
    WriteSetCache::open(config, gid, None, None, None).expect("open cache")
}

fn put(cache: &WriteSetCache, seqno: i64, payload: &[u8]) -> Offset {
    let off = cache.malloc(payload.len()).unwrap().expect("alloc");
    cache.write(off, payload).unwrap();
    cache.seqno_assign(off, seqno).unwrap();
    cache.free(off).unwrap();
    off
}

#[test]
fn clean_close_reopen_is_identical() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    for seqno in 1..=5i64 {
        put(&cache, seqno, &vec![seqno as u8; 200]);
    }
    let stats = cache.mem_stats();
    let cursors = cache.cursors();
    cache.close().unwrap();

    let cache = open(&cfg, gid);
    assert_eq!(cache.gid(), gid);
    assert_eq!(cache.seqno_min(), 1);
    assert_eq!(cache.seqno_max(), 5);
    assert_eq!(cache.mem_stats(), stats);
    assert_eq!(cache.cursors(), cursors);
    for seqno in 1..=5i64 {
        assert_eq!(cache.get(seqno).unwrap().unwrap(), vec![seqno as u8; 200]);
    }
}

#[test]
fn clean_close_reopen_after_discards() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    for seqno in 1..=5i64 {
        put(&cache, seqno, &vec![seqno as u8; 200]);
    }
    assert!(cache.seqno_release(2).unwrap());
    cache.close().unwrap();

    let cache = open(&cfg, gid);
    assert_eq!(cache.seqno_min(), 3);
    assert_eq!(cache.seqno_max(), 5);
    assert!(cache.get(2).unwrap().is_none());
    assert_eq!(cache.get(4).unwrap().unwrap(), vec![4u8; 200]);
}

#[test]
fn crash_recovery_rebuilds_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    for seqno in 1..=4i64 {
        put(&cache, seqno, &vec![0x40 + seqno as u8; 300]);
    }
    // No clean shutdown: the preamble stays unsynced and the next open
    // has to rescan the file blind.
    drop(cache);

    let cache = open(&cfg, gid);
    assert_eq!(cache.seqno_min(), 1);
    assert_eq!(cache.seqno_max(), 4);
    for seqno in 1..=4i64 {
        assert_eq!(
            cache.get(seqno).unwrap().unwrap(),
            vec![0x40 + seqno as u8; 300]
        );
    }
    let (cache_size, free, used, released, _trail) = cache.mem_stats();
    assert_eq!(used, 0);
    assert_eq!(free + released, cache_size);
}

#[test]
fn crash_recovery_drops_unordered_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    // An ordered buffer still owned by the replicator...
    let a = cache.malloc(100).unwrap().unwrap();
    cache.write(a, &[1u8; 100]).unwrap();
    cache.seqno_assign(a, 1).unwrap();
    // ...and an in-flight buffer that never got a seqno.
    let b = cache.malloc(100).unwrap().unwrap();
    cache.write(b, &[2u8; 100]).unwrap();
    drop(cache);

    let cache = open(&cfg, gid);
    // The ordered buffer is recovered even though it was never released;
    // the unordered one is gone.
    assert_eq!(cache.seqno_min(), 1);
    assert_eq!(cache.seqno_max(), 1);
    assert_eq!(cache.get(1).unwrap().unwrap(), vec![1u8; 100]);
    let (_, _, used, _, _) = cache.mem_stats();
    assert_eq!(used, 0);
}

#[test]
fn crash_recovery_of_a_wrapped_ring() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    for seqno in 1..=30i64 {
        put(&cache, seqno, &vec![seqno as u8; 700]);
        if seqno > 10 {
            assert!(cache.seqno_release(seqno - 10).unwrap());
        }
    }
    let (_, _, _, _, trail) = cache.mem_stats();
    assert!(trail > 0, "the workload must wrap the ring");
    drop(cache);

    let cache = open(&cfg, gid);
    assert_eq!(cache.seqno_max(), 30);
    let min = cache.seqno_min();
    assert!(min <= 21, "gapless suffix must cover the retained window");
    for seqno in min..=30 {
        assert_eq!(
            cache.get(seqno).unwrap().unwrap(),
            vec![seqno as u8; 700],
            "payload of write-set {seqno}"
        );
    }
    let (cache_size, free, used, released, _) = cache.mem_stats();
    assert_eq!(used, 0);
    assert_eq!(free + released, cache_size);
}

#[test]
fn wrapped_clean_close_reopens_with_offset_hint() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    for seqno in 1..=14i64 {
        put(&cache, seqno, &vec![seqno as u8; 700]);
        if seqno > 8 {
            assert!(cache.seqno_release(seqno - 8).unwrap());
        }
    }
    let (_, _, _, _, trail) = cache.mem_stats();
    assert!(trail > 0, "the workload must wrap the ring");
    let max_before = cache.seqno_max();
    cache.close().unwrap();

    let cache = open(&cfg, gid);
    assert_eq!(cache.seqno_max(), max_before);
    for seqno in cache.seqno_min()..=max_before {
        assert_eq!(cache.get(seqno).unwrap().unwrap(), vec![seqno as u8; 700]);
    }
}

/// Overwrites the stored seqno of the buffer whose header sits at
/// `hdr_off` in the ring file.
fn patch_seqno(path: &std::path::Path, hdr_off: usize, seqno: i64) {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    file.seek(SeekFrom::Start(hdr_off as u64 + 8)).unwrap();
    file.write_all(&seqno.to_le_bytes()).unwrap();
}

#[test]
fn collision_with_identical_payload_keeps_one_copy() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    // Two buffers with identical payloads; sizes match so the headers
    // agree on everything but the seqno.
    let cache = open(&cfg, gid);
    put(&cache, 42, &[0xab; 96]);
    put(&cache, 43, &[0xab; 96]);
    drop(cache);

    // Forge the second buffer's seqno so both claim 42.
    let buf_total = HEADER_SIZE + 96;
    patch_seqno(&cfg.name, DATA_START + buf_total, 42);

    let cache = open(&cfg, gid);
    assert_eq!(cache.seqno_min(), 42);
    assert_eq!(cache.seqno_max(), 42);
    assert_eq!(cache.get(42).unwrap().unwrap(), vec![0xab; 96]);
}

#[test]
fn collision_with_different_payload_discards_both() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    put(&cache, 42, &[0xab; 96]);
    put(&cache, 43, &[0xcd; 96]);
    put(&cache, 44, &[0xef; 96]);
    drop(cache);

    let buf_total = HEADER_SIZE + 96;
    patch_seqno(&cfg.name, DATA_START + buf_total, 42);

    // Both 42s are poisoned and everything at or below the collision is
    // purged; the index restarts above it.
    let cache = open(&cfg, gid);
    assert_eq!(cache.seqno_min(), 44);
    assert_eq!(cache.seqno_max(), 44);
    assert!(cache.get(42).unwrap().is_none());
    assert_eq!(cache.get(44).unwrap().unwrap(), vec![0xef; 96]);
}

#[test]
fn collision_reaching_the_newest_write_set_resets() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    put(&cache, 42, &[0xab; 96]);
    put(&cache, 43, &[0xcd; 96]);
    drop(cache);

    let buf_total = HEADER_SIZE + 96;
    patch_seqno(&cfg.name, DATA_START + buf_total, 42);

    // With no write-set above the poisoned pair, nothing is salvageable.
    let cache = open(&cfg, gid);
    assert_eq!(cache.seqno_min(), SEQNO_ILL);
    assert_eq!(cache.seqno_max(), SEQNO_ILL);
    let (cache_size, free, _, _, _) = cache.mem_stats();
    assert_eq!(free, cache_size);
}

#[test]
fn corrupted_tail_keeps_the_scanned_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    for seqno in 1..=3i64 {
        put(&cache, seqno, &vec![seqno as u8; 96]);
    }
    drop(cache);

    // Smash the third buffer's header. A buffer only counts while the
    // header after it still validates, so the scan keeps the first
    // write-set and drops the rest of the segment.
    let buf_total = HEADER_SIZE + 96;
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cfg.name)
        .unwrap();
    file.seek(SeekFrom::Start((DATA_START + 2 * buf_total) as u64))
        .unwrap();
    file.write_all(&[0xff; 32]).unwrap();
    drop(file);

    let cache = open(&cfg, gid);
    assert_eq!(cache.seqno_min(), 1);
    assert_eq!(cache.seqno_max(), 1);
    assert_eq!(cache.get(1).unwrap().unwrap(), vec![1u8; 96]);
    assert!(cache.get(3).unwrap().is_none());
}

#[test]
fn history_change_invalidates_cached_seqnos() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    for seqno in 1..=3i64 {
        put(&cache, seqno, &vec![seqno as u8; 100]);
    }

    let new_gid = Uuid::new_v4();
    cache.seqno_reset(new_gid, 0).unwrap();
    assert_eq!(cache.gid(), new_gid);
    assert_eq!(cache.seqno_min(), SEQNO_ILL);
    assert!(cache.get(1).unwrap().is_none());

    // The new history works immediately.
    put(&cache, 1, &[0x11; 100]);
    assert_eq!(cache.get(1).unwrap().unwrap(), vec![0x11; 100]);
}

#[test]
fn recovery_reports_scan_progress() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    for seqno in 1..=6i64 {
        put(&cache, seqno, &vec![seqno as u8; 400]);
    }
    drop(cache);

    let calls = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
    let seen = std::sync::Arc::clone(&calls);
    let progress: wscache::ProgressFn = Box::new(move |total, done| {
        assert!(done <= total);
        seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    });
    let cache = WriteSetCache::open(&cfg, gid, None, None, Some(progress)).unwrap();
    assert_eq!(cache.seqno_max(), 6);
    assert!(calls.load(std::sync::atomic::Ordering::Relaxed) > 0);
}

#[test]
fn dump_map_walks_the_chains() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let cache = open(&cfg, Uuid::new_v4());

    put(&cache, 1, &[1u8; 200]);
    put(&cache, 2, &[2u8; 200]);
    let _inflight = cache.malloc(100).unwrap().unwrap();

    cache.set_debug(true);
    cache.dump_map().unwrap();
    assert!(cache.allocated_high_water() > 0);
}

#[test]
fn preamble_survives_in_plain_text() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 8192);
    let gid = Uuid::new_v4();

    let cache = open(&cfg, gid);
    cache.close().unwrap();

    let mut head = vec![0u8; PREAMBLE_LEN];
    let mut file = std::fs::File::open(&cfg.name).unwrap();
    file.read_exact(&mut head).unwrap();
    let text = String::from_utf8_lossy(&head);
    assert!(text.contains("Version: 2"));
    assert!(text.contains(&format!("GID: {gid}")));
    assert!(text.contains("synced: 1"));
}
