//! Hybrid-tier tests: file backend behavior and the RAM-over-file victim
//! configuration, including write-back promotion.

use std::sync::Arc;

use tempfile::TempDir;
use tiercache::{Cache, CacheBuilder, CacheConfig, Clock, ManualClock};

fn file_cache(dir: &TempDir, clock: &Arc<ManualClock>) -> Cache {
    let cfg = CacheConfig::file("disk")
        .with_segment_size(64 * 1024)
        .with_data_dir(dir.path().join("data"))
        .with_snapshot_dir(dir.path().join("snapshot"));
    CacheBuilder::new(cfg)
        .clock(clock.clone())
        .background(false)
        .build()
        .expect("failed to build file cache")
}

fn hybrid(dir: &TempDir) -> (Cache, Cache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let victim = file_cache(dir, &clock);
    let cfg = CacheConfig::offheap("mem")
        .with_max_size(256 * 1024)
        .with_segment_size(64 * 1024)
        .with_index_slots_power(2)
        .with_snapshot_dir(dir.path().join("snapshot"));
    let main = CacheBuilder::new(cfg)
        .clock(clock.clone())
        .background(false)
        .victim(victim.clone())
        .build()
        .expect("failed to build main cache");
    (main, victim, clock)
}

// =============================================================================
// File backend
// =============================================================================

#[test]
fn test_file_cache_round_trip_across_seal() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let cache = file_cache(&dir, &clock);

    let value = vec![3u8; 5000];
    // Enough items to roll several 64 KiB segments onto disk.
    for i in 0..40 {
        cache
            .put(format!("key-{i:03}").as_bytes(), &value, 0)
            .unwrap();
    }
    let mut buf = vec![0u8; 8192];
    for i in 0..40 {
        let n = cache
            .get(format!("key-{i:03}").as_bytes(), &mut buf)
            .unwrap_or_else(|| panic!("key {i} missing"));
        assert_eq!(n, value.len());
        assert_eq!(&buf[..n], &value[..]);
    }
    // Sealed segment files exist on disk.
    let data_dir = dir.path().join("data").join("disk");
    let files = std::fs::read_dir(&data_dir).unwrap().count();
    assert!(files > 0, "no segment files written");
}

#[test]
fn test_file_cache_save_load() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let cache = file_cache(&dir, &clock);
    let value = vec![4u8; 3000];
    for i in 0..30 {
        cache
            .put(format!("key-{i:03}").as_bytes(), &value, 0)
            .unwrap();
    }
    cache.save().unwrap();

    let restored = file_cache(&dir, &clock);
    restored.load().unwrap();
    let mut buf = vec![0u8; 4096];
    for i in 0..30 {
        let n = restored
            .get(format!("key-{i:03}").as_bytes(), &mut buf)
            .unwrap_or_else(|| panic!("key {i} missing after reload"));
        assert_eq!(n, value.len());
    }
}

// =============================================================================
// Victim tier
// =============================================================================

#[test]
fn test_miss_falls_through_to_victim() {
    let dir = TempDir::new().unwrap();
    let (main, victim, _) = hybrid(&dir);

    // Plant a key only in the victim tier.
    victim.put(b"below", b"deep-value", 0).unwrap();
    let mut buf = [0u8; 32];
    let n = main.get(b"below", &mut buf).expect("victim fall-through failed");
    assert_eq!(&buf[..n], b"deep-value");
}

#[test]
fn test_first_touch_through_main_promotes() {
    let dir = TempDir::new().unwrap();
    let (main, victim, _) = hybrid(&dir);

    // Plant the key directly in the victim tier, untouched since: its
    // entry has never been hit.
    victim.put(b"cold-start", b"value", 0).unwrap();

    // The very first read through the main tier promotes it.
    let mut buf = [0u8; 32];
    let n = main.get(b"cold-start", &mut buf).expect("victim hit failed");
    assert_eq!(&buf[..n], b"value");
    assert!(
        victim.get(b"cold-start", &mut buf).is_none(),
        "victim copy should be deleted by first-touch promotion"
    );
    // Resident in main now: re-reads never reach the victim tier.
    let victim_gets_before = victim.stats().gets;
    assert_eq!(main.get(b"cold-start", &mut buf), Some(5));
    assert_eq!(victim.stats().gets, victim_gets_before);
}

#[test]
fn test_eviction_spills_to_victim_and_promotes_back() {
    let dir = TempDir::new().unwrap();
    let (main, victim, _) = hybrid(&dir);

    let value = vec![5u8; 1000];
    let total = {
        // Fill past the start ratio so a scavenger pass has pressure.
        let mut i = 0u32;
        while main.usage() < 0.95 {
            main.put(format!("key-{i:05}").as_bytes(), &value, 0).unwrap();
            i += 1;
        }
        i
    };
    main.run_scavenger_once();
    assert!(
        victim.stats().items > 0,
        "scavenger transferred nothing to the victim tier"
    );

    // Find a key that now lives only in the victim tier.
    let mut buf = vec![0u8; 2048];
    let mut spilled = None;
    for i in 0..total {
        let key = format!("key-{i:05}");
        if victim.get(key.as_bytes(), &mut buf).is_some() {
            spilled = Some(key);
            break;
        }
    }
    let key = spilled.expect("no spilled key found in victim");

    // A main-tier get promotes it back and removes the victim copy.
    let n = main
        .get(key.as_bytes(), &mut buf)
        .expect("spilled key unreachable through main tier");
    assert_eq!(&buf[..n], &value[..]);
    assert!(
        victim.get(key.as_bytes(), &mut buf).is_none(),
        "victim copy should be deleted after promotion"
    );
    // Now resident in the main tier: victim stats stay flat on re-read.
    let victim_gets_before = victim.stats().gets;
    assert!(main.get(key.as_bytes(), &mut buf).is_some());
    assert_eq!(victim.stats().gets, victim_gets_before);
}

#[test]
fn test_victim_preserves_expiration_through_promotion() {
    let dir = TempDir::new().unwrap();
    let (main, victim, clock) = hybrid(&dir);

    // Plant directly in the victim with a deadline.
    let expire = clock.now_millis() + 60_000;
    victim.put(b"timed", b"value", expire).unwrap();

    let mut buf = [0u8; 32];
    let n = main.get(b"timed", &mut buf).expect("victim hit failed");
    assert_eq!(&buf[..n], b"value");
    // Promoted into main with the victim's deadline: expires there.
    clock.advance(120_000);
    assert!(main.get(b"timed", &mut buf).is_none());
}

#[test]
fn test_delete_falls_through_to_victim() {
    let dir = TempDir::new().unwrap();
    let (main, victim, _) = hybrid(&dir);
    victim.put(b"deep", b"v", 0).unwrap();
    assert!(main.delete(b"deep"));
    assert!(!main.delete(b"deep"));
    let mut buf = [0u8; 8];
    assert!(victim.get(b"deep", &mut buf).is_none());
}

#[test]
fn test_hybrid_save_load() {
    let dir = TempDir::new().unwrap();
    let (main, _victim, clock) = hybrid(&dir);

    let value = vec![6u8; 1000];
    let mut i = 0u32;
    while main.usage() < 0.95 {
        main.put(format!("key-{i:05}").as_bytes(), &value, 0).unwrap();
        i += 1;
    }
    main.run_scavenger_once();
    main.save().unwrap();
    let main_stats = main.stats();
    let victim_stats = main.victim().unwrap().stats();

    // Rebuild the same topology and load both tiers.
    let restored_victim = file_cache(&dir, &clock);
    let cfg = CacheConfig::offheap("mem")
        .with_max_size(256 * 1024)
        .with_segment_size(64 * 1024)
        .with_index_slots_power(2)
        .with_snapshot_dir(dir.path().join("snapshot"));
    let restored = CacheBuilder::new(cfg)
        .clock(clock.clone())
        .background(false)
        .victim(restored_victim)
        .build()
        .unwrap();
    restored.load().unwrap();

    assert_eq!(restored.stats().writes, main_stats.writes);
    assert_eq!(restored.stats().items, main_stats.items);
    assert_eq!(restored.victim().unwrap().stats().items, victim_stats.items);

    // Every key is reachable through the restored main tier.
    let mut buf = vec![0u8; 2048];
    let mut found = 0;
    for j in 0..i {
        if restored
            .get(format!("key-{j:05}").as_bytes(), &mut buf)
            .is_some()
        {
            found += 1;
        }
    }
    assert!(found > 0, "no keys survived the hybrid reload");
}
