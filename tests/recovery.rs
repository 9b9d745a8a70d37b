//! # Recovery Tests
//!
//! The exclusive rescan: discards torn or corrupted entries, keeps
//! committed ones, repairs a clobbered header under an asserted
//! configuration, and is idempotent on clean regions.

use coremap::{Store, StoreBuilder, StoreError};
use tempfile::tempdir;

fn builder() -> StoreBuilder {
    Store::builder()
        .segments(1)
        .entries_per_segment(16)
        .average_key_size(8)
        .average_value_size(16)
        .checksum_entries(true)
}

#[test]
fn recovery_on_clean_region_changes_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clean.cmap");

    {
        let store = builder().create(&path).unwrap();
        for i in 0..10u32 {
            store
                .put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        store.remove(b"k3").unwrap();
        store.flush().unwrap();
    }

    let store = builder().recover(&path, true).unwrap();
    assert_eq!(store.len(), 9);
    for i in 0..10u32 {
        let got = store.get(format!("k{i}").as_bytes()).unwrap();
        if i == 3 {
            assert_eq!(got, None);
        } else {
            assert_eq!(got.as_deref(), Some(format!("v{i}").as_bytes()));
        }
    }
}

#[test]
fn recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idem.cmap");

    {
        let store = builder().create(&path).unwrap();
        store.put(b"stable", b"value").unwrap();
        store.flush().unwrap();
    }

    for _ in 0..3 {
        let store = builder().recover(&path, true).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"stable").unwrap().as_deref(), Some(&b"value"[..]));
        store.flush().unwrap();
    }
}

#[test]
fn corrupted_entry_is_discarded_and_committed_entries_survive() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("torn.cmap");

    {
        let store = builder().create(&path).unwrap();
        store.put(b"good-1", b"committed-one").unwrap();
        store.put(b"good-2", b"committed-two").unwrap();
        store.put(b"victim", b"UNIQUE-PAYLOAD-MARKER").unwrap();
        store.flush().unwrap();
    }

    // Simulate a torn write: scribble over the victim's value bytes on
    // disk, leaving its already-stored checksum stale.
    let mut bytes = std::fs::read(&path).unwrap();
    let marker = b"UNIQUE-PAYLOAD-MARKER";
    let pos = bytes
        .windows(marker.len())
        .position(|w| w == marker)
        .expect("marker must be in the file");
    for b in &mut bytes[pos..pos + marker.len()] {
        *b ^= 0xA5;
    }
    std::fs::write(&path, &bytes).unwrap();

    let store = builder().recover(&path, true).unwrap();
    assert_eq!(store.get(b"victim").unwrap(), None, "torn entry must be discarded");
    assert_eq!(store.len(), 2);
    assert_eq!(
        store.get(b"good-1").unwrap().as_deref(),
        Some(&b"committed-one"[..])
    );
    assert_eq!(
        store.get(b"good-2").unwrap().as_deref(),
        Some(&b"committed-two"[..])
    );
}

#[test]
fn same_config_recovery_rewrites_clobbered_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("header.cmap");

    {
        let store = builder().create(&path).unwrap();
        store.put(b"k", b"v").unwrap();
        store.flush().unwrap();
    }

    // Clobber the magic.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[..4].copy_from_slice(b"XXXX");
    std::fs::write(&path, &bytes).unwrap();

    // Plain open must refuse.
    assert!(Store::builder().open(&path).is_err());

    // Same-config recovery rebuilds the header and keeps the data.
    let store = builder().recover(&path, true).unwrap();
    assert_eq!(store.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));

    // And the region opens normally again afterwards.
    drop(store);
    let store = Store::builder().open(&path).unwrap();
    assert_eq!(store.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
}

#[test]
fn self_describing_recovery_refuses_clobbered_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("refuse.cmap");

    {
        let store = builder().create(&path).unwrap();
        store.put(b"k", b"v").unwrap();
        store.flush().unwrap();
    }

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[..4].copy_from_slice(b"XXXX");
    std::fs::write(&path, &bytes).unwrap();

    let err = builder().recover(&path, false).unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::RecoveryFailed(_))
        ),
        "got: {err:#}"
    );
}

#[test]
fn same_config_recovery_rejects_mismatched_assertion() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mismatch.cmap");

    {
        let store = builder().create(&path).unwrap();
        store.put(b"k", b"v").unwrap();
        store.flush().unwrap();
    }

    // A different geometry asserted against a sane header.
    let err = Store::builder()
        .segments(8)
        .entries_per_segment(999)
        .recover(&path, true)
        .unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::RecoveryFailed(_))
        ),
        "got: {err:#}"
    );
}

#[test]
fn recovery_preserves_tier_chains() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tiers.cmap");

    let geometry = || {
        Store::builder()
            .segments(1)
            .entries_per_segment(2)
            .constant_sizes(4, 4)
            .max_bloat_factor(3.0)
    };

    {
        let store = geometry().create(&path).unwrap();
        for i in 0..6u32 {
            store.put(&i.to_le_bytes(), b"vvvv").unwrap();
        }
        store.flush().unwrap();
    }

    let store = geometry().recover(&path, true).unwrap();
    assert_eq!(store.len(), 6);
    for i in 0..6u32 {
        assert_eq!(
            store.get(&i.to_le_bytes()).unwrap().as_deref(),
            Some(&b"vvvv"[..])
        );
    }
    assert_eq!(store.segment_stats()[0].tiers, 3);
}

#[test]
fn recovery_rebuilds_after_removals() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("removals.cmap");

    {
        let store = builder().create(&path).unwrap();
        for i in 0..10u32 {
            store.put(format!("k{i}").as_bytes(), b"value").unwrap();
        }
        for i in [1u32, 4, 7] {
            store.remove(format!("k{i}").as_bytes()).unwrap();
        }
        store.flush().unwrap();
    }

    let store = builder().recover(&path, true).unwrap();
    assert_eq!(store.len(), 7, "removed entries must stay removed");
    for i in [1u32, 4, 7] {
        assert_eq!(store.get(format!("k{i}").as_bytes()).unwrap(), None);
    }
}

#[test]
fn mutations_work_after_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("after.cmap");

    {
        let store = builder().create(&path).unwrap();
        store.put(b"old", b"value").unwrap();
        store.flush().unwrap();
    }

    let store = builder().recover(&path, true).unwrap();
    store.put(b"new", b"entry").unwrap();
    store.remove(b"old").unwrap();

    assert_eq!(store.get(b"new").unwrap().as_deref(), Some(&b"entry"[..]));
    assert_eq!(store.get(b"old").unwrap(), None);
    assert_eq!(store.len(), 1);
}
