// Content cache behavior on a real (temporary) filesystem root.

use std::fs;

use attachment_engine::{BlobMeta, ContentCache};

const MB: usize = 1024 * 1024;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 13];

fn open_cache(root: &std::path::Path) -> ContentCache {
    ContentCache::open(root, "tester").unwrap()
}

#[test]
fn put_get_roundtrip_sniffs_mime() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    cache.put(
        "shot1",
        PNG_MAGIC,
        BlobMeta {
            name: Some("shot1".into()),
            ..BlobMeta::default()
        },
    );

    let blob = cache.get("shot1").unwrap();
    assert_eq!(blob.bytes, PNG_MAGIC);
    assert_eq!(blob.size, PNG_MAGIC.len() as u64);
    // No stored hint and no extension: the magic bytes decide.
    assert_eq!(blob.mime, "image/png");
    assert!(cache.contains("shot1"));
    assert!(cache.get("missing").is_none());
}

#[test]
fn survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = open_cache(dir.path());
        cache.put(
            "doc",
            b"hello",
            BlobMeta {
                mime: Some("text/plain".into()),
                name: Some("doc.txt".into()),
                ..BlobMeta::default()
            },
        );
    }
    let cache = open_cache(dir.path());
    let blob = cache.get("doc").unwrap();
    assert_eq!(blob.bytes, b"hello");
    assert_eq!(blob.mime, "text/plain");
}

#[test]
fn users_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let alice = ContentCache::open(dir.path(), "alice").unwrap();
    let bob = ContentCache::open(dir.path(), "bob").unwrap();

    alice.put("f1", b"alice-bytes", BlobMeta::default());
    assert!(alice.get("f1").is_some());
    assert!(bob.get("f1").is_none());
    assert_eq!(bob.usage().count, 0);
}

#[test]
fn cleanup_trims_to_budget_keeping_most_recent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    let blob = vec![7u8; MB];
    for i in 0..15 {
        cache.put(&format!("f{i}"), &blob, BlobMeta::default());
    }
    assert_eq!(cache.usage().total_bytes, 15 * MB as u64);

    let usage = cache.cleanup(10 * MB as u64, 0);
    assert_eq!(usage.removed, 5);
    assert!(usage.total_bytes <= 10 * MB as u64);
    assert_eq!(usage.count, 10);

    // The most recently written survive; the oldest five are gone.
    for i in 5..15 {
        assert!(cache.contains(&format!("f{i}")), "f{i} should remain");
    }
    for i in 0..5 {
        assert!(!cache.contains(&format!("f{i}")), "f{i} should be evicted");
        assert!(cache.get(&format!("f{i}")).is_none());
    }

    // Idempotent: a second pass finds nothing to do.
    let again = cache.cleanup(10 * MB as u64, 0);
    assert_eq!(again.removed, 0);
    assert_eq!(again.count, 10);
}

#[test]
fn recency_touch_changes_eviction_order() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    let blob = vec![1u8; MB];
    for i in 0..4 {
        cache.put(&format!("f{i}"), &blob, BlobMeta::default());
    }
    // Reading f0 moves it to the front of the recency order.
    assert!(cache.get("f0").is_some());

    let usage = cache.cleanup(2 * MB as u64, 0);
    assert_eq!(usage.removed, 2);
    assert!(cache.contains("f0"));
    assert!(cache.contains("f3"));
    assert!(!cache.contains("f1"));
    assert!(!cache.contains("f2"));
}

#[test]
fn index_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    for i in 0..85 {
        cache.put(&format!("f{i}"), b"x", BlobMeta::default());
    }
    let rows = cache.list();
    assert_eq!(rows.len(), 80);
    // MRU-front: the newest write leads, the first five writes fell off.
    assert_eq!(rows[0].file_id, "f84");
    assert!(!cache.contains("f0"));
    assert!(cache.get("f4").is_none());
}

#[test]
fn lost_payload_self_heals_index() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    cache.put("gone", b"payload", BlobMeta::default());
    assert!(cache.contains("gone"));

    // Simulate external deletion of the payload file.
    let user_dir = fs::read_dir(dir.path().join("files_v1"))
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.path().is_dir())
        .unwrap()
        .path();
    for entry in fs::read_dir(&user_dir).unwrap().filter_map(|e| e.ok()) {
        if entry.path().extension().map_or(false, |e| e == "bin") {
            fs::remove_file(entry.path()).unwrap();
        }
    }

    assert!(cache.get("gone").is_none());
    assert!(!cache.contains("gone"));
    assert_eq!(cache.usage().count, 0);
}

#[test]
fn remove_drops_payload_and_row() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    cache.put("f1", b"abc", BlobMeta::default());
    cache.remove("f1");
    assert!(!cache.contains("f1"));
    assert!(cache.get("f1").is_none());
    assert_eq!(cache.usage().total_bytes, 0);
}

#[test]
fn usage_reflects_index_only() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    cache.put("a", &[0u8; 100], BlobMeta::default());
    cache.put("b", &[0u8; 200], BlobMeta::default());

    let usage = cache.usage();
    assert_eq!(usage.total_bytes, 300);
    assert_eq!(usage.count, 2);
    assert!(usage.oldest_ts.is_some());
    assert!(usage.newest_ts >= usage.oldest_ts);
    assert_eq!(usage.removed, 0);
}
