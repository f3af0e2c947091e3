use webserv::pages::{PageCache, PageError};

fn write_temp(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path.canonicalize().unwrap().to_string_lossy().into_owned()
}

#[test]
fn defaults_are_installed() {
    let mut cache = PageCache::new();
    cache.load_defaults();

    for key in ["default200", "default204", "default400", "default404"] {
        assert!(cache.contains(key), "missing {}", key);
    }
    let page = cache.get("default404").unwrap();
    let text = String::from_utf8_lossy(&page);
    assert!(text.contains("404"));
}

#[test]
fn load_defaults_twice_does_not_grow() {
    let mut cache = PageCache::new();
    cache.load_defaults();
    let size = cache.size();
    cache.load_defaults();
    assert_eq!(cache.size(), size);
}

#[test]
fn miss_reads_from_disk_then_hits() {
    let dir = tempfile::tempdir().unwrap();
    let key = write_temp(&dir, "page.html", b"<p>hi</p>");

    let mut cache = PageCache::new();
    let first = cache.get(&key).unwrap();
    assert_eq!(first.as_slice(), b"<p>hi</p>");
    assert!(cache.contains(&key));

    // A hit returns the same pinned buffer.
    let second = cache.get(&key).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}

#[test]
fn missing_file_is_not_found() {
    let mut cache = PageCache::new();
    let err = cache.get("/definitely/not/here.html").unwrap_err();
    assert_eq!(err, PageError::NotFound);
}

#[test]
fn oversized_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let key = write_temp(&dir, "big.bin", &vec![0u8; 4_194_305]);

    let mut cache = PageCache::new();
    let err = cache.get(&key).unwrap_err();
    assert_eq!(err, PageError::FileTooLarge);
    assert!(!cache.contains(&key));
}

#[test]
fn inserts_evict_until_the_bound_holds() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_temp(&dir, "a.bin", &vec![b'a'; 3_000_000]);
    let b = write_temp(&dir, "b.bin", &vec![b'b'; 3_000_000]);

    let mut cache = PageCache::new();
    cache.load_defaults();

    cache.get(&a).unwrap();
    assert!(cache.size() <= 4_194_304);

    let pinned = cache.get(&a).unwrap();
    cache.get(&b).unwrap();
    assert!(cache.size() <= 4_194_304);
    assert!(cache.contains(&b));

    // The evicted buffer stays readable through its refcount.
    assert_eq!(pinned.len(), 3_000_000);
    assert_eq!(pinned[0], b'a');
}

#[test]
fn clear_cache_empties_everything() {
    let mut cache = PageCache::new();
    cache.load_defaults();
    assert!(cache.size() > 0);

    cache.clear_cache();
    assert_eq!(cache.size(), 0);
    assert!(!cache.contains("default200"));
}
