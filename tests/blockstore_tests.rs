use std::sync::Arc;

use blockstore::{BlockStorage, BlockStore, BlockStoreError, FileMeta, FileOpts, MemoryStorage};
use serde_json::json;

fn test_store(part_size: i64) -> (Arc<MemoryStorage>, BlockStore) {
    let storage = Arc::new(MemoryStorage::new());
    let store = BlockStore::builder()
        .with_storage(storage.clone())
        .with_part_size(part_size)
        .build();
    (storage, store)
}

#[tokio::test]
async fn append_round_trip() {
    let (storage, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    store.append_data("a", "m", b"hello").await.unwrap();
    store.append_data("a", "m", b" world").await.unwrap();

    let (offset, data) = store.read_file("a", "m").await.unwrap();
    assert_eq!(offset, 0);
    assert_eq!(&data[..], b"hello world");

    store.flush_cache().await.unwrap();
    let file = storage.get_file("a", "m").await.unwrap().unwrap();
    assert_eq!(file.size, 11);
    let parts = storage.get_parts("a", "m", &[0, 1]).await.unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(&parts[&0][..], b"hello world");
}

#[tokio::test]
async fn append_spans_parts() {
    let (storage, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    let payload: Vec<u8> = (0..20u8).collect();
    store.append_data("a", "m", &payload).await.unwrap();

    let (_, data) = store.read_file("a", "m").await.unwrap();
    assert_eq!(&data[..], &payload[..]);

    store.flush_cache().await.unwrap();
    let parts = storage.get_parts("a", "m", &[0, 1]).await.unwrap();
    assert_eq!(&parts[&0][..], &payload[..16]);
    assert_eq!(&parts[&1][..], &payload[16..]);
}

#[tokio::test]
async fn write_file_round_trip() {
    let (_, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    let payload = b"some content crossing a part boundary".to_vec();
    store.write_file("a", "m", &payload).await.unwrap();

    let (offset, data) = store.read_file("a", "m").await.unwrap();
    assert_eq!(offset, 0);
    assert_eq!(&data[..], &payload[..]);

    // a shorter rewrite truncates
    store.write_file("a", "m", b"short").await.unwrap();
    let file = store.stat("a", "m").await.unwrap();
    assert_eq!(file.size, 5);
    let (_, data) = store.read_file("a", "m").await.unwrap();
    assert_eq!(&data[..], b"short");
}

#[tokio::test]
async fn write_at_overlapping_writes() {
    let (_, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    store.write_at("a", "m", 0, b"abcd").await.unwrap();
    store.write_at("a", "m", 2, b"XY").await.unwrap();

    let (_, data) = store.read_file("a", "m").await.unwrap();
    assert_eq!(&data[..], b"abXY");
    assert_eq!(store.stat("a", "m").await.unwrap().size, 4);
}

#[tokio::test]
async fn write_at_round_trip() {
    let (_, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    store
        .write_file("a", "m", b"0123456789abcdefghij")
        .await
        .unwrap();
    store.write_at("a", "m", 14, b"WXYZ").await.unwrap();

    let (offset, data) = store.read_at("a", "m", 14, 4).await.unwrap();
    assert_eq!(offset, 14);
    assert_eq!(&data[..], b"WXYZ");
    let (_, data) = store.read_file("a", "m").await.unwrap();
    assert_eq!(&data[..], b"0123456789abcdWXYZij");
}

#[tokio::test]
async fn read_at_clamps_to_live_data() {
    let (_, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    store.append_data("a", "m", b"hello world").await.unwrap();

    let (offset, data) = store.read_at("a", "m", 6, 100).await.unwrap();
    assert_eq!(offset, 6);
    assert_eq!(&data[..], b"world");
}

#[tokio::test]
async fn write_at_rejects_bad_offsets() {
    let (_, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();

    let err = store.write_at("a", "m", -1, b"x").await.unwrap_err();
    assert!(matches!(err, BlockStoreError::InvalidArgument(_)));

    // no sparse holes: the file is empty, so offset 1 is past the end
    let err = store.write_at("a", "m", 1, b"x").await.unwrap_err();
    assert!(matches!(err, BlockStoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn make_file_validates_options() {
    let (_, store) = test_store(16);
    let err = store
        .make_file(
            "a",
            "m",
            FileMeta::new(),
            FileOpts {
                max_size: -1,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BlockStoreError::InvalidArgument(_)));

    let err = store
        .make_file(
            "a",
            "m",
            FileMeta::new(),
            FileOpts {
                max_size: 0,
                circular: true,
                ijson: false,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BlockStoreError::InvalidArgument(_)));

    let err = store
        .make_file(
            "a",
            "m",
            FileMeta::new(),
            FileOpts {
                max_size: 64,
                circular: true,
                ijson: true,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BlockStoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn make_file_twice_fails() {
    let (_, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();

    // nothing cached yet: the duplicate is caught by the backing store
    let err = store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BlockStoreError::FileExists));

    // and again once the entry is resident
    store.append_data("a", "m", b"x").await.unwrap();
    let err = store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BlockStoreError::FileExists));
}

#[tokio::test]
async fn write_meta_merge_and_replace() {
    let (_, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();

    let mut meta = FileMeta::new();
    meta.insert("k2".to_string(), json!("v"));
    meta.insert("k3".to_string(), json!(3));
    store.write_meta("a", "m", meta, false).await.unwrap();

    let mut patch = FileMeta::new();
    patch.insert("k1".to_string(), json!(1));
    patch.insert("k2".to_string(), serde_json::Value::Null);
    store.write_meta("a", "m", patch, true).await.unwrap();

    let file = store.stat("a", "m").await.unwrap();
    assert_eq!(file.meta.len(), 2);
    assert_eq!(file.meta["k1"], json!(1));
    assert_eq!(file.meta["k3"], json!(3));
}

#[tokio::test]
async fn delete_file_removes_everywhere() {
    let (storage, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    store.append_data("a", "m", b"payload").await.unwrap();
    store.flush_cache().await.unwrap();

    store.delete_file("a", "m").await.unwrap();
    assert!(matches!(
        store.stat("a", "m").await.unwrap_err(),
        BlockStoreError::NotFound
    ));
    assert!(matches!(
        store.read_file("a", "m").await.unwrap_err(),
        BlockStoreError::NotFound
    ));
    assert!(store.list_files("a").await.unwrap().is_empty());
    assert!(storage.get_file("a", "m").await.unwrap().is_none());
}

#[tokio::test]
async fn list_files_washes_through_cache() {
    let (_, store) = test_store(16);
    store
        .make_file("a", "one", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    store
        .make_file("a", "two", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    // "one" grows in the cache only; the backing store still has size 0
    store.append_data("a", "one", b"grow").await.unwrap();

    let files = store.list_files("a").await.unwrap();
    assert_eq!(files.len(), 2);
    let one = files.iter().find(|f| f.name == "one").unwrap();
    let two = files.iter().find(|f| f.name == "two").unwrap();
    assert_eq!(one.size, 4);
    assert_eq!(two.size, 0);

    store.delete_file("a", "two").await.unwrap();
    let files = store.list_files("a").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "one");
}

#[tokio::test]
async fn delete_block_clears_namespace() {
    let (_, store) = test_store(16);
    store
        .make_file("a", "one", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    store
        .make_file("a", "two", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    store
        .make_file("b", "other", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();

    assert_eq!(
        store.get_all_block_ids().await.unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );

    store.delete_block("a").await.unwrap();
    assert!(store.list_files("a").await.unwrap().is_empty());
    assert_eq!(store.get_all_block_ids().await.unwrap(), vec!["b".to_string()]);
}

#[tokio::test]
async fn stat_reads_through_to_storage() {
    let (_, store) = test_store(16);
    store
        .make_file("a", "m", FileMeta::new(), FileOpts::default())
        .await
        .unwrap();
    // make_file leaves no cache entry behind
    assert_eq!(store.cache_size(), 0);
    let file = store.stat("a", "m").await.unwrap();
    assert_eq!(file.size, 0);
    assert_eq!(store.cache_size(), 0);

    assert!(matches!(
        store.stat("a", "missing").await.unwrap_err(),
        BlockStoreError::NotFound
    ));
}
