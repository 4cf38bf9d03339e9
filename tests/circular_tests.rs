use blockstore::{BlockStore, FileMeta, FileOpts, MemoryStorage};
use std::sync::Arc;

fn test_store(part_size: i64) -> BlockStore {
    BlockStore::builder()
        .with_storage(Arc::new(MemoryStorage::new()))
        .with_part_size(part_size)
        .build()
}

fn circular(max_size: i64) -> FileOpts {
    FileOpts {
        max_size,
        circular: true,
        ijson: false,
    }
}

#[tokio::test]
async fn write_file_wraps_past_max_size() {
    let store = test_store(16);
    store
        .make_file("a", "c", FileMeta::new(), circular(32))
        .await
        .unwrap();
    store.write_file("a", "c", &[b'A'; 40]).await.unwrap();

    // only the most recent 32 bytes are retained, starting at offset 8
    let (offset, data) = store.read_file("a", "c").await.unwrap();
    assert_eq!(offset, 8);
    assert_eq!(data.len(), 32);
    assert!(data.iter().all(|&b| b == b'A'));
}

#[tokio::test]
async fn appends_retain_the_last_window() {
    let store = test_store(16);
    store
        .make_file("a", "c", FileMeta::new(), circular(32))
        .await
        .unwrap();
    for _ in 0..5 {
        store.append_data("a", "c", b"0123456789").await.unwrap();
    }

    let logical = b"0123456789".repeat(5);
    let (offset, data) = store.read_file("a", "c").await.unwrap();
    assert_eq!(offset, 18);
    assert_eq!(&data[..], &logical[18..50]);
}

#[tokio::test]
async fn write_at_before_window_is_a_noop() {
    let store = test_store(16);
    store
        .make_file("a", "c", FileMeta::new(), circular(32))
        .await
        .unwrap();
    store.append_data("a", "c", &[b'Z'; 64]).await.unwrap();

    store.write_at("a", "c", 0, b"XX").await.unwrap();

    let (offset, data) = store.read_file("a", "c").await.unwrap();
    assert_eq!(offset, 32);
    assert_eq!(data.len(), 32);
    assert!(data.iter().all(|&b| b == b'Z'));
    assert_eq!(store.stat("a", "c").await.unwrap().size, 64);
}

#[tokio::test]
async fn write_at_straddling_the_window_is_trimmed() {
    let store = test_store(16);
    store
        .make_file("a", "c", FileMeta::new(), circular(32))
        .await
        .unwrap();
    store.append_data("a", "c", &[b'Z'; 64]).await.unwrap();

    // bytes 30..32 fall before the window and are dropped; "cd" lands at 32
    store.write_at("a", "c", 30, b"abcd").await.unwrap();

    let (offset, data) = store.read_file("a", "c").await.unwrap();
    assert_eq!(offset, 32);
    assert_eq!(&data[..2], b"cd");
    assert!(data[2..].iter().all(|&b| b == b'Z'));
}

#[tokio::test]
async fn write_at_across_the_wrap_boundary() {
    let store = test_store(16);
    store
        .make_file("a", "c", FileMeta::new(), circular(32))
        .await
        .unwrap();
    store.write_file("a", "c", &[b'A'; 40]).await.unwrap();

    // logical 30..34 folds onto two different physical parts
    store.write_at("a", "c", 30, b"WXYZ").await.unwrap();

    let (offset, data) = store.read_file("a", "c").await.unwrap();
    assert_eq!(offset, 8);
    let mut expected = vec![b'A'; 22];
    expected.extend_from_slice(b"WXYZ");
    expected.extend_from_slice(&[b'A'; 6]);
    assert_eq!(&data[..], &expected[..]);
}

#[tokio::test]
async fn max_size_rounds_up_to_a_part_multiple() {
    let store = test_store(16);
    store
        .make_file("a", "c", FileMeta::new(), circular(20))
        .await
        .unwrap();
    let file = store.stat("a", "c").await.unwrap();
    assert_eq!(file.opts.max_size, 32);
}
