//! End-to-end filesystem semantics over the in-memory remote.

use cloudfs_fuse::config::{FsConfig, WriterPolicy};
use cloudfs_fuse::error::FsError;
use cloudfs_fuse::memory::{Fault, MemoryStorage};
use cloudfs_fuse::retry::RetryPolicy;
use cloudfs_fuse::CloudFs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn config() -> FsConfig {
    FsConfig {
        retry: RetryPolicy::immediate(3),
        lock_timeout: Duration::from_millis(300),
        chunk_size: 8,
        ..FsConfig::default()
    }
}

fn mount_with(remote: &Arc<MemoryStorage>, config: FsConfig) -> CloudFs {
    CloudFs::new(remote.clone(), config, None)
}

fn mount(remote: &Arc<MemoryStorage>) -> CloudFs {
    mount_with(remote, config())
}

fn read_file(fs: &CloudFs, path: &str) -> Vec<u8> {
    let h = fs.open(path, libc::O_RDONLY).unwrap();
    let data = fs.read(h, 0, 1 << 20).unwrap();
    fs.release(h).unwrap();
    data
}

fn write_file(fs: &CloudFs, path: &str, data: &[u8]) {
    let h = fs.create(path, libc::O_WRONLY | libc::O_TRUNC).unwrap();
    fs.write(h, 0, data).unwrap();
    fs.release(h).unwrap();
}

#[test]
fn test_second_handle_sees_unflushed_writes() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/doc.txt", b"remote version");
    let fs = mount(&remote);

    let writer = fs.open("/doc.txt", libc::O_RDWR).unwrap();
    fs.write(writer, 0, b"LOCAL!").unwrap();

    let reader = fs.open("/doc.txt", libc::O_RDONLY).unwrap();
    assert_eq!(fs.read(reader, 0, 64).unwrap(), b"LOCAL! version");
    assert_eq!(remote.contents("/doc.txt").unwrap(), b"remote version");

    fs.release(reader).unwrap();
    fs.release(writer).unwrap();
    assert_eq!(remote.contents("/doc.txt").unwrap(), b"LOCAL! version");
}

#[test]
fn test_sparse_write_zero_fills_gap() {
    let remote = Arc::new(MemoryStorage::new());
    let fs = mount(&remote);

    let h = fs.create("/sparse", libc::O_RDWR).unwrap();
    fs.write(h, 4, b"xy").unwrap();
    assert_eq!(fs.read(h, 0, 16).unwrap(), b"\0\0\0\0xy");
    fs.release(h).unwrap();
    assert_eq!(remote.contents("/sparse").unwrap(), b"\0\0\0\0xy");
}

#[test]
fn test_getattr_after_flush_reflects_new_revision() {
    let remote = Arc::new(MemoryStorage::new());
    let old_rev = remote.put_file("/f", b"v1");
    let fs = mount(&remote);

    assert_eq!(read_file(&fs, "/f"), b"v1");
    write_file(&fs, "/f", b"version two");

    let attrs = fs.getattr("/f").unwrap();
    assert_eq!(attrs.size, 11);
    assert_ne!(attrs.revision.as_ref(), Some(&old_rev));

    // New content is served from the cache filled at upload time.
    let downloads = remote.calls("download");
    assert_eq!(read_file(&fs, "/f"), b"version two");
    assert_eq!(remote.calls("download"), downloads);
}

#[test]
fn test_out_of_band_update_is_seen_after_ttl() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/shared", b"first");
    let fs = mount_with(
        &remote,
        FsConfig {
            attr_ttl: Duration::ZERO,
            dir_ttl: Duration::ZERO,
            ..config()
        },
    );

    assert_eq!(read_file(&fs, "/shared"), b"first");
    remote.put_file("/shared", b"second edit");
    assert_eq!(fs.getattr("/shared").unwrap().size, 11);
    assert_eq!(read_file(&fs, "/shared"), b"second edit");
}

#[test]
fn test_read_retries_once_when_revision_changes_mid_read() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/big", b"aaaaaaaabbbbbbbbcccc");
    let fs = mount(&remote);

    let h = fs.open("/big", libc::O_RDONLY).unwrap();
    assert_eq!(fs.read(h, 0, 8).unwrap(), b"aaaaaaaa");

    // Same size, new revision: cached metadata still points at the old one.
    remote.put_file("/big", b"AAAAAAAABBBBBBBBCCCC");
    assert_eq!(fs.read(h, 8, 8).unwrap(), b"BBBBBBBB");
    fs.release(h).unwrap();
}

#[test]
fn test_out_of_band_delete_after_invalidation() {
    let remote = Arc::new(MemoryStorage::new());
    let fs = mount(&remote);

    fs.mkdir("/a").unwrap();
    write_file(&fs, "/a/b.txt", b"hi");
    assert_eq!(read_file(&fs, "/a/b.txt"), b"hi");

    remote.remove_tree("/a");
    // Still cached until told otherwise.
    assert!(fs.getattr("/a/b.txt").is_ok());

    fs.invalidate("/a/b.txt");
    let err = fs.getattr("/a/b.txt").unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)));
    assert_eq!(err.to_errno(), libc::ENOENT);
    fs.check_invariants().unwrap();
}

#[test]
fn test_out_of_band_delete_after_ttl_expiry() {
    let remote = Arc::new(MemoryStorage::new());
    let fs = mount_with(
        &remote,
        FsConfig {
            attr_ttl: Duration::ZERO,
            dir_ttl: Duration::ZERO,
            ..config()
        },
    );

    fs.mkdir("/a").unwrap();
    write_file(&fs, "/a/b.txt", b"hi");
    assert_eq!(read_file(&fs, "/a/b.txt"), b"hi");

    remote.remove_tree("/a");
    assert!(fs.getattr("/a/b.txt").unwrap_err().is_not_found());
    assert!(fs.getattr("/a").unwrap_err().is_not_found());
    assert!(fs.readdir("/").unwrap().is_empty());
}

#[test]
fn test_lost_create_response_does_not_duplicate() {
    let remote = Arc::new(MemoryStorage::new());
    let fs = mount(&remote);

    remote.inject("upload", Fault::LostResponse, 1);
    let h = fs.create("/once.txt", libc::O_WRONLY).unwrap();
    fs.write(h, 0, b"body").unwrap();
    fs.release(h).unwrap();

    assert_eq!(remote.file_count("/"), 1);
    assert_eq!(remote.contents("/once.txt").unwrap(), b"body");
}

#[test]
fn test_lost_upload_response_converges_on_latest_content() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/f", b"old");
    let fs = mount(&remote);

    let h = fs.open("/f", libc::O_WRONLY | libc::O_TRUNC).unwrap();
    fs.write(h, 0, b"new content").unwrap();
    // The upload lands but its response is lost; the retry then sees a
    // revision mismatch and re-uploads over the revision it produced.
    remote.inject("upload", Fault::LostResponse, 1);
    fs.release(h).unwrap();

    assert_eq!(remote.file_count("/"), 1);
    assert_eq!(remote.contents("/f").unwrap(), b"new content");
    assert!(!fs.is_dirty("/f"));
}

#[test]
fn test_lost_responses_on_namespace_operations() {
    let remote = Arc::new(MemoryStorage::new());
    let fs = mount(&remote);

    remote.inject("create_folder", Fault::LostResponse, 1);
    fs.mkdir("/dir").unwrap();
    assert!(fs.getattr("/dir").unwrap().is_dir());

    write_file(&fs, "/dir/x", b"1");
    remote.inject("move", Fault::LostResponse, 1);
    fs.rename("/dir/x", "/dir/y", false).unwrap();
    assert!(remote.exists("/dir/y"));
    assert!(!remote.exists("/dir/x"));

    remote.inject("delete", Fault::LostResponse, 1);
    fs.unlink("/dir/y").unwrap();
    assert!(!remote.exists("/dir/y"));
}

#[test]
fn test_concurrent_remote_edit_latest_write_wins() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/f", b"base");
    let fs = mount(&remote);

    let h = fs.open("/f", libc::O_RDWR).unwrap();
    fs.write(h, 0, b"mine").unwrap();
    remote.put_file("/f", b"theirs");
    fs.release(h).unwrap();

    assert_eq!(remote.contents("/f").unwrap(), b"mine");
}

#[test]
fn test_repeated_conflict_is_surfaced_and_data_kept() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/f", b"base");
    let fs = mount(&remote);

    let h = fs.open("/f", libc::O_RDWR).unwrap();
    fs.write(h, 0, b"MINE").unwrap();
    remote.inject("upload", Fault::Conflict, 2);

    let err = fs.flush(h).unwrap_err();
    assert!(matches!(err, FsError::Conflict(_)));
    assert_eq!(err.to_errno(), libc::EIO);
    assert!(fs.is_dirty("/f"));

    fs.release(h).unwrap();
    assert_eq!(remote.contents("/f").unwrap(), b"MINE");
}

#[test]
fn test_resident_content_stays_within_budget() {
    let remote = Arc::new(MemoryStorage::new());
    for i in 0..6 {
        remote.put_file(&format!("/file{}", i), &[b'a' + i as u8; 24]);
    }
    let budget = 32;
    let fs = mount_with(
        &remote,
        FsConfig {
            cache_budget: budget,
            ..config()
        },
    );

    for i in 0..6 {
        let data = read_file(&fs, &format!("/file{}", i));
        assert_eq!(data.len(), 24);
        let stats = fs.content_stats();
        assert!(stats.resident <= budget, "resident {} over budget", stats.resident);
    }
}

#[test]
fn test_large_staged_write_spools_to_disk() {
    let remote = Arc::new(MemoryStorage::new());
    let fs = mount_with(
        &remote,
        FsConfig {
            spool_threshold: 16,
            ..config()
        },
    );

    let payload: Vec<u8> = (0..200u8).collect();
    let h = fs.create("/blob", libc::O_RDWR).unwrap();
    for (i, chunk) in payload.chunks(50).enumerate() {
        fs.write(h, (i * 50) as u64, chunk).unwrap();
    }
    assert_eq!(fs.read(h, 100, 10).unwrap(), &payload[100..110]);
    fs.release(h).unwrap();
    assert_eq!(remote.contents("/blob").unwrap(), payload);
}

#[test]
fn test_rmdir_reverifies_emptiness_remotely() {
    let remote = Arc::new(MemoryStorage::new());
    let fs = mount(&remote);

    fs.mkdir("/d").unwrap();
    assert!(fs.readdir("/d").unwrap().is_empty());

    // Appears remotely while our listing is still fresh.
    remote.put_file("/d/late.txt", b"x");
    let err = fs.rmdir("/d").unwrap_err();
    assert!(matches!(err, FsError::NotEmpty(_)));
    assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    assert!(remote.exists("/d/late.txt"));

    let names: Vec<String> = fs.readdir("/d").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["late.txt".to_string()]);
}

#[test]
fn test_rmdir_of_empty_directory() {
    let remote = Arc::new(MemoryStorage::new());
    let fs = mount(&remote);
    fs.mkdir("/empty").unwrap();
    fs.rmdir("/empty").unwrap();
    assert!(!remote.exists("/empty"));
    assert!(fs.getattr("/empty").unwrap_err().is_not_found());
    assert!(matches!(fs.rmdir("/"), Err(FsError::InvalidArgument(_))));
}

#[test]
fn test_rmdir_refuses_directory_with_staged_file() {
    let remote = Arc::new(MemoryStorage::new());
    let fs = mount(&remote);
    fs.mkdir("/d").unwrap();
    let h = fs.create("/d/new", libc::O_WRONLY).unwrap();
    fs.write(h, 0, b"pending").unwrap();

    assert!(matches!(fs.rmdir("/d"), Err(FsError::NotEmpty(_))));
    fs.release(h).unwrap();
}

#[test]
fn test_readdir_overlays_staged_sizes() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/d/f", b"12");
    let fs = mount(&remote);

    let h = fs.open("/d/f", libc::O_WRONLY | libc::O_APPEND).unwrap();
    fs.write(h, 0, b"345").unwrap();
    let entries = fs.readdir("/d").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attrs.size, 5);
    fs.release(h).unwrap();
}

#[test]
fn test_directory_rename_moves_children() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/src/a", b"A");
    remote.put_file("/src/sub/b", b"B");
    let fs = mount(&remote);

    assert_eq!(read_file(&fs, "/src/sub/b"), b"B");
    fs.rename("/src", "/dst", false).unwrap();

    assert!(fs.getattr("/src").unwrap_err().is_not_found());
    assert_eq!(read_file(&fs, "/dst/sub/b"), b"B");
    assert_eq!(remote.contents("/dst/a").unwrap(), b"A");
    fs.check_invariants().unwrap();
}

#[test]
fn test_rename_onto_non_empty_directory_fails() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_dir("/x");
    remote.put_file("/y/keep", b"k");
    let fs = mount(&remote);
    assert!(matches!(fs.rename("/x", "/y", false), Err(FsError::NotEmpty(_))));
    assert!(remote.exists("/x"));
}

#[test]
fn test_rename_reverifies_destination_directory_remotely() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/src/a.txt", b"a");
    remote.put_dir("/dst");
    let fs = mount(&remote);

    // Cached as empty and still fresh when another client fills it.
    assert!(fs.readdir("/dst").unwrap().is_empty());
    remote.put_file("/dst/precious.txt", b"keep me");

    assert!(matches!(fs.rename("/src", "/dst", false), Err(FsError::NotEmpty(_))));
    assert_eq!(remote.contents("/dst/precious.txt").unwrap(), b"keep me");
    assert_eq!(remote.contents("/src/a.txt").unwrap(), b"a");
}

#[test]
fn test_failed_replacing_rename_keeps_source() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/new", b"new");
    remote.put_file("/old", b"old");
    let fs = mount(&remote);

    remote.inject("move", Fault::Network, 3);
    let err = fs.rename("/new", "/old", false).unwrap_err();
    assert!(matches!(err, FsError::RetriesExhausted { .. }));

    // No atomic replace remotely: the destination went first.
    assert!(!remote.exists("/old"));
    assert_eq!(read_file(&fs, "/new"), b"new");
    assert!(fs.getattr("/old").unwrap_err().is_not_found());
    fs.check_invariants().unwrap();
}

#[test]
fn test_reject_policy_refuses_second_writer() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/f", b"data");
    let fs = mount(&remote);

    let first = fs.open("/f", libc::O_RDWR).unwrap();
    fs.write(first, 0, b"DATA").unwrap();

    let err = fs.open("/f", libc::O_WRONLY).unwrap_err();
    assert!(matches!(err, FsError::Busy(_)));
    assert_eq!(err.to_errno(), libc::EAGAIN);

    // Readers are unaffected.
    let reader = fs.open("/f", libc::O_RDONLY).unwrap();
    fs.release(reader).unwrap();

    fs.release(first).unwrap();
    let second = fs.open("/f", libc::O_WRONLY).unwrap();
    fs.release(second).unwrap();
}

#[test]
fn test_reject_policy_applies_to_writes_on_shared_buffer() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/f", b"data");
    let fs = mount(&remote);

    let a = fs.open("/f", libc::O_WRONLY).unwrap();
    let b = fs.open("/f", libc::O_WRONLY).unwrap();
    fs.write(a, 0, b"A").unwrap();
    assert!(matches!(fs.write(b, 1, b"B"), Err(FsError::Busy(_))));

    fs.flush(a).unwrap();
    fs.write(b, 1, b"B").unwrap();
    fs.release(a).unwrap();
    fs.release(b).unwrap();
    assert_eq!(remote.contents("/f").unwrap(), b"ABta");
}

#[test]
fn test_queue_policy_waits_for_owner_flush() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/f", b"data");
    let fs = Arc::new(mount_with(
        &remote,
        FsConfig {
            writer_policy: WriterPolicy::Queue,
            lock_timeout: Duration::from_secs(5),
            ..config()
        },
    ));

    let first = fs.open("/f", libc::O_RDWR).unwrap();
    fs.write(first, 0, b"1111").unwrap();

    let fs2 = Arc::clone(&fs);
    let waiter = thread::spawn(move || {
        let h = fs2.open("/f", libc::O_WRONLY)?;
        fs2.write(h, 0, b"22")?;
        fs2.release(h)
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!waiter.is_finished());
    fs.release(first).unwrap();

    waiter.join().unwrap().unwrap();
    assert_eq!(remote.contents("/f").unwrap(), b"2211");
}

#[test]
fn test_queue_policy_times_out() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/f", b"data");
    let fs = mount_with(
        &remote,
        FsConfig {
            writer_policy: WriterPolicy::Queue,
            lock_timeout: Duration::from_millis(100),
            ..config()
        },
    );

    let first = fs.open("/f", libc::O_RDWR).unwrap();
    fs.write(first, 0, b"x").unwrap();
    assert!(matches!(fs.open("/f", libc::O_WRONLY), Err(FsError::Busy(_))));
    fs.release(first).unwrap();
}

#[test]
fn test_failed_release_keeps_data_for_unmount_flush() {
    let remote = Arc::new(MemoryStorage::new());
    let fs = mount(&remote);

    let h = fs.create("/report", libc::O_WRONLY).unwrap();
    fs.write(h, 0, b"quarterly").unwrap();
    remote.inject("upload", Fault::Network, 3);

    let err = fs.release(h).unwrap_err();
    assert!(matches!(err, FsError::RetriesExhausted { .. }));
    assert_eq!(err.to_errno(), libc::EIO);
    assert!(fs.is_dirty("/report"));
    // Staged content still answers reads.
    assert_eq!(read_file(&fs, "/report"), b"quarterly");

    fs.shutdown();
    assert_eq!(remote.contents("/report").unwrap(), b"quarterly");
}

#[test]
fn test_transient_failures_are_retried() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/f", b"content");
    let fs = mount(&remote);

    remote.inject("metadata", Fault::RateLimited, 2);
    assert_eq!(fs.getattr("/f").unwrap().size, 7);
    assert_eq!(remote.calls("metadata"), 3);
}

#[test]
fn test_operations_after_shutdown_fail_with_enotconn() {
    let remote = Arc::new(MemoryStorage::new());
    remote.put_file("/f", b"x");
    let fs = mount(&remote);
    let h = fs.open("/f", libc::O_RDONLY).unwrap();

    fs.shutdown();
    assert!(!fs.is_mounted());
    let err = fs.getattr("/f").unwrap_err();
    assert!(matches!(err, FsError::Unmounted));
    assert_eq!(err.to_errno(), libc::ENOTCONN);
    assert!(matches!(fs.read(h, 0, 1), Err(FsError::Unmounted)));
    assert!(matches!(fs.statfs(), Err(FsError::Unmounted)));
    // Closing is still allowed.
    fs.release(h).unwrap();
}
