//! Filesystem operation benchmarks over the in-memory remote.

use cloudfs_fuse::config::FsConfig;
use cloudfs_fuse::lock::{LockMode, PathLocks};
use cloudfs_fuse::memory::MemoryStorage;
use cloudfs_fuse::CloudFs;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;

fn populated(files: usize, size: usize) -> Arc<MemoryStorage> {
    let remote = Arc::new(MemoryStorage::new());
    let body = vec![b'x'; size];
    for i in 0..files {
        remote.put_file(&format!("/data/dir-{}/file-{}.bin", i % 10, i), &body);
    }
    remote
}

fn bench_getattr_cached(c: &mut Criterion) {
    let remote = populated(100, 16);
    let fs = CloudFs::new(remote, FsConfig::default(), None);
    fs.getattr("/data/dir-3/file-13.bin").unwrap();

    c.bench_function("getattr_cached", |b| {
        b.iter(|| fs.getattr(black_box("/data/dir-3/file-13.bin")).unwrap());
    });
}

fn bench_readdir_cached(c: &mut Criterion) {
    let remote = populated(1000, 16);
    let fs = CloudFs::new(remote, FsConfig::default(), None);
    fs.readdir("/data/dir-7").unwrap();

    c.bench_function("readdir_100_cached", |b| {
        b.iter(|| fs.readdir(black_box("/data/dir-7")).unwrap());
    });
}

fn bench_read_cached_1mb(c: &mut Criterion) {
    let remote = populated(1, 1024 * 1024);
    let fs = CloudFs::new(remote, FsConfig::default(), None);
    let h = fs.open("/data/dir-0/file-0.bin", libc::O_RDONLY).unwrap();
    fs.read(h, 0, 1024 * 1024).unwrap();

    c.bench_function("read_1mb_cached", |b| {
        b.iter(|| fs.read(h, black_box(0), 1024 * 1024).unwrap());
    });
}

fn bench_write_flush_64k(c: &mut Criterion) {
    let remote = Arc::new(MemoryStorage::new());
    let fs = CloudFs::new(remote, FsConfig::default(), None);
    let block = vec![7u8; 64 * 1024];

    c.bench_function("write_release_64k", |b| {
        b.iter(|| {
            let h = fs.create("/bench.bin", libc::O_WRONLY | libc::O_TRUNC).unwrap();
            fs.write(h, 0, black_box(&block)).unwrap();
            fs.release(h).unwrap();
        });
    });
}

fn bench_path_locks(c: &mut Criterion) {
    let locks = PathLocks::new(Duration::from_secs(1));

    c.bench_function("lock_acquire_release", |b| {
        b.iter(|| {
            let _guard = locks.acquire(black_box("/a/b/c.txt"), LockMode::Write).unwrap();
        });
    });

    c.bench_function("lock_rename_pair", |b| {
        b.iter(|| {
            let _guard = locks
                .acquire_many(&[("/a/x", LockMode::Subtree), ("/b/y", LockMode::Subtree)])
                .unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_getattr_cached,
    bench_readdir_cached,
    bench_read_cached_1mb,
    bench_write_flush_64k,
    bench_path_locks
);
criterion_main!(benches);
