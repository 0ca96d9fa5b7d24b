//! End-to-end submit/collect/release through real worker threads.

use std::collections::BTreeSet;
use std::path::Path;

use ioqueue::{BackendMode, IoQueue, IoQueueConfig, OpKind, SubmitErrorKind};

fn sync_config(depth: usize, workers: usize) -> IoQueueConfig {
    IoQueueConfig {
        backend: BackendMode::SyncOnly,
        ..IoQueueConfig::new(depth, workers)
    }
}

#[test]
fn depth_two_open_cancel_collect() {
    let mut q = IoQueue::<u32>::new(IoQueueConfig::new(2, 1)).expect("create queue");

    q.submit_open_dir(libc::AT_FDCWD, ".", 0, 1).expect("first open");
    q.submit_open_dir(libc::AT_FDCWD, ".", 0, 2).expect("second open");
    assert_eq!(q.capacity(), 0);

    q.cancel();

    let a = q.collect(true).expect("first completion");
    let b = q.collect(true).expect("second completion");
    assert_eq!(a.kind(), OpKind::OpenDir);
    assert_eq!(b.kind(), OpKind::OpenDir);
    for c in [&a, &b] {
        // Each open either ran before the cancel was observed or was cut short.
        assert!(c.is_ok() || c.raw_os_error() == Some(libc::EINTR), "{c:?}");
    }

    let mut tags = vec![q.release(a), q.release(b)];
    tags.sort_unstable();
    assert_eq!(tags, [1, 2]);

    assert_eq!(q.in_flight(), 0);
    assert!(q.collect(true).is_none());
    q.destroy();
}

#[test]
fn full_queue_refuses_until_release() {
    let mut q = IoQueue::<usize>::new(sync_config(4, 2)).expect("create queue");
    for tag in 0..4 {
        q.submit_nop(tag).expect("room left");
    }
    let err = q.submit_nop(99).expect_err("queue is full");
    assert_eq!(err.kind(), SubmitErrorKind::WouldBlock);
    assert_eq!(*err.tag(), 99);

    let c = q.collect(true).expect("completion");
    // Collected but not released still holds a slot.
    assert_eq!(
        q.submit_nop(100).expect_err("still full").kind(),
        SubmitErrorKind::WouldBlock
    );
    q.release(c);
    q.submit_nop(100).expect("slot freed by release");
}

#[test]
fn tags_come_back_as_a_set() {
    let mut q = IoQueue::<usize>::new(sync_config(16, 4)).expect("create queue");
    let total = 500;
    let mut next = 0;
    let mut seen = BTreeSet::new();

    while seen.len() < total {
        while next < total && q.capacity() > 0 {
            q.submit_nop(next).expect("capacity checked");
            next += 1;
        }
        let c = q.collect(true).expect("something is in flight");
        assert!(c.is_ok());
        let tag = q.release(c);
        assert!(seen.insert(tag), "tag {tag} returned twice");
    }

    assert_eq!(seen, (0..total).collect::<BTreeSet<_>>());
    let stats = q.destroy();
    assert_eq!(stats.total().requests, total as u64);
}

#[test]
fn released_record_is_reused_with_new_generation() {
    let mut q = IoQueue::<()>::new(sync_config(1, 1)).expect("create queue");

    q.submit_nop(()).expect("submit");
    let first = q.collect(true).expect("completion");
    let first_id = first.id();
    q.release(first);
    assert!(q.collect(true).is_none(), "released record must not come back");

    q.submit_nop(()).expect("resubmit");
    let second = q.collect(true).expect("completion");
    assert_eq!(second.id().index(), first_id.index());
    assert_ne!(second.id().generation(), first_id.generation());
    q.release(second);
}

#[test]
fn open_dir_lists_entries_and_close_dir_releases() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    for name in ["one", "two", "three"] {
        std::fs::write(tmp.path().join(name), name).expect("write file");
    }
    std::fs::create_dir(tmp.path().join("nested")).expect("create dir");

    let mut q = IoQueue::<&'static str>::with_depth(4, 2).expect("create queue");
    q.submit_open_dir(libc::AT_FDCWD, tmp.path(), 0, "open")
        .expect("submit open");

    let mut c = q.collect(true).expect("completion");
    let dir = c.take_dir().expect("directory output");
    assert!(c.take_dir().is_none());
    assert_eq!(q.release(c), "open");

    let mut names: Vec<_> = dir
        .entries()
        .iter()
        .map(|e| e.name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["nested", "one", "three", "two"]);

    q.submit_close_dir(dir, "close").expect("submit close");
    let c = q.collect(true).expect("completion");
    assert_eq!(c.kind(), OpKind::CloseDir);
    assert!(c.is_ok(), "{c:?}");
    q.release(c);
}

#[test]
fn open_relative_to_base_descriptor() {
    use std::os::fd::AsRawFd;

    let tmp = tempfile::tempdir().expect("create temp dir");
    std::fs::create_dir(tmp.path().join("inner")).expect("create dir");
    std::fs::write(tmp.path().join("inner/file"), b"x").expect("write file");
    let base = ioqueue::Dir::open_at(
        libc::AT_FDCWD,
        &std::ffi::CString::new(tmp.path().to_str().expect("utf-8")).expect("no NUL"),
        0,
    )
    .expect("open base");

    let mut q = IoQueue::<u8>::with_depth(2, 1).expect("create queue");
    q.submit_open_dir(base.as_raw_fd(), Path::new("inner"), 0, 0)
        .expect("submit open");
    q.submit_stat(base.as_raw_fd(), "inner/file", false, 1)
        .expect("submit stat");

    for _ in 0..2 {
        let mut c = q.collect(true).expect("completion");
        match c.kind() {
            OpKind::OpenDir => {
                let dir = c.take_dir().expect("directory");
                assert_eq!(dir.entries().len(), 1);
                dir.close().expect("close");
            }
            OpKind::Stat => assert_eq!(c.stat().expect("stat").size, 1),
            other => panic!("unexpected {other:?}"),
        }
        q.release(c);
    }
    base.close().expect("close base");
}

#[test]
fn errors_keep_errno() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    std::fs::write(tmp.path().join("file"), b"").expect("write file");

    let mut q = IoQueue::<i32>::new(sync_config(2, 1)).expect("create queue");
    q.submit_open_dir(libc::AT_FDCWD, tmp.path().join("missing"), 0, libc::ENOENT)
        .expect("submit");
    q.submit_open_dir(libc::AT_FDCWD, tmp.path().join("file"), 0, libc::ENOTDIR)
        .expect("submit");

    for _ in 0..2 {
        let c = q.collect(true).expect("completion");
        assert_eq!(c.raw_os_error(), Some(*c.tag()));
        assert!(c.output().is_none());
        q.release(c);
    }
}

#[test]
fn submit_error_converts_to_io_error() {
    let mut q = IoQueue::<()>::new(sync_config(1, 1)).expect("create queue");
    q.submit_nop(()).expect("submit");
    let err: std::io::Error = q.submit_nop(()).expect_err("full").into();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
}
