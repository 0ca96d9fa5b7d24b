//! Cancellation: closes still run, other work is cut short with `EINTR`.

use ioqueue::{
    Backend, BackendMode, IoQueue, IoQueueConfig, OpKind, Output, Returned, SubmitErrorKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Close(usize),
    Open(usize),
}

fn run_cancel_mix(backend: BackendMode) {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let depth = 64;
    let mut q = IoQueue::<Tag>::new(IoQueueConfig {
        backend,
        ..IoQueueConfig::new(depth, 2)
    })
    .expect("create queue");

    for i in 0..depth / 2 {
        let file = tempfile::tempfile().expect("create temp file");
        q.submit_close(file.into(), Tag::Close(i)).expect("submit close");
        q.submit_open_dir(libc::AT_FDCWD, tmp.path(), 0, Tag::Open(i))
            .expect("submit open");
    }
    q.cancel();

    let err = q.submit_nop(Tag::Open(usize::MAX)).expect_err("cancelled");
    assert_eq!(err.kind(), SubmitErrorKind::Cancelled);

    let mut closes = 0;
    let mut opens = 0;
    while let Some(mut c) = q.collect(true) {
        match *c.tag() {
            Tag::Close(_) => {
                assert_eq!(c.kind(), OpKind::Close);
                assert!(
                    matches!(c.result(), Ok(Output::Closed)),
                    "close must run after cancel: {c:?}"
                );
                closes += 1;
            }
            Tag::Open(_) => {
                assert_eq!(c.kind(), OpKind::OpenDir);
                if c.is_ok() {
                    c.take_dir().expect("dir").close().expect("close dir");
                } else {
                    assert_eq!(c.raw_os_error(), Some(libc::EINTR), "{c:?}");
                }
                opens += 1;
            }
        }
        q.release(c);
    }
    assert_eq!(closes, depth / 2);
    assert_eq!(opens, depth / 2);
    assert_eq!(q.in_flight(), 0);

    let stats = q.destroy();
    assert_eq!(stats.total().requests, depth as u64);
}

#[test]
fn cancel_drains_closes_sync() {
    run_cancel_mix(BackendMode::SyncOnly);
}

#[test]
fn cancel_drains_closes_preferred_backend() {
    run_cancel_mix(BackendMode::UringPreferred);
}

#[test]
fn submit_after_cancel_returns_descriptor() {
    let mut q = IoQueue::<u8>::new(IoQueueConfig {
        backend: BackendMode::SyncOnly,
        ..IoQueueConfig::new(4, 1)
    })
    .expect("create queue");
    q.cancel();
    let file = tempfile::tempfile().expect("create temp file");
    let err = q.submit_close(file.into(), 0).expect_err("cancelled");
    let (tag, resource) = err.into_parts();
    assert_eq!(tag, 0);
    let Some(Returned::Fd(fd)) = resource else {
        panic!("descriptor must be handed back");
    };
    drop(fd);
    assert!(q.collect(true).is_none());
}

#[test]
fn close_dir_after_cancel_still_closes() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let mut q = IoQueue::<&'static str>::with_depth(2, 1).expect("create queue");

    q.submit_open_dir(libc::AT_FDCWD, tmp.path(), 0, "open")
        .expect("submit open");
    let mut c = q.collect(true).expect("completion");
    let dir = c.take_dir().expect("open ran before cancel");
    q.release(c);

    q.cancel();
    assert!(q.is_cancelled());
    // New submissions are refused even for closes; the directory comes back.
    let err = q.submit_close_dir(dir, "close").expect_err("cancelled");
    assert_eq!(err.kind(), SubmitErrorKind::Cancelled);
    let (_, resource) = err.into_parts();
    let Some(Returned::Dir(dir)) = resource else {
        panic!("directory must be handed back");
    };
    dir.close().expect("close directory");
}

#[test]
fn destroy_reports_backend_per_worker() {
    let q = IoQueue::<()>::new(IoQueueConfig {
        backend: BackendMode::SyncOnly,
        ..IoQueueConfig::new(8, 3)
    })
    .expect("create queue");
    let stats = q.destroy();
    assert_eq!(stats.workers.len(), 3);
    assert_eq!(stats.count_backend(Backend::Sync), 3);
}
