//! The synchronous and io_uring backends must agree on every result.
//!
//! When the kernel refuses io_uring the preferred mode degrades to the
//! synchronous loop and this becomes a self-comparison, which still passes.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::unix::fs::symlink;
use std::path::Path;

use ioqueue::{BackendMode, FileKind, FileStat, IoQueue, IoQueueConfig, OpKind, Output};

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Nop,
    Closed,
    ClosedDir,
    Dir(Vec<(OsString, FileKind)>),
    Stat(FileStat),
    Err(Option<i32>),
}

fn build_tree(root: &Path) {
    std::fs::write(root.join("file"), b"twelve bytes").expect("write file");
    std::fs::create_dir(root.join("dir")).expect("create dir");
    std::fs::write(root.join("dir/inner"), b"").expect("write inner");
    symlink("file", root.join("link")).expect("create symlink");
    symlink("nowhere", root.join("dangling")).expect("create dangling symlink");
}

fn run(backend: BackendMode, root: &Path) -> BTreeMap<u32, (OpKind, Outcome)> {
    let mut q = IoQueue::<u32>::new(IoQueueConfig {
        backend,
        ..IoQueueConfig::new(16, 2)
    })
    .expect("create queue");

    let at = libc::AT_FDCWD;
    q.submit_nop(0).expect("nop");
    q.submit_open_dir(at, root, 0, 1).expect("open root");
    q.submit_open_dir(at, root.join("dir"), 0, 2).expect("open dir");
    q.submit_open_dir(at, root.join("missing"), 0, 3).expect("open missing");
    q.submit_open_dir(at, root.join("file"), 0, 4).expect("open file");
    q.submit_open_dir(at, root.join("link"), libc::O_NOFOLLOW, 5)
        .expect("open symlink");
    q.submit_stat(at, root.join("file"), true, 6).expect("stat file");
    q.submit_stat(at, root.join("link"), true, 7).expect("stat link");
    q.submit_stat(at, root.join("link"), false, 8).expect("lstat link");
    q.submit_stat(at, root.join("dangling"), true, 9)
        .expect("stat dangling");
    q.submit_stat(at, root.join("dir"), false, 10).expect("stat dir");
    let file = std::fs::File::open(root.join("file")).expect("open file");
    q.submit_close(file.into(), 11).expect("close");

    let mut out = BTreeMap::new();
    let mut dirs = Vec::new();
    while let Some(mut c) = q.collect(true) {
        let outcome = match c.take_dir() {
            Some(dir) => {
                let mut entries: Vec<_> = dir
                    .entries()
                    .iter()
                    .map(|e| (e.name().to_os_string(), e.kind()))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                dirs.push(dir);
                Outcome::Dir(entries)
            }
            None => match c.result() {
                Ok(Output::Nop) => Outcome::Nop,
                Ok(Output::Closed) => Outcome::Closed,
                Ok(Output::ClosedDir) => Outcome::ClosedDir,
                Ok(Output::Stat(st)) => Outcome::Stat(*st),
                Ok(Output::Dir(_)) => unreachable!("directory already taken"),
                Err(err) => Outcome::Err(err.raw_os_error()),
            },
        };
        let kind = c.kind();
        let tag = q.release(c);
        out.insert(tag, (kind, outcome));
    }

    for (i, dir) in dirs.into_iter().enumerate() {
        q.submit_close_dir(dir, 100 + i as u32).expect("close dir");
    }
    while let Some(c) = q.collect(true) {
        assert_eq!(c.kind(), OpKind::CloseDir);
        assert!(c.is_ok(), "{c:?}");
        q.release(c);
    }
    q.destroy();
    out
}

#[test]
fn sync_and_uring_agree() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    build_tree(tmp.path());

    let sync = run(BackendMode::SyncOnly, tmp.path());
    let uring = run(BackendMode::UringPreferred, tmp.path());

    assert_eq!(sync.len(), 12);
    assert_eq!(sync, uring);

    assert_eq!(sync[&3].1, Outcome::Err(Some(libc::ENOENT)));
    assert_eq!(sync[&4].1, Outcome::Err(Some(libc::ENOTDIR)));
    assert_eq!(sync[&9].1, Outcome::Err(Some(libc::ENOENT)));
    let Outcome::Stat(st) = &sync[&6].1 else {
        panic!("expected stat, got {:?}", sync[&6]);
    };
    assert_eq!(st.size, 12);
    assert_eq!(st.kind(), FileKind::Regular);
    let Outcome::Stat(st) = &sync[&8].1 else {
        panic!("expected lstat, got {:?}", sync[&8]);
    };
    assert_eq!(st.kind(), FileKind::Symlink);
}
