//! Restarting a namespace from its persisted state.

mod common;

use std::sync::Arc;

use common::{Namespace, check_tree};
use namespace_md::*;
use tempfile::tempdir;

fn populate(ns: &Namespace) {
    ns.view.create_container("/a/b", true).unwrap();
    ns.view.create_container("/gone", false).unwrap();
    ns.file_with_size("/a/b/f", 100);
    ns.file_with_size("/a/g", 20);
    let replicated = ns.file_with_size("/a/r", 1);
    replicated.write().add_location(4);
    ns.view.update_file_store(&replicated).unwrap();
    ns.view.create_link("/a/l", "b/f").unwrap();
    ns.view.remove_container("/gone", false).unwrap();
    ns.view.rename_file("/a/g", "h").unwrap();
}

fn verify(ns: &Namespace) {
    check_tree(ns);
    assert_eq!(ns.tree_size("/"), 121);
    assert_eq!(ns.tree_size("/a"), 121);
    assert_eq!(ns.tree_size("/a/b"), 100);

    let file = ns.view.get_file("/a/l", true).unwrap();
    assert_eq!(file.read().size(), 100);
    assert_eq!(ns.view.get_file_uri(&file).unwrap(), "/a/b/f");
    assert_eq!(ns.view.get_file("/a/h", false).unwrap().read().size(), 20);
    assert!(ns.view.get_file("/a/g", false).unwrap_err().is_not_found());
    assert!(ns.view.get_container("/gone").unwrap_err().is_not_found());
    assert_eq!(ns.view.get_file("/a/r", false).unwrap().read().locations(), &[4]);

    let listing = ns.view.list("/a").unwrap();
    assert_eq!(listing.containers, vec!["b"]);
    assert_eq!(listing.files, vec!["h", "l", "r"]);
}

#[test]
fn changelog_replay_restores_the_tree() {
    let dir = tempdir().unwrap();
    let before = {
        let ns = Namespace::with_changelogs(dir.path());
        populate(&ns);
        verify(&ns);
        let before = (ns.containers.num_containers().unwrap(), ns.files.num_files().unwrap());
        ns.view.finalize().unwrap();
        before
    };

    let ns = Namespace::with_changelogs(dir.path());
    verify(&ns);
    assert_eq!(
        (ns.containers.num_containers().unwrap(), ns.files.num_files().unwrap()),
        before
    );

    // /gone was #4; removed ids are not handed out again.
    let fresh = ns.view.create_container("/fresh", false).unwrap();
    assert!(fresh.read().id() > 4);
}

#[test]
fn restart_without_changes_leaves_changelogs_alone() {
    let dir = tempdir().unwrap();
    let log_sizes = || {
        ["containers.log", "files.log"]
            .map(|name| std::fs::metadata(dir.path().join(name)).unwrap().len())
    };
    {
        let ns = Namespace::with_changelogs(dir.path());
        populate(&ns);
        ns.view.finalize().unwrap();
    }
    let before = log_sizes();

    for _ in 0..2 {
        let ns = Namespace::with_changelogs(dir.path());
        verify(&ns);
        ns.view.finalize().unwrap();
        assert_eq!(log_sizes(), before);
    }
}

#[test]
fn sqlite_restart_restores_the_tree() {
    let dir = tempdir().unwrap();
    {
        let ns = Namespace::sqlite(dir.path());
        populate(&ns);
        verify(&ns);
        ns.view.finalize().unwrap();
    }

    let ns = Namespace::sqlite(dir.path());
    verify(&ns);
    let fresh = ns.view.create_container("/fresh", false).unwrap();
    assert!(fresh.read().id() > 4);
}

#[test]
fn kv_store_survives_service_restart() {
    let store = Arc::new(MemoryKvStore::new());
    {
        let ns = Namespace::kv(store.clone());
        populate(&ns);
        ns.view.finalize().unwrap();
    }
    let ns = Namespace::kv(store);
    verify(&ns);
}

#[test]
fn failed_batches_surface_every_failure() {
    let store = Arc::new(MemoryKvStore::new());
    let ns = Namespace::kv(store.clone());
    ns.view.create_container("/d", false).unwrap();
    store.set_read_only(true);

    let err = ns.view.create_container("/d/e", false).unwrap_err();
    assert!(matches!(err, NsError::Io { .. }), "{err}");
    assert_eq!(err.code(), codes::EIO);
}
