//! End-to-end behaviour of the view over every volatile backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Namespace, volatile_namespaces};
use namespace_md::*;

#[test]
fn tree_size_follows_file_size() {
    for (backend, ns) in volatile_namespaces() {
        ns.view.create_container("/a", false).unwrap();
        ns.view.create_container("/a/b", false).unwrap();
        ns.file_with_size("/a/b/f", 100);

        assert_eq!(ns.tree_size("/a"), 100, "{backend}");
        assert_eq!(ns.tree_size("/a/b"), 100, "{backend}");
        assert_eq!(ns.tree_size("/"), 100, "{backend}");

        let file = ns.view.get_file("/a/b/f", true).unwrap();
        file.write().set_size(40);
        ns.view.update_file_store(&file).unwrap();
        assert_eq!(ns.tree_size("/a"), 40, "{backend}");
    }
}

#[test]
fn non_recursive_remove_refuses_populated_container() {
    for (backend, ns) in volatile_namespaces() {
        ns.view.create_container("/a/b", true).unwrap();
        ns.file_with_size("/a/b/f", 10);
        ns.file_with_size("/a/g", 5);

        assert!(
            matches!(
                ns.view.remove_container("/a", false),
                Err(NsError::NotEmpty { .. })
            ),
            "{backend}"
        );
        ns.view.remove_container("/a", true).unwrap();

        assert!(ns.view.get_container("/a").unwrap_err().is_not_found(), "{backend}");
        assert_eq!(ns.tree_size("/"), 0, "{backend}");
        assert_eq!(ns.files.num_files().unwrap(), 0, "{backend}");
        assert_eq!(ns.containers.num_containers().unwrap(), 1, "{backend}");
    }
}

#[test]
fn recursive_remove_drops_replica_lists() {
    let ns = Namespace::in_memory();
    ns.view.create_container("/d", false).unwrap();
    let file = ns.view.create_file("/d/f", 0, 0).unwrap();
    file.write().add_location(7);
    ns.view.update_file_store(&file).unwrap();

    ns.view.remove_container("/d", true).unwrap();
    assert_eq!(file.read().num_locations(), 0);
    assert_eq!(file.read().num_unlinked_locations(), 0);
}

#[test]
fn root_cannot_be_removed() {
    let ns = Namespace::in_memory();
    assert!(matches!(
        ns.view.remove_container("/", true),
        Err(NsError::PermissionDenied { .. })
    ));
}

#[test]
fn dangling_entries_read_as_absent() {
    for (backend, ns) in volatile_namespaces() {
        ns.view.create_container("/d/sub", true).unwrap();
        let f = ns.view.create_file("/d/f", 0, 0).unwrap().read().id();
        let g = ns.view.create_file("/d/g", 0, 0).unwrap().read().id();
        let sub = ns.view.get_container("/d/sub").unwrap().read().id();

        // Erase the records behind the view's back; the entries stay.
        ns.files.remove_file(f).unwrap();
        ns.files.remove_file(g).unwrap();
        ns.containers.remove_container(sub).unwrap();
        let listing = ns.view.list("/d").unwrap();
        assert_eq!(listing.files, vec!["f", "g"], "{backend}");
        assert_eq!(listing.containers, vec!["sub"], "{backend}");

        assert!(ns.view.get_file("/d/f", false).unwrap_err().is_not_found(), "{backend}");
        assert!(ns.view.get_container("/d/sub").unwrap_err().is_not_found(), "{backend}");
        let fresh = ns.view.create_file("/d/f", 0, 0).unwrap();
        assert_ne!(fresh.read().id(), f, "{backend}");
        assert!(
            Arc::ptr_eq(&ns.view.get_file("/d/f", false).unwrap(), &fresh),
            "{backend}"
        );

        ns.view.remove_container("/d", true).unwrap();
        assert!(ns.view.get_container("/d").unwrap_err().is_not_found(), "{backend}");
        assert_eq!(ns.files.num_files().unwrap(), 0, "{backend}");
        assert_eq!(ns.containers.num_containers().unwrap(), 1, "{backend}");
        assert!(ns.view.list("/").unwrap().containers.is_empty(), "{backend}");
    }
}

#[test]
fn rename_file_onto_sibling_container_fails() {
    for (backend, ns) in volatile_namespaces() {
        ns.view.create_container("/d/sub", true).unwrap();
        let file = ns.view.create_file("/d/f", 0, 0).unwrap();

        assert!(
            matches!(
                ns.view.rename_file("/d/f", "sub"),
                Err(NsError::AlreadyExists { .. })
            ),
            "{backend}"
        );
        let found = ns.view.get_file("/d/f", false).unwrap();
        assert!(Arc::ptr_eq(&found, &file), "{backend}");
        assert_eq!(found.read().name(), "f", "{backend}");
    }
}

#[test]
fn remove_file_waits_for_replicas() {
    for (backend, ns) in volatile_namespaces() {
        let file = ns.view.create_file("/x", 0, 0).unwrap();
        file.write().add_location(5);
        ns.view.update_file_store(&file).unwrap();

        assert!(
            matches!(ns.view.remove_file("/x"), Err(NsError::InvalidState { .. })),
            "{backend}"
        );
        assert!(ns.view.get_file("/x", false).is_ok(), "{backend}");

        {
            let mut guard = file.write();
            guard.unlink_location(5);
            guard.remove_location(5);
        }
        ns.view.update_file_store(&file).unwrap();
        ns.view.remove_file("/x").unwrap();
        assert!(ns.view.get_file("/x", false).unwrap_err().is_not_found(), "{backend}");
    }
}

#[test]
fn link_is_followed_to_its_target() {
    for (backend, ns) in volatile_namespaces() {
        ns.view.create_container("/a", false).unwrap();
        let target = ns.view.create_file("/a/b", 0, 0).unwrap();
        ns.view.create_link("/link", "/a/b").unwrap();

        let found = ns.view.get_file("/link", true).unwrap();
        assert_eq!(found.read().id(), target.read().id(), "{backend}");
        let link = ns.view.get_file("/link", false).unwrap();
        assert_eq!(link.read().link(), Some("/a/b"), "{backend}");
    }
}

#[test]
fn link_chains_stop_after_255_hops() {
    let ns = Namespace::in_memory();
    ns.view.create_file("/target", 0, 0).unwrap();
    ns.view.create_container("/dir", false).unwrap();

    // f1 -> f2 -> ... -> f255 -> /target, and the same towards /dir.
    for i in 1..=MAX_SYMLINK_DEPTH {
        let (file_next, dir_next) = if i == MAX_SYMLINK_DEPTH {
            ("/target".to_string(), "/dir".to_string())
        } else {
            (format!("/f{}", i + 1), format!("/d{}", i + 1))
        };
        ns.view.create_link(&format!("/f{i}"), &file_next).unwrap();
        ns.view.create_link(&format!("/d{i}"), &dir_next).unwrap();
    }

    let file = ns.view.get_file("/f1", true).unwrap();
    assert_eq!(file.read().name(), "target");
    let dir = ns.view.get_container("/d1").unwrap();
    assert_eq!(dir.read().name(), "dir");

    ns.view.create_link("/f0", "/f1").unwrap();
    ns.view.create_link("/d0", "/d1").unwrap();
    assert!(matches!(
        ns.view.get_file("/f0", true),
        Err(NsError::TooManySymlinks { .. })
    ));
    assert!(matches!(
        ns.view.get_container("/d0"),
        Err(NsError::TooManySymlinks { .. })
    ));
}

#[test]
fn mtime_propagates_through_opted_in_ancestors() {
    for (backend, ns) in volatile_namespaces() {
        ns.view.create_container("/a/b/c", true).unwrap();
        for path in ["/", "/a", "/a/b", "/a/b/c"] {
            let container = ns.view.get_container(path).unwrap();
            container
                .write()
                .set_attribute(SYNC_TIME_ATTR, "1")
                .unwrap();
            ns.view.update_container_store(&container).unwrap();
        }

        ns.view.create_file("/a/b/c/f", 0, 0).unwrap();
        let leaf = ns.view.get_container("/a/b/c").unwrap().read().mtime();
        for path in ["/", "/a", "/a/b", "/a/b/c"] {
            let tmtime = ns.view.get_container(path).unwrap().read().tmtime();
            assert!(tmtime >= leaf, "{backend}: {path} tmtime {tmtime:?} < {leaf:?}");
        }
    }
}

#[test]
fn background_propagation_settles_on_flush() {
    common::init_tracing();
    let containers: Arc<dyn ContainerMdSvc> = Arc::new(InMemoryContainerMdSvc::new());
    let files: Arc<dyn FileMdSvc> = Arc::new(InMemoryFileMdSvc::new());
    let sync_time = Arc::new(SyncTimeAccounting::with_worker(
        &containers,
        Duration::from_millis(5),
    ));
    containers.add_change_listener(sync_time.clone());
    let view = HierarchicalView::new(containers, files);
    view.initialize().unwrap();

    let dir = view.create_container("/a", false).unwrap();
    dir.write().set_attribute(SYNC_TIME_ATTR, "1").unwrap();
    view.update_container_store(&dir).unwrap();
    view.create_file("/a/f", 0, 0).unwrap();
    sync_time.flush();

    let mtime = dir.read().mtime();
    assert!(dir.read().tmtime() >= mtime);
    assert!(view.get_container("/").unwrap().read().tmtime() >= mtime);
}

#[test]
fn quota_node_lifecycle() {
    let ns = Namespace::in_memory();
    let project = ns.view.create_container("/project", false).unwrap();
    let data = ns.view.create_container("/project/data", false).unwrap();

    let node = ns.view.register_quota_node(&project).unwrap();
    node.add_file(1000, 100, 4096, 8192);
    assert!(project.read().is_quota_node());
    let found = ns.view.get_quota_node(&data, true).unwrap().unwrap();
    assert_eq!(found.container_id(), project.read().id());

    ns.view.remove_quota_node(&project).unwrap();
    assert!(!project.read().is_quota_node());
    let root = ns.quota.get_quota_node(ROOT_ID).unwrap();
    assert_eq!(root.usage().user(1000).space, 4096);
    assert_eq!(ns.quota.node_ids(), vec![ROOT_ID]);
}

#[test]
fn real_path_rewrites_resolved_prefix() {
    let ns = Namespace::in_memory();
    ns.view.create_container("/store/2024", true).unwrap();
    ns.view.create_link("/current", "store/2024").unwrap();
    assert_eq!(
        ns.view.get_real_path("/current/run/../out").unwrap(),
        "/store/2024/out"
    );
    assert_eq!(ns.view.get_real_path("/current").unwrap(), "/store/2024/");
    assert_eq!(ns.view.get_real_path("/nowhere/x").unwrap(), "/nowhere/x");
}

#[test]
fn events_reach_registered_listeners() {
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<FileMdEvent>>);

    impl FileMdChangeListener for Recorder {
        fn file_md_changed(&self, event: &FileMdEvent) {
            self.0.lock().push(*event);
        }
    }

    let ns = Namespace::in_memory();
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    ns.files.add_change_listener(recorder.clone());
    ns.view.create_container("/d", false).unwrap();
    let file = ns.view.create_file("/d/f", 0, 0).unwrap();
    let id = file.read().id();
    file.write().set_size(12);
    file.write().add_location(3);
    ns.view.update_file_store(&file).unwrap();

    let events = recorder.0.lock().clone();
    assert!(events.iter().all(|e| e.file_id == id));
    let changes: Vec<_> = events.iter().map(|e| e.change).collect();
    assert!(changes.contains(&FileChange::SizeChange(12)));
    assert!(changes.contains(&FileChange::LocationAdded(3)));
    assert_eq!(changes.last(), Some(&FileChange::Updated));
}
