//! End-to-end scenarios against the native Linux backend. These exercise
//! the inotify emitter: move pairing by cookie, catch-up under new
//! subdirectories, the access-event switch, and root-deletion teardown.

#![cfg(any(target_os = "linux", target_os = "android"))]

mod common;

use std::fs;
use std::time::Duration;

use common::*;
use vigil::{new_observer, Config, ObserverKind, RecursiveMode};

fn quick_config() -> Config {
    Config::default().with_dispatch_timeout(Duration::from_millis(100))
}

#[test]
fn the_native_backend_is_inotify() {
    let observer = new_observer(quick_config()).unwrap();
    assert_eq!(observer.kind(), ObserverKind::INotify);
}

#[test]
fn create_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let (handler, rx) = channel_handler();

    let observer = new_observer(quick_config()).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let file = root.join("a");
    fs::write(&file, b"hello").unwrap();
    let created = wait_for_named(&rx, "file_created", &file);
    assert!(!created.is_synthetic(), "kernel events are not synthetic");

    fs::remove_file(&file).unwrap();
    wait_for_named(&rx, "file_deleted", &file);

    observer.stop().unwrap();
    assert!(observer.join(WAIT));
}

#[test]
fn rename_within_the_watch_pairs_into_one_move() {
    let dir = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let (handler, rx) = channel_handler();

    let observer = new_observer(quick_config()).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let from = root.join("a");
    let to = root.join("b");
    fs::write(&from, b"hello").unwrap();
    wait_for_named(&rx, "file_created", &from);

    fs::rename(&from, &to).unwrap();
    let moved = wait_for_named(&rx, "file_moved", &from);
    assert_eq!(moved.dest_path(), Some(to.as_path()));

    // No stray delete/create from the pairing.
    assert_silent_about(&rx, &from, Duration::from_millis(300));

    observer.stop().unwrap();
}

#[test]
fn rename_of_a_directory_keeps_watching_its_subtree() {
    let dir = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let (handler, rx) = channel_handler();

    let observer = new_observer(quick_config()).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let old_dir = root.join("olddir");
    fs::create_dir(&old_dir).unwrap();
    wait_for_named(&rx, "dir_created", &old_dir);

    let new_dir = root.join("newdir");
    fs::rename(&old_dir, &new_dir).unwrap();
    wait_for_named(&rx, "dir_moved", &old_dir);

    // Events under the renamed directory resolve to the new path.
    let inner = new_dir.join("inner");
    fs::write(&inner, b"x").unwrap();
    wait_for_named(&rx, "file_created", &inner);

    observer.stop().unwrap();
}

#[test]
fn move_out_of_the_watch_degrades_to_a_delete() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let (handler, rx) = channel_handler();

    let observer = new_observer(quick_config()).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let file = root.join("a");
    fs::write(&file, b"hello").unwrap();
    wait_for_named(&rx, "file_created", &file);

    fs::rename(&file, outside.path().join("a")).unwrap();
    wait_for_named(&rx, "file_deleted", &file);

    observer.stop().unwrap();
}

#[test]
fn move_into_the_watch_appears_as_a_create() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let (handler, rx) = channel_handler();

    let source = outside.path().join("incoming");
    fs::write(&source, b"hello").unwrap();

    let observer = new_observer(quick_config()).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let target = root.join("incoming");
    fs::rename(&source, &target).unwrap();
    wait_for_named(&rx, "file_created", &target);

    observer.stop().unwrap();
}

#[test]
fn split_rename_beyond_the_window_degrades_to_delete_then_create() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let (handler, rx) = channel_handler();

    let observer = new_observer(
        quick_config().with_move_window(Duration::from_millis(20)),
    )
    .unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let inside = root.join("a");
    fs::write(&inside, b"hello").unwrap();
    wait_for_named(&rx, "file_created", &inside);

    // Two lone halves, well apart: out of the watch, pause past the
    // window, then back in under a new name.
    let parked = outside.path().join("parked");
    fs::rename(&inside, &parked).unwrap();
    std::thread::sleep(Duration::from_millis(80));
    let back = root.join("b");
    fs::rename(&parked, &back).unwrap();

    wait_for_named(&rx, "file_deleted", &inside);
    wait_for_named(&rx, "file_created", &back);

    observer.stop().unwrap();
}

#[test]
fn a_new_subdirectory_is_watched_and_its_contents_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let (handler, rx) = channel_handler();

    let observer = new_observer(quick_config()).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let sub = root.join("d");
    let file = sub.join("f");
    fs::create_dir(&sub).unwrap();
    fs::write(&file, b"x").unwrap();

    wait_for_named(&rx, "dir_created", &sub);
    // Either the live watch or the catch-up replay reports the file.
    wait_for_named(&rx, "file_created", &file);

    // And the new directory is genuinely under observation now.
    let later = sub.join("later");
    fs::write(&later, b"y").unwrap();
    wait_for_named(&rx, "file_created", &later);

    observer.stop().unwrap();
}

#[test]
fn non_recursive_watch_sees_only_direct_children() {
    let dir = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let sub = root.join("d");
    fs::create_dir(&sub).unwrap();

    let (handler, rx) = channel_handler();
    let observer = new_observer(quick_config()).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::NonRecursive)
        .unwrap();
    observer.start().unwrap();

    let deep = sub.join("f");
    fs::write(&deep, b"x").unwrap();
    assert_silent_about(&rx, &deep, Duration::from_millis(300));

    let shallow = root.join("g");
    fs::write(&shallow, b"y").unwrap();
    wait_for_named(&rx, "file_created", &shallow);

    observer.stop().unwrap();
}

#[test]
fn deleting_the_watched_root_is_terminal() {
    let parent = tempfile::tempdir().unwrap();
    let root = parent.path().join("watched");
    fs::create_dir(&root).unwrap();
    let root = canon(&root);

    let (handler, rx) = channel_handler();
    let observer = new_observer(quick_config()).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    fs::remove_dir(&root).unwrap();
    wait_for_named(&rx, "dir_deleted", &root);

    // The dead watch unschedules silently.
    let watch = observer.watches().into_iter().next().unwrap();
    observer.unschedule(&watch).unwrap();

    observer.stop().unwrap();
}

#[test]
fn access_events_are_off_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let (handler, rx) = channel_handler();

    let observer = new_observer(quick_config()).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let file = root.join("a");
    fs::write(&file, b"data").unwrap();
    wait_for_named(&rx, "file_created", &file);

    // The write opened and closed the file, but with access events off
    // none of that is reported.
    let deadline = std::time::Instant::now() + Duration::from_millis(300);
    while let Ok(event) = rx.recv_timeout(
        deadline.saturating_duration_since(std::time::Instant::now()),
    ) {
        assert!(
            !matches!(event.name(), "file_opened" | "file_closed" | "file_closed_no_write"),
            "unexpected access event {event:?}"
        );
    }

    observer.stop().unwrap();
}

#[test]
fn access_events_flow_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let (handler, rx) = channel_handler();

    let observer = new_observer(quick_config().with_access_events(true)).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let file = root.join("a");
    fs::write(&file, b"data").unwrap();
    wait_for_named(&rx, "file_closed", &file);

    observer.stop().unwrap();
}

#[test]
fn watching_a_missing_path_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let (handler, _rx) = channel_handler();

    let observer = new_observer(quick_config()).unwrap();
    let err = observer
        .schedule(
            handler,
            &dir.path().join("not-here"),
            RecursiveMode::Recursive,
        )
        .unwrap_err();
    assert!(matches!(err.kind, vigil::ErrorKind::PathNotFound));
    assert!(observer.watches().is_empty());
}

#[test]
fn events_on_one_watch_preserve_emitter_order() {
    let dir = tempfile::tempdir().unwrap();
    let root = canon(dir.path());
    let (handler, rx) = channel_handler();

    let observer = new_observer(quick_config()).unwrap();
    observer
        .schedule(handler, &root, RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    for i in 0..20 {
        fs::write(root.join(format!("f{i:02}")), b"x").unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 20 {
        let event = wait_for(&rx, "file creations", |e| e.name() == "file_created");
        seen.push(event.src_path().to_path_buf());
    }
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted, "creations must arrive in creation order");

    observer.stop().unwrap();
}
