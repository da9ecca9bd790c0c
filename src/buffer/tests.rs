use std::fs;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::*;
use crate::config::KeepUndoPolicy;
use crate::save::SaveCallbacks;
use crate::store::FixedProbe;

fn changes(rx: &Receiver<BufferEvent>) -> usize {
    rx.try_iter()
        .filter(|event| event.kind == BufferEventKind::Changed)
        .count()
}

#[test]
fn test_insert_delete_undo_scenario() {
    let buffer = Buffer::new();

    assert!(buffer.insert(0, b"abc").unwrap());
    assert_eq!(buffer.size(), 3);

    assert!(buffer.delete(1, 1).unwrap());
    assert_eq!(buffer.to_vec().unwrap(), b"ac");

    assert!(buffer.undo());
    assert_eq!(buffer.to_vec().unwrap(), b"abc");

    assert!(buffer.undo());
    assert_eq!(buffer.size(), 0);
    assert!(buffer.is_empty());
}

#[test]
fn test_chaining_is_one_step_and_one_event() {
    let buffer = Buffer::new();
    buffer.append(b"0123456789").unwrap();
    let rx = buffer.subscribe();

    buffer.begin_chaining().unwrap();
    buffer.delete(0, 1).unwrap();
    buffer.insert(3, b"xyz").unwrap();
    assert_eq!(changes(&rx), 0);
    buffer.end_chaining().unwrap();

    assert_eq!(changes(&rx), 1);
    assert_eq!(buffer.undo_count(), 2);
    assert_eq!(buffer.to_vec().unwrap(), b"234xyz56789");

    assert!(buffer.undo());
    assert_eq!(buffer.to_vec().unwrap(), b"0123456789");
}

#[test]
fn test_chaining_misuse_is_rejected() {
    let buffer = Buffer::new();

    assert!(matches!(buffer.end_chaining(), Err(BufferError::ChainingInactive)));
    buffer.begin_chaining().unwrap();
    assert!(matches!(buffer.begin_chaining(), Err(BufferError::ChainingActive)));

    buffer.append(b"a").unwrap();
    assert!(!buffer.undo());
    buffer.end_chaining().unwrap();
    assert!(buffer.undo());
}

#[test]
fn test_empty_history_is_a_silent_noop() {
    let buffer = Buffer::new();
    let rx = buffer.subscribe();

    assert!(!buffer.undo());
    assert!(!buffer.redo());
    assert_eq!(rx.try_iter().count(), 0);
    assert!(!buffer.has_changed());
}

#[test]
fn test_new_edit_clears_redo() {
    let buffer = Buffer::new();
    buffer.append(b"abc").unwrap();
    buffer.append(b"def").unwrap();
    buffer.undo();
    assert!(buffer.can_redo());

    buffer.append(b"!").unwrap();
    assert!(!buffer.can_redo());
    assert_eq!(buffer.to_vec().unwrap(), b"abc!");
}

#[test]
fn test_max_undo_evicts_oldest() {
    let buffer = Buffer::new();
    buffer.set_max_undo_actions(Some(2));

    for data in [b"a", b"b", b"c"] {
        buffer.append(data).unwrap();
    }

    assert_eq!(buffer.undo_count(), 2);
    assert!(buffer.changed_beyond_undo());
    assert!(buffer.undo());
    assert!(buffer.undo());
    assert!(!buffer.undo());
    assert_eq!(buffer.to_vec().unwrap(), b"a");
}

#[test]
fn test_out_of_range_positions() {
    let buffer = Buffer::new();
    buffer.append(b"abc").unwrap();

    assert!(matches!(
        buffer.insert(4, b"x"),
        Err(BufferError::OutOfRange { index: 4, size: 3 })
    ));
    assert!(matches!(buffer.delete(2, 3), Err(BufferError::OutOfRange { .. })));
    assert!(matches!(buffer.byte_at(3), Err(BufferError::OutOfRange { .. })));
    assert_eq!(buffer.range_to_vec(1, 2).unwrap(), b"bc");
}

#[test]
fn test_close_revokes_access() {
    let buffer = Buffer::new();
    buffer.append(b"abc").unwrap();
    let rx = buffer.subscribe();

    buffer.close_file().unwrap();

    let permissions = buffer.permissions();
    assert!(!permissions.read);
    assert!(!permissions.modify);
    assert!(!buffer.append(b"x").unwrap());
    assert!(!buffer.undo());
    assert_eq!(buffer.to_vec().unwrap(), Vec::<u8>::new());
    assert!(rx
        .try_iter()
        .any(|event| event.kind == BufferEventKind::PermissionsChanged));
}

#[test]
fn test_untitled_names_are_distinct() {
    let first = Buffer::new();
    let second = Buffer::new();

    assert!(first.name().starts_with("Untitled "));
    assert_ne!(first.name(), second.name());
    assert_ne!(first.id(), second.id());
    assert!(!first.has_file());
}

#[test]
fn test_save_without_file() {
    let buffer = Buffer::new();
    buffer.append(b"abc").unwrap();

    assert!(matches!(
        buffer.save(SaveCallbacks::new()),
        Err(BufferError::NoFile)
    ));
}

#[test]
fn test_save_matches_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, b"0123456789").unwrap();

    let buffer = Buffer::open(&path).unwrap();
    buffer.set_temp_dir(dir.path());
    buffer.insert(5, b"--").unwrap();
    let expected = buffer.to_vec().unwrap();

    let outcome = buffer.save(SaveCallbacks::new()).unwrap().wait();

    assert!(outcome.is_finished(), "{outcome:?}");
    assert_eq!(fs::read(&path).unwrap(), expected);
    assert_eq!(buffer.to_vec().unwrap(), expected);
    assert!(!buffer.has_changed());
    assert!(buffer.can_undo());
    assert!(buffer.permissions().modify);
}

#[test]
fn test_undo_survives_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, b"hello world").unwrap();

    let buffer = Buffer::open(&path).unwrap();
    buffer.set_temp_dir(dir.path());
    buffer.set_space_probe(Arc::new(FixedProbe::default()));
    buffer.delete(0, 5).unwrap();

    assert!(buffer.save(SaveCallbacks::new()).unwrap().wait().is_finished());
    assert_eq!(fs::read(&path).unwrap(), b"world");

    // the deleted bytes came from the old file, which is gone now
    assert!(buffer.undo());
    assert_eq!(buffer.to_vec().unwrap(), b"hello world");
    assert!(buffer.has_changed());
}

#[test]
fn test_never_keep_policy_drops_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, b"abcdef").unwrap();

    let config = Config {
        keep_undo_after_save: KeepUndoPolicy::Never,
        temp_dir: Some(dir.path().to_path_buf()),
        ..Config::default()
    };
    let buffer = Buffer::open_with_config(&path, config).unwrap();
    buffer.replace(0, 0, b"A").unwrap();

    assert!(buffer.save(SaveCallbacks::new()).unwrap().wait().is_finished());
    assert!(!buffer.can_undo());
    assert_eq!(buffer.segment_lengths(), vec![6]);
    assert_eq!(fs::read(&path).unwrap(), b"Abcdef");
}

#[test]
fn test_revert_restores_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, b"original").unwrap();

    let buffer = Buffer::open(&path).unwrap();
    buffer.delete(0, 3).unwrap();
    assert!(buffer.revert().unwrap());

    assert_eq!(buffer.to_vec().unwrap(), b"original");
    assert!(!buffer.can_undo());
    assert!(!buffer.has_changed());
}

#[test]
fn test_file_changed_signal() {
    let buffer = Buffer::new();
    let rx = buffer.subscribe();

    buffer.notify_file_changed();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, BufferEventKind::FileChanged);
    assert_eq!(event.buffer, buffer.id());
}

#[test]
fn test_small_delete_keeps_history_on_tight_memory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let original: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    fs::write(&path, &original).unwrap();

    let buffer = Buffer::open(&path).unwrap();
    buffer.set_temp_dir(dir.path());
    // only the deleted byte has to move into memory
    buffer.set_space_probe(Arc::new(FixedProbe {
        disk: None,
        memory: Some(1),
    }));
    buffer.delete(5, 5).unwrap();

    assert!(buffer.save(SaveCallbacks::new()).unwrap().wait().is_finished());
    assert_eq!(fs::read(&path).unwrap().len(), 999);
    assert!(buffer.can_undo());

    assert!(buffer.undo());
    assert_eq!(buffer.to_vec().unwrap(), original);
}

#[test]
fn test_memory_policy_truncates_oldest_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, b"0123456789").unwrap();

    let buffer = Buffer::open(&path).unwrap();
    buffer.set_temp_dir(dir.path());
    buffer.set_space_probe(Arc::new(FixedProbe {
        disk: None,
        memory: Some(2),
    }));
    for _ in 0..3 {
        buffer.delete(0, 0).unwrap();
    }

    assert!(buffer.save(SaveCallbacks::new()).unwrap().wait().is_finished());
    assert_eq!(fs::read(&path).unwrap(), b"3456789");
    assert_eq!(buffer.undo_count(), 2);

    assert!(buffer.undo());
    assert!(buffer.undo());
    assert!(!buffer.undo());
    assert_eq!(buffer.to_vec().unwrap(), b"123456789");
}

#[test]
fn test_always_policy_ignores_memory_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, b"abcdefghij").unwrap();

    let config = Config {
        keep_undo_after_save: KeepUndoPolicy::Always,
        temp_dir: Some(dir.path().to_path_buf()),
        ..Config::default()
    };
    let buffer = Buffer::open_with_config(&path, config).unwrap();
    buffer.set_space_probe(Arc::new(FixedProbe {
        disk: None,
        memory: Some(0),
    }));
    buffer.delete(0, 2).unwrap();
    buffer.delete(3, 5).unwrap();
    assert!(buffer.undo());

    assert!(buffer.save(SaveCallbacks::new()).unwrap().wait().is_finished());
    assert_eq!(fs::read(&path).unwrap(), b"defghij");
    assert_eq!(buffer.undo_count(), 1);
    assert_eq!(buffer.redo_count(), 1);

    assert!(buffer.redo());
    assert_eq!(buffer.to_vec().unwrap(), b"defj");
    assert!(buffer.undo());
    assert!(buffer.undo());
    assert_eq!(buffer.to_vec().unwrap(), b"abcdefghij");
}

#[test]
fn test_file_change_during_chaining_arrives_after() {
    let buffer = Buffer::new();
    let rx = buffer.subscribe();

    buffer.begin_chaining().unwrap();
    buffer.notify_file_changed();
    assert!(rx.try_recv().is_err());

    buffer.end_chaining().unwrap();
    let kinds: Vec<_> = rx.try_iter().map(|event| event.kind).collect();
    assert_eq!(kinds, vec![BufferEventKind::FileChanged]);
}
