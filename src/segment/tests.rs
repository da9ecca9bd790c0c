use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use super::*;
use crate::error::BufferError;
use crate::store::BackingStore;

fn doc_from(text: &[u8]) -> Document {
    let mut doc = Document::new();
    doc.append(Segment::from_bytes(text));
    doc
}

fn content(doc: &Document) -> Vec<u8> {
    doc.snapshot().to_vec().unwrap()
}

#[test]
fn test_find_segment_after_splits() {
    let mut doc = doc_from(b"abcdef");
    doc.insert(3, vec![Segment::from_bytes(b"XY")]).unwrap();

    assert_eq!(content(&doc), b"abcXYdef");
    assert_eq!(doc.segment_lengths(), vec![3, 2, 3]);

    let (id, local) = doc.segments().find_segment(4).unwrap();
    assert_eq!(doc.arena()[id].len(), 2);
    assert_eq!(local, 1);
    assert_eq!(doc.byte_at(5).unwrap(), b'd');
}

#[test]
fn test_find_segment_out_of_range() {
    let doc = doc_from(b"abc");
    assert!(matches!(
        doc.segments().find_segment(3),
        Err(BufferError::OutOfRange { index: 3, size: 3 })
    ));
}

#[test]
fn test_insert_at_boundaries() {
    let mut doc = doc_from(b"mid");
    doc.insert(0, vec![Segment::from_bytes(b"<")]).unwrap();
    doc.insert(4, vec![Segment::from_bytes(b">")]).unwrap();

    assert_eq!(content(&doc), b"<mid>");
    assert_eq!(doc.segment_lengths(), vec![1, 3, 1]);
    assert!(doc.insert(6, vec![Segment::from_bytes(b"!")]).is_err());
}

#[test]
fn test_delete_across_segments() {
    let mut doc = doc_from(b"0123");
    doc.append(Segment::from_bytes(b"4567"));
    doc.append(Segment::from_bytes(b"89"));

    let splice = doc.delete(2, 8).unwrap();

    assert_eq!(content(&doc), b"019");
    assert_eq!(splice.removed().len(), 3);
    assert_eq!(doc.segment_lengths(), vec![2, 1]);
}

#[test]
fn test_delete_everything_leaves_valid_empty_collection() {
    let mut doc = doc_from(b"gone");
    doc.delete(0, 3).unwrap();

    assert!(doc.is_empty());
    assert_eq!(doc.segments().segment_count(), 0);
    assert_eq!(doc.snapshot().len(), 0);
    assert!(doc.byte_at(0).is_err());

    doc.insert(0, vec![Segment::from_bytes(b"back")]).unwrap();
    assert_eq!(content(&doc), b"back");
}

#[test]
fn test_replace_inside_one_segment() {
    let mut doc = doc_from(b"hello world");
    doc.replace(0, 4, vec![Segment::from_bytes(b"HOWDY")]).unwrap();

    assert_eq!(content(&doc), b"HOWDY world");
    assert_eq!(doc.segment_lengths(), vec![5, 6]);
}

#[test]
fn test_revert_restores_exact_boundaries() {
    let mut doc = doc_from(b"aaaa");
    doc.append(Segment::from_bytes(b"bbbb"));
    let before_ids = doc.segments().ids().to_vec();

    let splice = doc.replace(2, 5, vec![Segment::from_bytes(b"Z")]).unwrap();
    assert_eq!(content(&doc), b"aaZbb");

    doc.revert(&splice);
    assert_eq!(doc.segments().ids(), &before_ids[..]);
    assert_eq!(content(&doc), b"aaaabbbb");

    doc.apply(&splice);
    assert_eq!(content(&doc), b"aaZbb");
}

#[test]
fn test_get_range_sizes() {
    let mut doc = doc_from(b"0123456789");
    doc.insert(5, vec![Segment::from_bytes(b"abc")]).unwrap();
    let size = doc.len();

    for start in 0..size {
        for end in start..size {
            let range = doc.get_range(start, end).unwrap();
            assert_eq!(range.len(), end - start + 1);
        }
    }

    assert_eq!(doc.get_range(3, 8).unwrap().to_vec().unwrap(), b"34abc5");
    assert!(doc.get_range(4, 3).is_err());
    assert!(doc.get_range(0, size).is_err());
}

#[test]
fn test_append_merges_contiguous_file_segments() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"0123456789").unwrap();
    let store = Arc::new(BackingStore::open(file.path(), 4096, false).unwrap());

    let mut collection = SegmentCollection::new();
    let mut arena = SegmentArena::new();
    collection.append(&mut arena, Segment::from_store(Arc::clone(&store), 0, 4));
    collection.append(&mut arena, Segment::from_store(Arc::clone(&store), 4, 10));

    assert_eq!(collection.segment_count(), 1);
    assert_eq!(collection.len(), 10);
}

#[test]
fn test_snapshot_read_at_spans_segments() {
    let mut snapshot = Snapshot::new();
    snapshot.push(Segment::from_bytes(b"abc"));
    snapshot.push(Segment::from_bytes(b""));
    snapshot.push(Segment::from_bytes(b"defg"));

    let mut buf = [0u8; 4];
    assert_eq!(snapshot.read_at(1, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"bcde");
    assert_eq!(snapshot.segments().len(), 2);
    assert_eq!(snapshot.read_at(7, &mut buf).unwrap(), 0);
}

fn store_of(content: &[u8]) -> (tempfile::NamedTempFile, Arc<BackingStore>) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content).unwrap();
    file.flush().unwrap();
    let store = Arc::new(BackingStore::open(file.path(), 4096, false).unwrap());
    (file, store)
}

#[test]
fn test_stitched_segment_reads_across_pieces() {
    let stitched = Segment::stitch([
        Segment::from_bytes(b"abc"),
        Segment::from_bytes(b""),
        Segment::from_bytes(b"defg"),
    ]);
    assert!(stitched.is_composite());
    assert_eq!(stitched.len(), 7);

    let middle = stitched.slice(2, 5);
    let leaves: Vec<u64> = middle.leaves().iter().map(Segment::len).collect();
    assert_eq!(leaves, vec![1, 2]);

    let mut snapshot = Snapshot::new();
    snapshot.push(middle);
    assert_eq!(snapshot.to_vec().unwrap(), b"cde");
    assert!(snapshot.segments().iter().all(|segment| !segment.is_composite()));
}

#[test]
fn test_stitch_merges_contiguous_runs() {
    let (_file, store) = store_of(b"0123456789");
    let stitched = Segment::stitch([
        Segment::from_store(Arc::clone(&store), 0, 4),
        Segment::from_store(Arc::clone(&store), 4, 10),
    ]);

    assert!(!stitched.is_composite());
    assert!(stitched.is_backed_by(&store));
    assert_eq!(stitched.len(), 10);
}

#[test]
fn test_detach_copies_only_hidden_bytes() {
    let (_file, store) = store_of(&[b'x'; 1000]);
    let mut doc = Document::from_store(&store);
    let splice = doc.delete(5, 5).unwrap();
    let ids: Vec<SegmentId> = splice.removed().iter().chain(splice.inserted()).copied().collect();

    let mut detacher = Detacher::new(&doc, Some(&store), false);
    let planned = detacher.plan(ids.iter().copied());
    // the split segment's outer parts are still live, so only the deleted byte is copied
    assert_eq!(planned.cost(), 1);
    detacher.commit(planned);
    assert_eq!(detacher.plan(ids.iter().copied()).cost(), 0);
    assert!(detacher.plan(splice.inserted().iter().copied()).is_empty());
}

#[test]
fn test_in_place_detach_copies_moved_live_data() {
    let (_file, store) = store_of(b"abcdefgh");
    let mut doc = Document::from_store(&store);
    doc.delete(0, 0).unwrap();
    doc.append(Segment::from_bytes(b"!"));

    let plan = Detacher::new(&doc, Some(&store), true).finish();
    assert_eq!(plan.cost(), 7);

    let detached = plan.materialize().unwrap();
    doc.install(detached.moved);
    assert!(!doc.snapshot().segments().iter().any(|segment| segment.is_file_backed()));
    assert_eq!(content(&doc), b"bcdefgh!");
}

#[test]
fn test_reload_carries_history_into_new_file() {
    let (_old, store) = store_of(b"0123456789");
    let mut doc = Document::from_store(&store);
    let splice = doc.delete(4, 5).unwrap();
    let keep: HashSet<SegmentId> = splice.removed().iter().chain(splice.inserted()).copied().collect();

    let mut detacher = Detacher::new(&doc, Some(&store), false);
    let planned = detacher.plan(keep.iter().copied());
    detacher.commit(planned);
    let detached = detacher.finish().materialize().unwrap();
    doc.install(detached.history.unwrap());

    let (_new, saved) = store_of(b"01236789");
    assert!(doc.reload(&saved, Some(&store), keep));

    // nothing but the two deleted bytes is held in memory
    let held = Detacher::new(&doc, Some(&saved), false).plan(splice.removed().iter().copied());
    assert_eq!(held.cost(), 0);
    let removed = &doc.arena()[splice.removed()[0]];
    let memory: u64 = removed.leaves().iter().filter(|leaf| !leaf.is_file_backed()).map(Segment::len).sum();
    assert_eq!(memory, 2);

    doc.revert(&splice);
    assert_eq!(content(&doc), b"0123456789");
    assert_eq!(doc.segment_lengths(), vec![10]);
}

#[test]
fn test_reload_refuses_history_the_new_file_lacks() {
    let (_old, store) = store_of(b"0123456789");
    let mut doc = Document::from_store(&store);
    let splice = doc.delete(0, 4).unwrap();
    let keep: HashSet<SegmentId> = splice.removed().iter().copied().collect();

    let (_new, saved) = store_of(b"56789");
    assert!(!doc.reload(&saved, Some(&store), keep));
    assert_eq!(doc.segment_lengths(), vec![5]);
    assert_eq!(content(&doc), b"56789");
}

#[test]
fn test_offsets_follow_splices() {
    let mut doc = doc_from(b"aaaa");
    doc.append(Segment::from_bytes(b"bbbb"));
    doc.append(Segment::from_bytes(b"cccc"));

    doc.replace(4, 7, vec![Segment::from_bytes(b"XY")]).unwrap();
    let segments = doc.segments();
    assert_eq!(segments.start_of(1), 4);
    assert_eq!(segments.start_of(2), 6);
    assert_eq!(segments.len(), 10);

    let expected = b"aaaaXYcccc";
    for (i, &byte) in expected.iter().enumerate() {
        assert_eq!(doc.byte_at(i as u64).unwrap(), byte);
    }
}

#[test]
fn test_collect_garbage_keeps_history_segments() {
    let mut doc = doc_from(b"abcdef");
    let splice = doc.delete(1, 2).unwrap();
    let live_before = doc.arena().len();

    doc.collect_garbage(splice.removed().iter().copied().collect());
    assert_eq!(doc.arena().len(), live_before);

    doc.collect_garbage(Default::default());
    assert_eq!(doc.arena().len(), doc.segments().segment_count());
}

#[test]
fn test_reload_rebinds_live_segments_for_history() {
    let mut doc = doc_from(b"0123456789");
    let splice = doc.replace(2, 4, vec![Segment::from_bytes(b"ab")]).unwrap();
    let keep = splice.removed().iter().chain(splice.inserted()).copied().collect();

    let (_file, store) = store_of(b"01ab56789");

    let lengths = doc.segment_lengths();
    assert!(doc.reload(&store, None, keep));
    assert_eq!(doc.segment_lengths(), lengths);
    assert!(doc.snapshot().segments().iter().all(|segment| segment.is_backed_by(&store)));

    doc.revert(&splice);
    assert_eq!(content(&doc), b"0123456789");
}

#[test]
fn test_reload_without_history_starts_over() {
    let mut doc = doc_from(b"abc");
    doc.append(Segment::from_bytes(b"def"));

    let (_file, store) = store_of(b"abcdef");

    assert!(doc.reload(&store, None, Default::default()));
    assert_eq!(doc.segment_lengths(), vec![6]);
    assert_eq!(doc.arena().len(), 1);
}

#[test]
fn test_released_slots_are_reused() {
    let mut arena = SegmentArena::new();
    let a = arena.alloc(Segment::from_bytes(b"a"));
    let b = arena.alloc(Segment::from_bytes(b"bb"));

    arena.retain(&HashSet::from([a]));
    assert!(arena.get(b).is_none());

    let c = arena.alloc(Segment::from_bytes(b"ccc"));
    assert_eq!(c, b);
    assert_eq!(arena.len(), 2);
    assert_eq!(arena.get(c).map(Segment::len), Some(3));
}
