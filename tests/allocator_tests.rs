// This test suite covers the versioned allocator on a real heap window. The parent's runtime
// reserves its window at a fixed address, so allocations made before fork are valid at the same
// address in every child. The tests check the parent's malloc family (alignment, zeroed calloc,
// realloc keeping the prefix, frees of foreign pointers), that a child process sees the parent's
// allocations where the parent left them, and that a worker's allocation records shipped one page
// at a time through a chunk rebuild the same cursors in another process's mirror.

//! Versioned heap allocation and broadcast replay.

use specpipe::core::test_utils::{fork_lock, TestContext};
use specpipe::core::{RuntimeError, RuntimeResult};
use specpipe::heap::batch::decode_records;
use specpipe::heap::{AllocBatch, AllocRecord, HeapClass, HeapId, HeapMirror, ALLOC_ALIGN};
use specpipe::packet::ChunkPool;
use specpipe::pipeline::Children;

#[test]
fn test_parent_malloc_family() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = TestContext::new();
    let mut rt = ctx.runtime().unwrap();
    let slot = rt.layout().main_slot();

    let a = rt.malloc(HeapClass::Versioned, 24).unwrap();
    let b = rt.malloc(HeapClass::Versioned, 24).unwrap();
    assert_eq!(a, rt.layout().arena_begin(HeapClass::Versioned, slot));
    assert_eq!(b % ALLOC_ALIGN, 0);
    assert!(b >= a + 24);

    let zeroed = rt.calloc(HeapClass::Unclassified, 64, 8).unwrap();
    // SAFETY: inside the calloc'd block.
    assert!((0..64).all(|i| unsafe { rt.load::<u64>(zeroed + i * 8) } == 0));

    for i in 0..3u64 {
        // SAFETY: inside `a`.
        unsafe { rt.store(a + i as usize * 8, i + 100) };
    }
    let grown = rt.realloc(HeapClass::Versioned, a, 4096).unwrap();
    assert_ne!(grown, a);
    // SAFETY: inside `grown`.
    let prefix: Vec<u64> = (0..3).map(|i| unsafe { rt.load::<u64>(grown + i * 8) }).collect();
    assert_eq!(prefix, vec![100, 101, 102]);
    assert_eq!(rt.mirror().size_of(a), None, "realloc frees the old block");
    assert_eq!(rt.mirror().size_of(grown), Some(4096));

    rt.free(0).unwrap();
    rt.free(b).unwrap();
    assert!(matches!(rt.free(0x1000), Err(RuntimeError::ForeignPointer { .. })));
}

#[test]
fn test_calloc_overflow_and_exhaustion() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = TestContext::new();
    let mut rt = ctx.runtime().unwrap();
    assert!(rt.calloc(HeapClass::Versioned, usize::MAX, 2).is_err());
    let arena = rt.config().arena_size;
    let err = rt.malloc(HeapClass::ReadOnly, arena + 1).unwrap_err();
    assert!(matches!(err, RuntimeError::ArenaExhausted { .. }));
    // other arenas are unaffected
    rt.malloc(HeapClass::ReadOnly, 16).unwrap();

    let before = *rt.mirror().cursor(HeapId::new(HeapClass::Versioned, rt.layout().main_slot()));
    for size in [usize::MAX, usize::MAX - 1] {
        let err = rt.malloc(HeapClass::Versioned, size).unwrap_err();
        assert!(matches!(err, RuntimeError::ArenaExhausted { .. }), "{err}");
        assert!(rt.realloc(HeapClass::Versioned, 0, size).is_err());
    }
    let after = *rt.mirror().cursor(HeapId::new(HeapClass::Versioned, rt.layout().main_slot()));
    assert_eq!(before, after);
    rt.malloc(HeapClass::Versioned, 16).unwrap();
}

#[test]
fn test_child_sees_allocations_at_the_same_address() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _guard = fork_lock();
    let ctx = TestContext::new();
    let mut rt = ctx.runtime().unwrap();
    let table = rt.malloc(HeapClass::ReadOnly, 512 * 8).unwrap();
    for i in 0..512u64 {
        // SAFETY: inside `table`.
        unsafe { rt.store(table + i as usize * 8, i * i) };
    }

    let mut children = Children::new();
    let rt_ref = &rt;
    children
        .spawn(0, None, || -> RuntimeResult<()> {
            for i in 0..512u64 {
                // SAFETY: the window is inherited at the same address.
                let got: u64 = unsafe { rt_ref.load(table + i as usize * 8) };
                if got != i * i {
                    return Err(RuntimeError::InvalidConfig {
                        reason: format!("table[{i}] = {got}"),
                    });
                }
            }
            Ok(())
        })
        .unwrap();
    children.join().unwrap();
}

#[test]
fn test_shipped_records_rebuild_cursors() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = TestContext::with_procs(4, 1);
    let rt = ctx.runtime().unwrap();
    let layout = *rt.layout();
    let chunk = ctx.config().arena_chunk_size;
    let mut worker = HeapMirror::new(layout, chunk, false);
    let mut view = HeapMirror::new(layout, chunk, false);

    let versioned = HeapId::new(HeapClass::Versioned, 1);
    let private = HeapId::new(HeapClass::StagePrivate, 1);
    let mut batch = AllocBatch::new();
    let mut ptrs = Vec::new();
    for i in 0..40 {
        let id = if i % 3 == 0 { private } else { versioned };
        let size = 24 + i * 40;
        let ptr = worker.alloc(id, size).unwrap();
        assert!(batch.push(AllocRecord::alloc(id, ptr, size)));
        ptrs.push((id, ptr));
    }
    let (id, freed) = ptrs[5];
    worker.free(freed).unwrap();
    assert!(batch.push(AllocRecord::free(id, freed)));

    let mut pool = ChunkPool::new(1).unwrap();
    let handle = pool.acquire().unwrap();
    let mut count = 0;
    pool.fill(handle, 0, |data, _| count = batch.drain_into(data));
    pool.publish(handle, 1 << 2);
    assert!(batch.is_empty());

    let (_, data, _) = pool.read(handle);
    for record in decode_records(&data[..], count) {
        view.apply(&record).unwrap();
    }
    pool.release(handle, 2);

    assert_eq!(worker.cursors(), view.cursors());
    assert_eq!(view.size_of(freed), None);
    assert_eq!(view.size_of(ptrs[6].1), worker.size_of(ptrs[6].1));
    assert_eq!(view.free_count(), 1);
    assert!(pool.is_available(handle));
}
