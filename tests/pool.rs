use segheap::{FallbackPool, HeapError, MasterHeap, Pool};

#[test]
fn four_slot_pool_reports_exhaustion_and_recovers() {
    let mut pool: Pool<i32, 4> = Pool::new();

    let slots = (0..4)
        .map(|value| {
            let slot = pool.allocate().unwrap().expect("pool has room");
            unsafe { slot.write(value) };
            slot
        })
        .collect::<Vec<_>>();

    assert!(pool.is_full());
    assert_eq!(pool.allocate().unwrap(), None);

    pool.free(slots[2]).unwrap();
    let again = pool.allocate().unwrap().expect("a slot was freed");

    assert_eq!(again, slots[2]);
    assert!(pool.is_full());

    // Neighbours kept their values.
    for (value, slot) in [(0, slots[0]), (1, slots[1]), (3, slots[3])] {
        assert_eq!(unsafe { slot.read() }, value);
    }
}

#[test]
fn array_of_three_is_freed_as_a_unit_and_reused() {
    let mut pool: Pool<i32, 8> = Pool::new();
    let head = pool.allocate().unwrap().unwrap();

    let array = pool.allocate_array(3).unwrap().unwrap();
    assert_eq!(pool.len(), 4);

    // Continuation slots cannot be freed on their own.
    let middle = unsafe { array.add(1) };
    assert!(matches!(pool.free(middle), Err(HeapError::MemoryCorruption { .. })));

    pool.free(array).unwrap();
    assert_eq!(pool.len(), 1);

    let reused = pool.allocate_array(3).unwrap().unwrap();
    assert_eq!(reused, array);

    pool.free(head).unwrap();
    pool.free(reused).unwrap();
    assert!(pool.is_empty());
}

#[test]
fn arrays_need_a_contiguous_run() {
    let mut pool: Pool<u64, 6> = Pool::new();
    let slots = (0..6).map(|_| pool.allocate().unwrap().unwrap()).collect::<Vec<_>>();

    // Free every other slot: plenty of room, but no run of two.
    for slot in slots.iter().step_by(2) {
        pool.free(*slot).unwrap();
    }

    assert_eq!(pool.allocate_array(2).unwrap(), None);
    assert_eq!(pool.allocate_array(1).unwrap(), Some(slots[0]));
}

#[test]
fn full_pool_falls_back_to_the_master_heap() {
    let heap = MasterHeap::with_heaps(1, 4096).unwrap().into_shared();
    let mut values: FallbackPool<i32, 4> = FallbackPool::new(heap.clone()).unwrap();

    let pooled = (0..4).map(|_| values.allocate().unwrap()).collect::<Vec<_>>();
    let spilled = values.allocate().unwrap();

    assert!(pooled.iter().all(|ptr| values.pool().is_pool_memory(ptr.as_ptr())));
    assert!(heap.borrow().is_heap_memory(spilled.as_ptr().cast()));

    values.free(spilled).unwrap();
    assert_eq!(heap.borrow().stats().blocks, 0);
}

#[test]
fn pool_storage_outlives_every_master_heap() {
    let mut pool: Pool<u64, 4> = Pool::new();

    let slot = {
        let master = MasterHeap::with_heaps(1, 4096).unwrap();
        let slot = pool.allocate().unwrap().unwrap();
        assert!(!master.is_heap_memory(slot.as_ptr().cast()));
        slot
    };

    unsafe {
        slot.write(0xDEAD_BEEF);
        assert_eq!(slot.read(), 0xDEAD_BEEF);
    }
    pool.free(slot).unwrap();
}
