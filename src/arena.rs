//! A thread-safe slab arena for skip list nodes.
//!
//! The arena owns every node the list ever allocates. Traversals hold
//! non-owning pointers into it, and node memory is only released when the
//! arena (and with it the list) is dropped, so a reader can never race with
//! a `free`. The hot path (`alloc`) pops from a lock-free Treiber stack of
//! free slots; a mutex guards only the cold path (`grow`) so that a burst of
//! allocating threads does not create a pile of slabs at once.
//!
//! The free list is fed exclusively by [`NodeArena::recycle`], which accepts
//! nodes that were never published to the list (an insert that lost a
//! duplicate race, or an upper level abandoned before its link succeeded).
//! Published nodes are never recycled, so a slot observed through the list
//! is never reused for a different key.

use crossbeam_epoch::{pin, Atomic, Shared};
use log::debug;
use std::mem::{self, MaybeUninit};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use ::metrics::counter;

use crate::metrics::ARENA_SLABS_TOTAL;
use crate::Node;

const SLAB_SIZE: usize = 128; // Number of nodes per slab

/// A contiguous chunk of node slots served out through the free list.
struct Slab {
    _memory: Box<[MaybeUninit<Node>]>,
}

impl Slab {
    fn new() -> Self {
        let mut memory = Vec::with_capacity(SLAB_SIZE);
        // SAFETY: The items are `MaybeUninit` and do not need to be
        // initialized. The memory is not read until it has been written to.
        unsafe {
            memory.set_len(SLAB_SIZE);
        }
        Slab {
            _memory: memory.into_boxed_slice(),
        }
    }

    fn as_ptr(&self) -> *mut Node {
        self._memory.as_ptr() as *mut Node
    }
}

/// An entry in the intrusive linked list of free slots. The arena re-purposes
/// the memory of an unused node slot to store this.
#[repr(C)]
struct FreeSlot {
    next: Atomic<FreeSlot>,
}

/// The arena behind a skip list. Allocation is lock-free except when a new
/// slab is needed.
pub(crate) struct NodeArena {
    /// Every slab ever allocated, kept alive until the arena drops.
    slabs: Mutex<Vec<Slab>>,
    /// Head of the lock-free stack of free slots.
    head: Atomic<FreeSlot>,
    /// Serializes slab growth.
    grow_lock: Mutex<()>,
}

// SAFETY: The slab list and the grow path are guarded by mutexes, and the
// free-list head is an atomic pointer only ever swung by CAS. Slot pointers
// may be handed to and returned from any thread.
unsafe impl Send for NodeArena {}
unsafe impl Sync for NodeArena {}

impl NodeArena {
    pub(crate) fn new() -> Self {
        assert!(
            mem::size_of::<Node>() >= mem::size_of::<FreeSlot>(),
            "Size of Node must be >= size of FreeSlot"
        );
        assert!(
            mem::align_of::<Node>() >= mem::align_of::<FreeSlot>(),
            "Alignment of Node must be >= alignment of FreeSlot"
        );

        NodeArena {
            slabs: Mutex::new(Vec::new()),
            head: Atomic::null(),
            grow_lock: Mutex::new(()),
        }
    }

    /// Adds a slab and threads its slots onto the free list. Cold path.
    fn grow(&self) {
        let new_slab = Slab::new();
        let slab_ptr = new_slab.as_ptr();

        let slab_count = {
            let mut slabs = self.slabs.lock().unwrap();
            slabs.push(new_slab);
            slabs.len()
        };
        debug!("node arena grew to {} slab(s)", slab_count);
        counter!(ARENA_SLABS_TOTAL).increment(1);

        // Chain the new slots together into an intrusive linked list.
        for i in 0..(SLAB_SIZE - 1) {
            let current_slot = unsafe { slab_ptr.add(i) as *mut FreeSlot };
            let next_slot = unsafe { slab_ptr.add(i + 1) as *mut FreeSlot };
            // SAFETY: We have exclusive access to this new slab's memory.
            unsafe {
                (*current_slot)
                    .next
                    .store(Shared::from(next_slot as *const _), Ordering::Relaxed);
            }
        }

        let last_slot = unsafe { slab_ptr.add(SLAB_SIZE - 1) as *mut FreeSlot };
        let new_head = Shared::from(slab_ptr as *const FreeSlot);
        let guard = &pin();

        // Atomically prepend the whole chain to the free list.
        loop {
            let old_head = self.head.load(Ordering::Acquire, guard);
            // SAFETY: We have exclusive access to the last slot of our new slab.
            unsafe {
                (*last_slot).next.store(old_head, Ordering::Relaxed);
            }

            if self
                .head
                .compare_exchange(old_head, new_head, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                break;
            }
            // Another thread may be recycling slots; retry the CAS.
        }
    }

    /// Pops one uninitialized node slot. Grows the arena if the free list is
    /// empty.
    pub(crate) fn alloc(&self) -> NonNull<Node> {
        let guard = &pin();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);

            if let Some(head_ref) = unsafe { head.as_ref() } {
                let next = head_ref.next.load(Ordering::Relaxed, guard);
                if self
                    .head
                    .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_ok()
                {
                    return NonNull::new(head.as_raw() as *mut Node).unwrap();
                }
                // CAS failed, another thread won. Retry.
            } else {
                let _lock = self.grow_lock.lock().unwrap();

                // Another thread may already have grown the list while we
                // waited for the lock.
                if self.head.load(Ordering::Relaxed, guard).is_null() {
                    self.grow();
                }
            }
        }
    }

    /// Returns a slot to the free list.
    ///
    /// Callers must only recycle nodes that were never reachable from the
    /// list; a published node stays allocated until the arena drops.
    pub(crate) fn recycle(&self, ptr: NonNull<Node>) {
        let slot = Shared::from(ptr.as_ptr() as *const FreeSlot);
        let guard = &pin();

        loop {
            let old_head = self.head.load(Ordering::Acquire, guard);
            // SAFETY: The slot came from this arena and the caller guarantees
            // no other thread ever observed it, so we may overwrite it.
            unsafe {
                slot.deref().next.store(old_head, Ordering::Relaxed);
            }

            if self
                .head
                .compare_exchange(old_head, slot, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                return;
            }
            // CAS failed, another thread pushed. Retry.
        }
    }
}
