// Bounded multi-producer / multi-consumer queue with sequenced cells.
//
// This is Vyukov's bounded MPMC algorithm: each cell carries a sequence
// counter that encodes which operation (enqueue or dequeue) may touch it
// next. Producers and consumers claim a cell with a single CAS on their
// respective counter and publish with a release store on the cell sequence,
// so an enqueued value happens-before its matching dequeue.
//
// Reference: "Bounded MPMC queue" by Dmitry Vyukov (1024cores.net)

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

struct Cell<T> {
    /// Sequence counter; initialised to the cell index.
    seq: AtomicU64,
    /// Slot for the value; valid only between a producer's publish and the
    /// matching consumer's take.
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free MPMC ring.
///
/// Capacity is rounded up to a power of two (minimum 2). Sequence counters
/// are 64-bit and wrap harmlessly. There is no global FIFO across
/// producers; per-producer order is preserved when that producer serialises
/// its own enqueues, which is how the per-connection inbound rings obtain
/// connection-FIFO delivery.
pub struct MpmcRing<T> {
    buffer: Box<[Cell<T>]>,
    mask: u64,
    /// Producer counter.
    tail: CachePadded<AtomicU64>,
    /// Consumer counter.
    head: CachePadded<AtomicU64>,
}

unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

impl<T> MpmcRing<T> {
    /// Create a ring with at least `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let buffer = (0..cap)
            .map(|i| Cell {
                seq: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: (cap - 1) as u64,
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Approximate number of queued items.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head) as usize
    }

    /// Approximate emptiness check.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a value.
    ///
    /// Returns `Err(value)` when the ring is full so the caller can apply
    /// its overflow policy without losing the item.
    pub fn push(&self, value: T) -> std::result::Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);

        loop {
            let cell = &self.buffer[(pos & self.mask) as usize];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as i64;

            if diff == 0 {
                // Cell is ready for this enqueue; claim the slot.
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            (*cell.value.get()).write(value);
                        }
                        cell.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // The consumer one lap behind has not vacated the cell yet.
                return Err(value);
            } else {
                // Another producer advanced past us; reload and retry.
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue a value, or `None` when the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);

        loop {
            let cell = &self.buffer[(pos & self.mask) as usize];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as i64;

            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        // Mark the cell free for the producer one lap ahead.
                        cell.seq.store(
                            pos.wrapping_add(self.mask).wrapping_add(1),
                            Ordering::Release,
                        );
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue up to `max` items into a vector.
    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.capacity()));
        for _ in 0..max {
            match self.pop() {
                Some(v) => out.push(v),
                None => break,
            }
        }
        out
    }
}

impl<T> Drop for MpmcRing<T> {
    fn drop(&mut self) {
        // Drain remaining items so their destructors run.
        while self.pop().is_some() {}
    }
}
