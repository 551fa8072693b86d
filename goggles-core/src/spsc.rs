//! Bounded lock-free single-producer single-consumer ring.
//!
//! One thread pushes, one thread pops. Capacity is rounded up to a power
//! of two; a full ring rejects the value instead of blocking, which is the
//! contract every queue site in Goggles wants (drop-and-count, never
//! stall the producer).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }
}

/// Producer half.
pub struct SpscSender<T> {
    inner: Arc<Inner<T>>,
}

/// Consumer half.
pub struct SpscReceiver<T> {
    inner: Arc<Inner<T>>,
}

/// Convenience wrapper owning both halves, for single-threaded tests and
/// owners that hand the halves out later.
pub struct SpscRing<T> {
    pub tx: SpscSender<T>,
    pub rx: SpscReceiver<T>,
}

impl<T> SpscRing<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = channel(capacity);
        Self { tx, rx }
    }
}

/// Creates a connected sender/receiver pair.
pub fn channel<T>(capacity: usize) -> (SpscSender<T>, SpscReceiver<T>) {
    let inner = Arc::new(Inner::with_capacity(capacity));
    (
        SpscSender {
            inner: Arc::clone(&inner),
        },
        SpscReceiver { inner },
    )
}

impl<T> SpscSender<T> {
    /// Pushes a value, or returns it back when the ring is full.
    pub fn try_push(&self, value: T) -> std::result::Result<(), T> {
        let inner = &self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        let head = inner.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > inner.mask {
            return Err(value);
        }
        unsafe {
            (*inner.slots[tail & inner.mask].get()).write(value);
        }
        inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.mask + 1
    }
}

impl<T> SpscReceiver<T> {
    pub fn try_pop(&self) -> Option<T> {
        let inner = &self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = unsafe { (*inner.slots[head & inner.mask].get()).assume_init_read() };
        inner.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Acquire);
        let head = self.inner.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.mask + 1
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut i = head;
        while i != tail {
            unsafe {
                (*self.slots[i & self.mask].get()).assume_init_drop();
            }
            i = i.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let (tx, _rx) = channel::<u32>(60);
        assert_eq!(tx.capacity(), 64);
        let (tx, _rx) = channel::<u32>(64);
        assert_eq!(tx.capacity(), 64);
    }

    #[test]
    fn push_pop_preserves_order() {
        let (tx, rx) = channel(8);
        for i in 0..8 {
            assert!(tx.try_push(i).is_ok());
        }
        for i in 0..8 {
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn full_ring_rejects_value() {
        let (tx, rx) = channel(4);
        for i in 0..4 {
            assert!(tx.try_push(i).is_ok());
        }
        assert_eq!(tx.try_push(99), Err(99));
        assert_eq!(rx.try_pop(), Some(0));
        assert!(tx.try_push(99).is_ok());
    }

    #[test]
    fn wraparound_keeps_fifo() {
        let (tx, rx) = channel(4);
        for round in 0..100u32 {
            assert!(tx.try_push(round * 2).is_ok());
            assert!(tx.try_push(round * 2 + 1).is_ok());
            assert_eq!(rx.try_pop(), Some(round * 2));
            assert_eq!(rx.try_pop(), Some(round * 2 + 1));
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn cross_thread_ordering() {
        let (tx, rx) = channel(64);
        const N: u64 = 10_000;
        let producer = std::thread::spawn(move || {
            let mut next = 0u64;
            while next < N {
                if tx.try_push(next).is_ok() {
                    next += 1;
                }
            }
        });
        let mut expected = 0u64;
        while expected < N {
            if let Some(v) = rx.try_pop() {
                assert_eq!(v, expected);
                expected += 1;
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn drops_queued_values() {
        let counter = Arc::new(AtomicUsize::new(0));
        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let (tx, rx) = channel(8);
        for _ in 0..5 {
            tx.try_push(Probe(Arc::clone(&counter))).ok();
        }
        drop(rx.try_pop());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(tx);
        drop(rx);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
