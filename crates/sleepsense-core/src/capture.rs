//! Audio capture queue
//!
//! Single-producer single-consumer ring bridging the microphone's PDM
//! interrupt into task context.
//!
//! - The producer ([`CaptureProducer`]) runs in interrupt context. `write` is
//!   bounded (at most two `copy_from_slice` calls) and never waits.
//! - The consumer ([`CaptureConsumer`]) runs in a task. `pop` reserves the
//!   requested span inside a critical section, then copies it out with
//!   interrupts enabled.
//!
//! ## Overflow: drop-oldest
//!
//! The producer never looks at the consumer's progress to decide whether to
//! write. When it laps the consumer, the oldest unread samples are simply
//! overwritten and the overflow flag is raised. The consumer notices on its
//! next `pop` (unread span larger than capacity) and skips forward to the
//! oldest sample still present. `head` is only stored by the producer and
//! `tail` only by the consumer, so neither index ever has two writers.
//!
//! ## Memory ordering
//!
//! The producer publishes samples with a `Release` store of `head` after the
//! copy; the consumer `Acquire`-loads `head` before reading samples. `tail` is
//! only ever read by the consumer, so it uses `Relaxed`.
//!
//! ## Known risk
//!
//! The copy after reservation races with a producer that laps the reserved
//! span. `pop` re-reads `head` after copying and reports
//! [`CaptureError::Overrun`] if the span may have been overwritten.
//!
//! That check only sees writes the producer has already published. With an
//! interrupt producer on a single core every `write` completes before the
//! task resumes, so every overrun is caught. A producer on another core or
//! thread (as in the host simulator) can still be mid-copy when `head` is
//! re-read, and a span torn that way goes unreported.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use thiserror_no_std::Error;

/// Errors reported by [`CaptureConsumer::pop`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureError {
    #[error("only {available} samples buffered")]
    Insufficient { available: usize },
    #[error("pop of {requested} samples exceeds ring capacity")]
    TooLarge { requested: usize },
    #[error("producer overwrote samples while they were being copied out")]
    Overrun,
}

/// Fixed-capacity sample ring. `N` must be a power of two.
///
/// ```ignore
/// static RING: StaticCell<CaptureRing<i16, 16384>> = StaticCell::new();
///
/// let (producer, consumer) = RING.init(CaptureRing::new()).split();
/// // producer -> PDM interrupt handler, consumer -> microphone sensor
/// ```
pub struct CaptureRing<T, const N: usize> {
    buffer: UnsafeCell<[T; N]>,
    /// Total samples ever written (wrapping). Producer-owned.
    head: AtomicUsize,
    /// Total samples ever consumed or skipped (wrapping). Consumer-owned.
    tail: AtomicUsize,
    overflowed: AtomicBool,
}

// Safety: the split handles guarantee one writer of `head`/slots and one
// writer of `tail`; slots are only read after the matching `head` release.
unsafe impl<T: Copy + Send, const N: usize> Sync for CaptureRing<T, N> {}

impl<T: Copy + Default, const N: usize> Default for CaptureRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default, const N: usize> CaptureRing<T, N> {
    const MASK: usize = {
        assert!(N > 0 && (N & (N - 1)) == 0, "N must be a power of 2");
        N - 1
    };

    /// Create an empty ring filled with `T::default()`.
    pub fn new() -> Self {
        let _ = Self::MASK;
        Self {
            buffer: UnsafeCell::new([T::default(); N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflowed: AtomicBool::new(false),
        }
    }

    /// Split into the interrupt-side and task-side handles.
    ///
    /// Taking `&mut self` guarantees at most one pair exists at a time.
    pub fn split(&mut self) -> (CaptureProducer<'_, T, N>, CaptureConsumer<'_, T, N>) {
        let ring: &Self = self;
        (
            CaptureProducer {
                ring,
                _not_clone: PhantomData,
            },
            CaptureConsumer { ring },
        )
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Unread samples, clamped to capacity when the producer has lapped.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail).min(N)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slots(&self) -> *mut T {
        self.buffer.get() as *mut T
    }

    /// Copy `src` into the ring starting at logical position `pos`,
    /// splitting into two copies on wraparound. `src.len() <= N`.
    ///
    /// # Safety
    /// Caller is the single producer.
    unsafe fn copy_in(&self, pos: usize, src: &[T]) {
        let start = pos & Self::MASK;
        let first = src.len().min(N - start);
        // Safety: both ranges lie inside the N-slot buffer
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.slots().add(start), first);
            core::ptr::copy_nonoverlapping(src[first..].as_ptr(), self.slots(), src.len() - first);
        }
    }

    /// Copy `dst.len()` samples out of the ring from logical position `pos`.
    ///
    /// # Safety
    /// Caller is the single consumer and has reserved the span.
    unsafe fn copy_out(&self, pos: usize, dst: &mut [T]) {
        let start = pos & Self::MASK;
        let first = dst.len().min(N - start);
        let rest = dst.len() - first;
        // Safety: both ranges lie inside the N-slot buffer
        unsafe {
            core::ptr::copy_nonoverlapping(self.slots().add(start), dst.as_mut_ptr(), first);
            core::ptr::copy_nonoverlapping(self.slots(), dst[first..].as_mut_ptr(), rest);
        }
    }
}

/// Interrupt-side handle. Not `Clone`: there is exactly one producer.
pub struct CaptureProducer<'a, T, const N: usize> {
    ring: &'a CaptureRing<T, N>,
    _not_clone: PhantomData<*const ()>,
}

// Safety: moving the producer to another context (e.g. an interrupt handler
// or a simulated ISR thread) keeps it the only producer.
unsafe impl<T: Copy + Send, const N: usize> Send for CaptureProducer<'_, T, N> {}

impl<T: Copy + Default, const N: usize> CaptureProducer<'_, T, N> {
    /// Append `samples`. Bounded time, never blocks.
    ///
    /// Returns `true` if unread samples were overwritten by this call.
    /// A batch larger than the ring keeps only its newest `N` samples.
    pub fn write(&mut self, samples: &[T]) -> bool {
        if samples.is_empty() {
            return false;
        }

        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Relaxed);

        let skip = samples.len().saturating_sub(N);
        // Safety: we are the only producer
        unsafe {
            self.ring
                .copy_in(head.wrapping_add(skip), &samples[skip..]);
        }

        let new_head = head.wrapping_add(samples.len());
        self.ring.head.store(new_head, Ordering::Release);

        let lapped = new_head.wrapping_sub(tail) > N;
        if lapped {
            self.ring.overflowed.store(true, Ordering::Release);
        }
        lapped
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

/// Task-side handle. Not `Clone`: there is exactly one consumer.
pub struct CaptureConsumer<'a, T, const N: usize> {
    ring: &'a CaptureRing<T, N>,
}

impl<T: Copy + Default, const N: usize> CaptureConsumer<'_, T, N> {
    /// Fill `out` with the oldest unread samples.
    ///
    /// Fails without side effects if fewer than `out.len()` samples are
    /// buffered. If the producer lapped the consumer, the unread span is first
    /// clamped to the newest `N` samples.
    pub fn pop(&mut self, out: &mut [T]) -> Result<(), CaptureError> {
        let count = out.len();
        if count > N {
            return Err(CaptureError::TooLarge { requested: count });
        }

        // Reservation: the only step that needs interrupts suppressed.
        let start = critical_section::with(|_| {
            let head = self.ring.head.load(Ordering::Acquire);
            let mut tail = self.ring.tail.load(Ordering::Relaxed);
            if head.wrapping_sub(tail) > N {
                tail = head.wrapping_sub(N);
            }
            let available = head.wrapping_sub(tail);
            if available < count {
                return Err(CaptureError::Insufficient { available });
            }
            self.ring
                .tail
                .store(tail.wrapping_add(count), Ordering::Relaxed);
            Ok(tail)
        })?;

        // Safety: [start, start + count) is reserved for us
        unsafe { self.ring.copy_out(start, out) };

        let head = self.ring.head.load(Ordering::Acquire);
        if head.wrapping_sub(start) > N {
            return Err(CaptureError::Overrun);
        }
        Ok(())
    }

    /// Unread samples currently buffered.
    pub fn available(&self) -> usize {
        self.ring.len()
    }

    /// Read and clear the overflow flag.
    pub fn take_overflow(&mut self) -> bool {
        self.ring.overflowed.swap(false, Ordering::AcqRel)
    }

    /// Discard everything buffered so far.
    pub fn clear(&mut self) {
        let head = self.ring.head.load(Ordering::Acquire);
        self.ring.tail.store(head, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_across_wrap() {
        let mut ring: CaptureRing<i16, 8> = CaptureRing::new();
        let (mut tx, mut rx) = ring.split();

        // Move the indices so the next batch straddles the end of the buffer.
        assert!(!tx.write(&[1, 2, 3, 4, 5, 6]));
        let mut first = [0i16; 6];
        rx.pop(&mut first).unwrap();
        assert_eq!(first, [1, 2, 3, 4, 5, 6]);

        tx.write(&[10, 11, 12]);
        tx.write(&[13, 14]);
        tx.write(&[15, 16, 17]);
        assert_eq!(rx.available(), 8);

        let mut out = [0i16; 8];
        rx.pop(&mut out).unwrap();
        assert_eq!(out, [10, 11, 12, 13, 14, 15, 16, 17]);
        assert!(!rx.take_overflow());
    }

    #[test]
    fn test_insufficient_pop_has_no_side_effects() {
        let mut ring: CaptureRing<u8, 4> = CaptureRing::new();
        let (mut tx, mut rx) = ring.split();
        tx.write(&[9, 8]);

        let mut out = [0u8; 3];
        assert_eq!(
            rx.pop(&mut out),
            Err(CaptureError::Insufficient { available: 2 })
        );
        assert_eq!(out, [0, 0, 0]);
        assert_eq!(rx.available(), 2);

        let mut two = [0u8; 2];
        rx.pop(&mut two).unwrap();
        assert_eq!(two, [9, 8]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut ring: CaptureRing<u8, 4> = CaptureRing::new();
        let (mut tx, mut rx) = ring.split();

        assert!(!tx.write(&[1, 2, 3]));
        assert!(tx.write(&[4, 5, 6]));
        assert_eq!(rx.available(), 4);
        assert!(rx.take_overflow());
        assert!(!rx.take_overflow());

        let mut out = [0u8; 4];
        rx.pop(&mut out).unwrap();
        assert_eq!(out, [3, 4, 5, 6]);

        let mut one = [0u8; 1];
        assert_eq!(
            rx.pop(&mut one),
            Err(CaptureError::Insufficient { available: 0 })
        );
    }

    #[test]
    fn test_oversized_batch_keeps_newest() {
        let mut ring: CaptureRing<u16, 4> = CaptureRing::new();
        let (mut tx, mut rx) = ring.split();

        assert!(tx.write(&[1, 2, 3, 4, 5, 6, 7]));
        let mut out = [0u16; 4];
        rx.pop(&mut out).unwrap();
        assert_eq!(out, [4, 5, 6, 7]);
    }

    #[test]
    fn test_pop_larger_than_capacity_rejected() {
        let mut ring: CaptureRing<u8, 4> = CaptureRing::new();
        let (_tx, mut rx) = ring.split();
        let mut out = [0u8; 5];
        assert_eq!(
            rx.pop(&mut out),
            Err(CaptureError::TooLarge { requested: 5 })
        );
    }

    #[test]
    fn test_clear_discards_unread() {
        let mut ring: CaptureRing<u8, 8> = CaptureRing::new();
        let (mut tx, mut rx) = ring.split();
        tx.write(&[1, 2, 3]);
        rx.clear();
        assert!(rx.available() == 0);
        tx.write(&[4]);
        let mut out = [0u8; 1];
        rx.pop(&mut out).unwrap();
        assert_eq!(out, [4]);
    }

    #[test]
    fn test_threaded_producer_consumer() {
        let mut ring: CaptureRing<u32, 1024> = CaptureRing::new();
        let (mut tx, mut rx) = ring.split();

        std::thread::scope(|s| {
            s.spawn(move || {
                for batch in 0..64u32 {
                    let chunk: [u32; 8] = core::array::from_fn(|i| batch * 8 + i as u32);
                    tx.write(&chunk);
                }
            });

            let mut next = 0u32;
            let mut buf = [0u32; 8];
            while next < 512 {
                if rx.pop(&mut buf).is_ok() {
                    for v in buf {
                        assert_eq!(v, next);
                        next += 1;
                    }
                }
            }
        });
    }
}
