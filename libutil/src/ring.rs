/* ---------------------------------------------------------------------------
    marigold kernel
    Copyright (C) 2026 janicria

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
--------------------------------------------------------------------------- */

/*!
    libutil/src/ring.rs

    Fixed size single producer / single consumer byte queue.
*/

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// A ring of `N` bytes which can hold `N - 1` of them at once.
///
/// One side (usually an IRQ handler) may only `push`, and the other may only `pop`.
/// When full, new bytes are dropped and the existing contents are kept.
pub struct ByteRing<const N: usize> {
    buf: [AtomicU8; N],
    /// Next slot to read from, only written by the consumer.
    read: AtomicUsize,
    /// Next slot to write into, only written by the producer.
    write: AtomicUsize,
    dropped: AtomicUsize,
}

impl<const N: usize> ByteRing<N> {
    /// Creates an empty ring.
    pub const fn new() -> Self {
        assert!(N >= 2, "ring needs at least two slots");
        ByteRing {
            buf: [const { AtomicU8::new(0) }; N],
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Appends `byte`, returns `false` if the ring was full and it got dropped.
    pub fn push(&self, byte: u8) -> bool {
        let write = self.write.load(Ordering::Relaxed);
        let next = (write + 1) % N;

        if next == self.read.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.buf[write].store(byte, Ordering::Relaxed);
        self.write.store(next, Ordering::Release);
        true
    }

    /// Removes the oldest byte.
    pub fn pop(&self) -> Option<u8> {
        let read = self.read.load(Ordering::Relaxed);

        if read == self.write.load(Ordering::Acquire) {
            return None;
        }

        let byte = self.buf[read].load(Ordering::Relaxed);
        self.read.store((read + 1) % N, Ordering::Release);
        Some(byte)
    }

    /// Number of bytes waiting to be read.
    pub fn len(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        (write + N - read) % N
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many bytes can be stored at once.
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Total bytes thrown away because the ring was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<const N: usize> Default for ByteRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that bytes come out in the order they went in.
    #[test]
    fn fifo_order() {
        let ring = ByteRing::<8>::new();
        for b in b"hello" {
            assert!(ring.push(*b));
        }
        assert_eq!(ring.len(), 5);

        let out: Vec<u8> = core::iter::from_fn(|| ring.pop()).collect();
        assert_eq!(out, b"hello");
        assert!(ring.is_empty())
    }

    /// Tests that a full ring keeps its old contents and drops the new byte.
    #[test]
    fn full_ring_drops_newest() {
        let ring = ByteRing::<4>::new();
        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(ring.push(3));
        assert!(!ring.push(4));
        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.len(), ring.capacity());

        assert_eq!(ring.pop(), Some(1));
        assert!(ring.push(5));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), Some(5));
        assert_eq!(ring.pop(), None)
    }

    /// Tests that the indices wrap around correctly many times over.
    #[test]
    fn wraps_around() {
        let ring = ByteRing::<3>::new();
        for i in 0..=255u8 {
            assert!(ring.push(i));
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None)
    }

    /// Tests that a producer and consumer running at once never see a byte twice or out of order.
    #[test]
    fn concurrent_push_and_pop() {
        use core::sync::atomic::AtomicBool;
        use std::{sync::Arc, thread};

        for _ in 0..200 {
            let ring = Arc::new(ByteRing::<8>::new());
            let done = Arc::new(AtomicBool::new(false));

            let producer = {
                let (ring, done) = (Arc::clone(&ring), Arc::clone(&done));
                thread::spawn(move || {
                    for b in 0..=255u8 {
                        ring.push(b);
                        if b % 16 == 0 {
                            thread::yield_now();
                        }
                    }
                    done.store(true, Ordering::Release);
                })
            };

            let mut popped = Vec::new();
            loop {
                let finished = done.load(Ordering::Acquire);
                match ring.pop() {
                    Some(b) => popped.push(b),
                    None if finished => break,
                    None => thread::yield_now(),
                }
            }
            producer.join().unwrap();

            assert!(popped.windows(2).all(|w| w[0] < w[1]), "{popped:?}");
            assert_eq!(popped.len() + ring.dropped(), 256);
        }
    }
}
