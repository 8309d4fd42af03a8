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
    libmem/src/debug.rs

    Guard words placed around debug allocations, and a fixed pool of
    records of who allocated what.
*/

use core::{panic::Location, ptr};

/// Written just before the user's data.
pub const FRONT_CANARY: u32 = 0xDEADBEEF;

/// Written just after the user's data.
pub const BACK_CANARY: u32 = 0xCAFEBABE;

/// Bytes in front of the user's data in a debug allocation, keeps user data 16 byte aligned.
pub const FRONT_PAD: usize = 16;

/// Bytes after the user's data in a debug allocation.
pub const BACK_PAD: usize = size_of::<u32>();

/// How many live allocations the tracker can remember.
pub const TRACKER_SLOTS: usize = 256;

/// What sits in the front pad of a debug allocation.
#[repr(C)]
struct FrontPad {
    /// Bytes the user asked for.
    size: u64,
    /// Buddy order of the block.
    order: u32,
    canary: u32,
}

const _: () = assert!(size_of::<FrontPad>() == FRONT_PAD);

/// Total block bytes needed to hold `size` user bytes plus both canaries.
pub const fn padded_size(size: usize) -> usize {
    FRONT_PAD + size + BACK_PAD
}

/// Writes both canaries into `block` and returns where the user's data starts.
///
/// # Safety
/// `block` must be valid for writes of `padded_size(size)` bytes and 16 byte aligned.
pub unsafe fn arm(block: *mut u8, size: usize, order: usize) -> *mut u8 {
    let pad = FrontPad {
        size: size as u64,
        order: order as u32,
        canary: FRONT_CANARY,
    };

    // Safety: The caller ensures the block fits both pads
    unsafe {
        ptr::write(block.cast::<FrontPad>(), pad);
        let user = block.add(FRONT_PAD);
        ptr::write_unaligned(user.add(size).cast::<u32>(), BACK_CANARY);
        user
    }
}

/// Checks both canaries around `user`, wipes them, then returns the block start and its order.
///
/// # Safety
/// `user` must have come from [`arm`] and not been disarmed since.
///
/// # Panics
/// If either canary was overwritten.
#[track_caller]
pub unsafe fn disarm(user: *mut u8) -> (*mut u8, usize) {
    // Safety: The caller ensures `user` came from `arm`
    unsafe {
        let block = user.sub(FRONT_PAD);
        let pad = ptr::read(block.cast::<FrontPad>());
        if pad.canary != FRONT_CANARY {
            panic!("heap underflow: front canary of {user:p} is {:#x}", pad.canary);
        }

        let back = user.add(pad.size as usize).cast::<u32>();
        let canary = ptr::read_unaligned(back);
        if canary != BACK_CANARY {
            panic!("heap overflow: back canary of {user:p} ({} bytes) is {canary:#x}", pad.size);
        }

        ptr::write(block.cast::<FrontPad>(), FrontPad { size: 0, order: 0, canary: 0 });
        ptr::write_unaligned(back, 0);
        (block, pad.order as usize)
    }
}

/// A record of one live allocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Allocation {
    pub user_addr: usize,
    pub block_addr: usize,
    pub block_size: usize,
    pub location: &'static Location<'static>,
}

/// A fixed pool of [`Allocation`]s.
///
/// Allocations made while the pool is full aren't tracked, but are counted.
pub struct LeakTracker<const N: usize> {
    slots: [Option<Allocation>; N],
    live: usize,
    untracked: usize,
}

impl<const N: usize> LeakTracker<N> {
    pub const fn new() -> Self {
        LeakTracker {
            slots: [None; N],
            live: 0,
            untracked: 0,
        }
    }

    /// Remembers `alloc`, returns `false` if there was no room.
    pub fn track(&mut self, alloc: Allocation) -> bool {
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(alloc);
                self.live += 1;
                true
            }
            None => {
                self.untracked += 1;
                false
            }
        }
    }

    /// Forgets the allocation handed out at `user_addr`.
    pub fn untrack(&mut self, user_addr: usize) -> Option<Allocation> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_some_and(|a| a.user_addr == user_addr))?;
        self.live -= 1;
        slot.take()
    }

    /// Every allocation which hasn't been freed yet.
    pub fn leaks(&self) -> impl Iterator<Item = &Allocation> {
        self.slots.iter().flatten()
    }

    /// Number of tracked live allocations.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Allocations which didn't fit in the pool.
    pub fn untracked(&self) -> usize {
        self.untracked
    }
}

impl<const N: usize> Default for LeakTracker<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct Block([u8; 64]);

    /// Tests that an untouched allocation disarms cleanly.
    #[test]
    fn canaries_survive_clean_use() {
        let mut block = Block([0; 64]);
        let start = block.0.as_mut_ptr();
        unsafe {
            let user = arm(start, 20, 6);
            assert_eq!(user as usize - start as usize, FRONT_PAD);
            user.write_bytes(0xAA, 20);
            assert_eq!(disarm(user), (start, 6));
        }
    }

    /// Tests that writing one byte past the end is caught.
    #[test]
    #[should_panic(expected = "heap overflow")]
    fn overflow_is_caught() {
        let mut block = Block([0; 64]);
        unsafe {
            let user = arm(block.0.as_mut_ptr(), 20, 6);
            user.write_bytes(0xAA, 21);
            disarm(user);
        }
    }

    /// Tests that writing before the start is caught.
    #[test]
    #[should_panic(expected = "heap underflow")]
    fn underflow_is_caught() {
        let mut block = Block([0; 64]);
        unsafe {
            let user = arm(block.0.as_mut_ptr(), 8, 5);
            user.sub(1).write(0);
            disarm(user);
        }
    }

    /// Tests that the tracker remembers and forgets allocations.
    #[test]
    fn tracker_tracks() {
        let mut tracker = LeakTracker::<2>::new();
        let alloc = |addr| Allocation {
            user_addr: addr,
            block_addr: addr - FRONT_PAD,
            block_size: 64,
            location: Location::caller(),
        };

        assert!(tracker.track(alloc(0x1010)));
        assert!(tracker.track(alloc(0x2010)));
        assert!(!tracker.track(alloc(0x3010)));
        assert_eq!(tracker.untracked(), 1);

        assert_eq!(tracker.untrack(0x1010).map(|a| a.block_addr), Some(0x1000));
        assert!(tracker.untrack(0x1010).is_none());
        assert_eq!(tracker.live(), 1);
        assert_eq!(tracker.leaks().next().map(|a| a.user_addr), Some(0x2010))
    }
}
