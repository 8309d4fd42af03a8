/* ---------------------------------------------------------------------------
    Sunflower kernel - sunflowerkernel.org
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
    libutil/src/sync.rs

    Statics which get initialised late, flags, and the kernel's spinlock.
*/

use core::{
    any::type_name,
    cell::UnsafeCell,
    error::Error,
    fmt::{Debug, Display},
    hint,
    marker::PhantomData,
    mem::MaybeUninit,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

/// A wrapper type to construct uninitialised instances of `T`, which can be safely given an initialised value later.
///
/// Designed to replace unnecessary `static mut`s.
#[derive(Debug)]
pub struct InitLater<T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    /// 0 - Uninit,
    /// 1 - Initialising,
    /// 2 - Initialised
    state: AtomicU8,
}

// Safety: The value is only written once, while `state` guards every other access
unsafe impl<T: Sync + Send> Sync for InitLater<T> {}

/// The value isn't initialised. It can be written to but not read from.
const UNINIT: u8 = 0;

/// The value is part way through initialising. It can neither be written to nor read from.
const INITIALISING: u8 = 1;

/// The value is initialised. It can be read from to but not written to.
const INIT: u8 = 2;

impl<T> InitLater<T> {
    /// Creates a new uninitialised `InitLater`.
    pub const fn uninit() -> Self {
        InitLater {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU8::new(UNINIT),
        }
    }

    /// Tries to initialise the value.
    /// Returns the loaded `val` for your convenience
    pub fn init(&self, val: T) -> Result<&T, InitError<T>> {
        match self.state.compare_exchange(UNINIT, INITIALISING, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => {
                // Safety: The exchange above ensures there are no other active references
                let val = unsafe { &mut *self.cell.get() }.write(val);
                self.state.store(INIT, Ordering::Release);
                Ok(val)
            }
            Err(state) => Err(InitError::new(state)),
        }
    }

    /// Tries to read the contained value.
    pub fn read(&self) -> Result<&T, InitError<T>> {
        match self.state.load(Ordering::Acquire) {
            // Safety: No mutations are able to happen if the value is initialised
            INIT => unsafe { Ok((*self.cell.get()).assume_init_ref()) },
            state => Err(InitError::new(state)),
        }
    }

    /// Returns `true` if the value has been initialised.
    pub fn is_init(&self) -> bool {
        self.state.load(Ordering::Relaxed) == INIT
    }
}

/// The error returned from various `InitLater` functions.
#[derive(Debug, PartialEq)]
pub struct InitError<T> {
    pub state: u8,
    _marker: PhantomData<T>,
}

impl<T> InitError<T> {
    /// Creates a new error.
    fn new(state: u8) -> Self {
        InitError {
            state,
            _marker: PhantomData,
        }
    }
}

impl<T: Debug> Error for InitError<T> {}

/// Allows being passed to startup::run
impl<T> Display for InitError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Remove the path to the type, only keeping its name.
        let name = type_name::<T>().rsplit("::").next().unwrap_or_default();

        let state = match self.state {
            UNINIT => "Uninit",
            INITIALISING => "Initialising",
            INIT => "Initialised",
            _ => "Unknown",
        };

        write!(f, "InitLater {name} was accessed while {state}!",)
    }
}

/// A wrapper type for to construct boolean flags which are `unsafe` write to, but safe to read from.
///
/// Designed to replace `AtomicBool` statics can cause UB when written to incorrectly.
#[derive(Debug)]
pub struct UnsafeFlag {
    val: AtomicBool,
}

impl UnsafeFlag {
    /// Creates a new `UnsafeFlag`.
    pub const fn new(val: bool) -> Self {
        UnsafeFlag {
            val: AtomicBool::new(val),
        }
    }

    /// Returns whether the flag is set or not.
    pub fn load(&self) -> bool {
        self.val.load(Ordering::Relaxed)
    }

    /// Sets the flag to `val`.
    /// # Safety
    /// It's up to you why setting the value is unsafe.
    pub unsafe fn store(&self, val: bool) {
        self.val.store(val, Ordering::Relaxed);
    }
}

/// Disables external interrupts until dropped, restoring whatever state they were in before.
///
/// Only touches `RFLAGS` on bare-metal builds, everywhere else (like host tests)
/// it's a no-op.
#[derive(Debug)]
pub struct IrqGuard {
    /// If IF was set when the guard was created.
    were_enabled: bool,
}

impl IrqGuard {
    /// The interrupt flag in `RFLAGS`.
    #[cfg(target_os = "none")]
    const IF: u64 = 1 << 9;

    /// Saves the interrupt flag then clears it.
    #[cfg(target_os = "none")]
    pub fn new() -> Self {
        let flags: u64;
        // Safety: Just reading RFLAGS and clearing IF, the kernel always runs in ring 0
        unsafe {
            core::arch::asm!("pushfq", "pop {}", "cli", out(reg) flags, options(preserves_flags));
        }
        IrqGuard {
            were_enabled: flags & Self::IF != 0,
        }
    }

    #[cfg(not(target_os = "none"))]
    pub fn new() -> Self {
        IrqGuard {
            were_enabled: false,
        }
    }

    /// Returns whether interrupts were enabled before the guard was created.
    pub fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "none")]
        if self.were_enabled {
            // Safety: Interrupts were enabled before we disabled them
            unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
        }
    }
}

/// A test-and-test-and-set spinlock.
///
/// Use [`Spinlock::lock_irqsave`] for anything an interrupt handler could also
/// want, otherwise the handler can spin forever on a lock held by the code it
/// just interrupted.
pub struct Spinlock<T> {
    locked: AtomicBool,
    cell: UnsafeCell<T>,
}

// Safety: The lock ensures only one guard ever exists at a time
unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Creates a new unlocked lock containing `val`.
    pub const fn new(val: T) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            cell: UnsafeCell::new(val),
        }
    }

    /// Tries to take the lock once.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.try_acquire().then_some(SpinlockGuard {
            lock: self,
            _irq: None,
        })
    }

    /// Spins until the lock is taken.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.acquire();
        SpinlockGuard {
            lock: self,
            _irq: None,
        }
    }

    /// Disables interrupts then spins until the lock is taken.
    ///
    /// The interrupt flag is restored once the guard is dropped.
    pub fn lock_irqsave(&self) -> SpinlockGuard<'_, T> {
        let irq = IrqGuard::new();
        self.acquire();
        SpinlockGuard {
            lock: self,
            _irq: Some(irq),
        }
    }

    /// Returns whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    pub fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    /// Consumes the lock, returning it's value.
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn acquire(&self) {
        while !self.try_acquire() {
            // spin on a plain load so the cache line isn't bounced around
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }
}

impl<T: Default> Default for Spinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Debug> Debug for Spinlock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Spinlock").field("data", &*guard).finish(),
            None => f.write_str("Spinlock { <locked> }"),
        }
    }
}

/// Grants access to the value in a [`Spinlock`], unlocking it when dropped.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    // dropped after the lock is released, since fields drop after `Drop::drop`
    _irq: Option<IrqGuard>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: Holding the guard means we hold the lock
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: Holding the guard means we hold the lock
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    /// Tests that `InitLater` can only be initialised once.
    #[test]
    fn initlater_inits_once() {
        let init = InitLater::uninit();
        assert!(init.init(0x42).is_ok());
        assert!(init.init(0x43).is_err())
    }

    /// Tests that `InitLater` can't be read from before it's initialised.
    #[test]
    fn initlater_cant_read_before_init() {
        let init = InitLater::uninit();
        assert!(init.read().is_err());
        assert!(!init.is_init());
        let val = init.init(0x42).unwrap();
        assert_eq!(val, &0x42);
        assert!(init.is_init())
    }

    /// Tests that a held spinlock can't be taken twice.
    #[test]
    fn spinlock_excludes() {
        let lock = Spinlock::new(7);
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        assert_eq!(*lock.try_lock().unwrap(), 7)
    }

    /// Tests that `lock_irqsave` releases the lock like `lock` does.
    #[test]
    fn irqsave_guard_unlocks() {
        let lock = Spinlock::new(0u32);
        {
            let mut guard = lock.lock_irqsave();
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 1);
    }

    /// Tests that no increments get lost when many threads fight over a lock.
    #[test]
    fn spinlock_counts_across_threads() {
        let lock = Arc::new(Spinlock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();

        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(*lock.lock(), 40_000)
    }
}
