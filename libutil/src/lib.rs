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
    libutil/src/lib.rs

    Library for some useful utilities used by marigold and it's libraries.
*/

#![cfg_attr(not(test), no_std)]

pub use ring::ByteRing;
pub use send::{LoadRegisterError, TableDescriptor};
pub use sync::{InitError, InitLater, IrqGuard, Spinlock, SpinlockGuard, UnsafeFlag};

/// Useful synchronization types.
pub mod sync;

/// Useful types when you need to send data in weird ways.
pub mod send;

/// A lock-free byte queue shared between an interrupt handler and a reader.
pub mod ring;
