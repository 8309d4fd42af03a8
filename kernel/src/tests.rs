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
    kernel/src/tests.rs

    Handles running tests inside of QEMU.
    Only compiled on test builds
*/

use crate::ports::{self, Port};
use core::any;

/// Test functions marked with the `#[test_case]` attribute
pub trait Test {
    fn test(&self);
}

impl<T: Fn()> Test for T {
    fn test(&self) {
        let name = any::type_name::<Self>();
        print!("test {name} ");
        self();
        println!("- passed")
    }
}

/// Exits QEMU, returning an error if `error` is set.
pub fn exit_qemu(error: bool) -> ! {
    /// The exit code marked as a successful exit by QEMU.
    const SUCCESS_EXIT_CODE: u8 = 0x42;

    // Safety: Port 0xF4 can be used when ran in tests to exit QEMU with a one byte error code
    unsafe { ports::writeb(Port::QemuExit, SUCCESS_EXIT_CODE + error as u8) }

    // If QEMU fails to exit, just loop until the tests timeout
    crate::hang()
}

/// Runs all of the tests, every startup task has already run.
pub fn run_tests(tests: &[&dyn Test]) -> ! {
    println!("\nRunning {} unit tests...", tests.len());
    tests.iter().for_each(|f| f.test());
    println!("\nAll tests passed");
    exit_qemu(false)
}
