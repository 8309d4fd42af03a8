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
    kernel/src/time.rs

    Handles the i8253/i8254 PIT and the kernel's tick counter
*/

use core::hint;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::interrupts::{self, RegisterError};
use crate::ports::{self, Port};
use crate::startup::{self, ExitCode};

/// The base frequency of the PIT.
pub const PIT_BASE_FREQ: u32 = 1193180;

/// How many ticks the PIT fires per second, set through the VERSION file.
pub const TICK_HZ: u32 = crate::env_as_int!("MGK_PIT_HZ", u32);

/// Sleeps shorter than this many milliseconds always spin.
const MIN_HALT_MS: u32 = 5;

/// Ticks since the PIT was programmed.
static TICKS: AtomicU32 = AtomicU32::new(0);

/// Returns the channel 0 reload value used for `hz`.
pub const fn divisor(hz: u32) -> u16 {
      let div = if hz == 0 { u32::MAX } else { PIT_BASE_FREQ / hz };

      if div < 2 {
            2
      } else if div > u16::MAX as u32 {
            u16::MAX
      } else {
            div as u16
      }
}

/// Returns the mode command byte used for `hz`.
#[rustfmt::skip]
pub const fn command(hz: u32) -> u8 {
      /// Binary mode, square wave, low & high byte, channel 0
      const SQUARE_WAVE: u8 = 0b00_11_011_0;

      /// Binary mode, rate generator, low & high byte, channel 0
      const RATE_GEN: u8    = 0b00_11_010_0;

      if hz >= 19 { SQUARE_WAVE } else { RATE_GEN }
}

/// Programs PIT channel 0 to [`TICK_HZ`] and starts counting ticks.
///
/// # Safety
/// Only run once at startup, after the PIC has been remapped.
pub unsafe fn init() -> ExitCode<RegisterError> {
      if !startup::PIC_INIT.load() {
            return ExitCode::Error(RegisterError::NoPic);
      }

      let div = divisor(TICK_HZ);

      // Safety: Sending a valid command followed by it's reload value
      unsafe {
            ports::writeb(Port::PITCmd, command(TICK_HZ));
            ports::writeb(Port::PITChannel0, div as u8); // low byte
            ports::writeb(Port::PITChannel0, (div >> 8) as u8); // high byte
      }

      exit_on_err!(interrupts::register_irq(0, tick));

      // Safety: Was just initialised above
      unsafe { startup::PIT_INIT.store(true) }

      interrupts::sti();
      ExitCode::Ok
}

/// IRQ 0 handler.
fn tick() {
      TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Returns how many ticks the kernel has been running for.
pub fn ticks() -> u32 {
      TICKS.load(Ordering::Relaxed)
}

/// Converts `ms` into ticks, rounding up.
pub const fn ms_to_ticks(ms: u32) -> u32 {
      let ticks = (ms as u64 * TICK_HZ as u64).div_ceil(1000);
      if ticks > u32::MAX as u64 {
            u32::MAX
      } else {
            ticks as u32
      }
}

/// Spins for at least `ms` milliseconds.
///
/// Never returns if external interrupts are disabled.
pub fn sleep_busy(ms: u32) {
      if !startup::PIT_INIT.load() {
            warn!("pit: attempted sleeping ({ms} ms) without a PIT!");
            return;
      }

      let start = ticks();
      let wait = ms_to_ticks(ms);
      while ticks().wrapping_sub(start) < wait {
            hint::spin_loop();
      }
}

/// Halts between ticks until at least `ms` milliseconds have passed.
///
/// Short sleeps and sleeps with interrupts disabled use [`sleep_busy`] instead.
pub fn sleep_interrupt(ms: u32) {
      if ms < MIN_HALT_MS || !interrupts::are_enabled() {
            return sleep_busy(ms);
      }

      if !startup::PIT_INIT.load() {
            warn!("pit: attempted sleeping ({ms} ms) without a PIT!");
            return;
      }

      let start = ticks();
      let wait = ms_to_ticks(ms);
      while ticks().wrapping_sub(start) < wait {
            interrupts::sti();
            interrupts::hlt();
      }
}

#[cfg(test)]
mod tests {
      use super::*;

      /// Tests the divisor clamps and the mode fallback.
      #[test_case]
      fn divisor_is_clamped() {
            assert_eq!(divisor(1000), 1193);
            assert_eq!(divisor(PIT_BASE_FREQ), 2);
            assert_eq!(divisor(1), u16::MAX);
            assert_eq!(command(18), 0x34);
            assert_eq!(command(100), 0x36);
      }

      /// Tests that ticks never go backwards.
      #[test_case]
      fn ticks_are_monotonic() {
            let mut prev = ticks();
            for _ in 0..10_000 {
                  let now = ticks();
                  assert!(now >= prev);
                  prev = now;
            }
      }

      /// Tests that `sleep_interrupt` waits for the correct amount of time.
      #[test_case]
      fn sleep_interrupt_waits_for_correct_time() {
            // Line up with a tick boundary first
            sleep_busy(1);

            let before = ticks();
            sleep_interrupt(250);
            let slept = ticks() - before;
            let expected = ms_to_ticks(250);
            assert!(slept >= expected && slept <= expected + expected / 25);
      }

      /// Tests that sleeps immediately return if the PIT failed initialisation.
      #[test_case]
      fn sleeps_require_pit() {
            let init = startup::PIT_INIT.load();
            unsafe { startup::PIT_INIT.store(false) }

            // Test fails due to timeout
            sleep_busy(u32::MAX);
            sleep_interrupt(u32::MAX);

            unsafe { startup::PIT_INIT.store(init) }
      }
}
