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
    kernel/src/interrupts/pic.rs

    Handle PIC initialisation, masking and EOI.
    Contained within the interrupts module
*/

use core::convert::Infallible;

use super::IRQ_START;
use crate::ports::{self, Port, writeb};
use crate::startup::{self, ExitCode};

/// Offset to the secondary PIC from the first.
const SECONDARY_OFFSET: u8 = 8;

/// The IRQ used to forward ints from the secondary to main PICs.
const FORWARD_IRQ: u8 = 2;

/// Only the PIT (IRQ 0) and keyboard (IRQ 1) start unmasked.
const INITIAL_MAIN_MASK: u8 = 0b1111_1100;
const INITIAL_SECONDARY_MASK: u8 = 0b1111_1111;

/// Sends the EOI command to the corresponding PIC.
pub fn eoi(irq: u8) {
      /// End of interrupt command, tells PIC the interrupt's over.
      const EOI_COMMAND: u8 = 0x20;

      // The PICs only support 8 IRQs each (0-15)
      if irq > 15 {
            warn!("pic: unknown eoi irq: {irq}");
            return;
      }

      // Safety: If the IRQ came from the main (master) PIC, the EOI must be
      // sent to the main only. However if the IRQ came from the secondary
      // (slave) PIC, the command must be sent to both
      unsafe {
            if irq >= SECONDARY_OFFSET {
                  writeb(Port::SecondaryPicCmd, EOI_COMMAND);
            }
            writeb(Port::MainPicCmd, EOI_COMMAND);
      }
}

/// Remaps the main and secondary PICs to vectors 32-47.
///
/// # Safety
/// Only run this ONCE at startup time.
pub unsafe fn init() -> ExitCode<Infallible> {
      /// ICW1: initialise, cascade mode, expect ICW4.
      const ICW1_INIT: u8 = 0x11;

      /// ICW4: use 8086 mode instead of 8080.
      const ICW4_8086: u8 = 0x01;

      // Safety: Caller must ensure this is only called once
      unsafe {
            writeb(Port::MainPicCmd, ICW1_INIT);
            writeb(Port::SecondaryPicCmd, ICW1_INIT);

            // ICW2, the vector offsets
            writeb(Port::MainPicData, IRQ_START);
            writeb(Port::SecondaryPicData, IRQ_START + SECONDARY_OFFSET);

            // ICW3, tell both where forwarded ints will go / come from
            writeb(Port::MainPicData, 1 << FORWARD_IRQ);
            writeb(Port::SecondaryPicData, FORWARD_IRQ);

            writeb(Port::MainPicData, ICW4_8086);
            writeb(Port::SecondaryPicData, ICW4_8086);

            writeb(Port::MainPicData, INITIAL_MAIN_MASK);
            writeb(Port::SecondaryPicData, INITIAL_SECONDARY_MASK);
      };

      // Safety: Just initialised it above
      unsafe { startup::PIC_INIT.store(true) }

      ExitCode::Infallible
}

/// Returns the data port of the PIC serving `irq` and the line's bit in it's mask.
fn line(irq: u8) -> (Port, u8) {
      if irq < SECONDARY_OFFSET {
            (Port::MainPicData, 1 << irq)
      } else {
            (Port::SecondaryPicData, 1 << (irq - SECONDARY_OFFSET))
      }
}

/// Stops `irq` from being delivered.
pub fn mask(irq: u8) {
      if irq > 15 {
            return;
      }

      let _irq = libutil::IrqGuard::new();
      let (port, bit) = line(irq);
      // Safety: Read-modify-write of the mask with interrupts off
      unsafe { writeb(port, ports::readb(port) | bit) }
}

/// Allows `irq` to be delivered, also opening the cascade line for secondary IRQs.
pub fn unmask(irq: u8) {
      if irq > 15 {
            return;
      }

      let _irq = libutil::IrqGuard::new();
      let (port, bit) = line(irq);
      // Safety: Read-modify-write of the mask with interrupts off
      unsafe {
            writeb(port, ports::readb(port) & !bit);
            if irq >= SECONDARY_OFFSET {
                  let main = ports::readb(Port::MainPicData);
                  writeb(Port::MainPicData, main & !(1 << FORWARD_IRQ));
            }
      }
}

/// Returns the `(main, secondary)` interrupt masks.
#[cfg(test)]
pub fn masks() -> (u8, u8) {
      // Safety: Just reading the masks
      unsafe { (ports::readb(Port::MainPicData), ports::readb(Port::SecondaryPicData)) }
}

#[cfg(test)]
mod tests {
      use super::*;

      /// Tests that only the PIT and keyboard lines are unmasked after startup.
      #[test_case]
      fn only_timer_and_keyboard_unmasked() {
            let (main, secondary) = masks();
            assert_eq!(main & 0b11, 0);
            assert_eq!(main & !0b11, INITIAL_MAIN_MASK & !0b11);
            assert_eq!(secondary, INITIAL_SECONDARY_MASK);
      }

      /// Tests that masking a secondary line and unmasking it again opens the cascade.
      #[test_case]
      fn secondary_lines_open_the_cascade() {
            let prev = masks();
            unmask(12);
            let (main, secondary) = masks();
            assert_eq!(main & (1 << FORWARD_IRQ), 0);
            assert_eq!(secondary & (1 << 4), 0);

            mask(12);
            // Safety: Restoring the masks from before the test
            unsafe {
                  writeb(Port::MainPicData, prev.0);
                  writeb(Port::SecondaryPicData, prev.1);
            }
      }
}
