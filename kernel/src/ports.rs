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
      kernel/src/ports.rs

      Allows writing to and reading from specific I/O ports.

      Generally, I/O ports should never be accessed inside of interrupt
      handlers, as the just interrupted code could be in the middle of
      sending a command or performing a read, which would become malformed
      due to the interrupt handler's greedy port access. The only exceptions
      are the PIC command ports and the PS/2 data port, which are owned by
      the IRQ path.
*/

use core::arch::asm;

/// An I/O port which can be written to or read from.
#[derive(Debug, Clone, Copy)]
#[repr(u16)]
#[allow(dead_code)]
pub enum Port {
      // --- PIC ports ---
      /// The main / master PIC command port, write only
      MainPicCmd       = 0x20,

      /// The main / master PIC data port, read & write
      MainPicData      = 0x21,

      /// The secondary / slave PIC command port, write only
      SecondaryPicCmd  = 0xA0,

      /// The secondary / slave PIC data port, read & write
      SecondaryPicData = 0xA1,

      // --- PIT ports ---
      /// Port connected to channel 0 of the PIT, read & write
      PITChannel0      = 0x40,

      /// Port connected to channel 1 of the PIT, unused on modern machines
      PITChannel1      = 0x41,

      /// Port connected to channel 2 of the PIT, read & write
      PITChannel2      = 0x42,

      /// Port used to send commands to the PIT, write only
      PITCmd           = 0x43,

      // --- PS/2 ports ---
      /// PS/2 data port, read & write
      PS2Data          = 0x60,

      /// PS/2 status (read) and command (write) port
      PS2Status        = 0x64,

      /// System control port B, bits 0 & 1 gate the PC speaker
      PCSpeaker        = 0x61,

      // --- VGA ports ---
      /// Used to select which VGA register `VGARegisterC` is connected to
      /// (see https://wiki.osdev.org/VGA_Hardware#Port_0x3C4,_0x3CE,_0x3D4)
      VGASelectorC     = 0x3D4,

      /// VGA register selected by `VGASelectorC`, read & write
      VGARegisterC     = 0x3D5,

      // --- ATA ports ---
      /// First register of the primary ATA channel, the other seven follow it
      AtaPrimaryIo     = 0x1F0,

      /// Alternate status (read) and device control (write) of the primary channel
      AtaPrimaryCtrl   = 0x3F6,

      /// First register of the secondary ATA channel
      AtaSecondaryIo   = 0x170,

      /// Alternate status and device control of the secondary channel
      AtaSecondaryCtrl = 0x376,

      // --- QEMU ports ---
      /// When written to inside of QEMU causes it to immediately exit
      /// (actually Disk Controller status register).
      QemuExit         = 0xF4,

      /// Serial Port 1 (COM1), mirrors the console to the host
      SerialPort1      = 0x3F8,

      // --- Misc ports ---
      /// Unused port (POST codes apparently) used for dummy waits read & write
      Unused           = 0x80,
}

impl From<Port> for u16 {
      fn from(val: Port) -> Self {
            val as u16
      }
}

impl Port {
      /// Returns the port `offset` registers after `self`.
      pub const fn offset(self, offset: u16) -> u16 {
            self as u16 + offset
      }
}

/// Writes `val` to port `port` after a dummy write for a delay,
/// if a delay isn't needed use [`writeb_nodummy`].
/// # Safety
/// Writes to I/O ports. 
/// See module doc comment for accessing inside of interrupt handlers.
// uses the P generic to allow accessing via both the Port enum & regular u16s
pub unsafe fn writeb<P: Into<u16>>(port: P, val: u8) {
      // Safety: The caller must ensure that writing to the port is safe
      unsafe {
            io_delay();
            writeb_nodummy(port.into(), val);
      }
}

/// Writes `val` to port `Port` without a dummy write delay.
/// # Safety
/// See module doc comment for accessing inside of interrupt handlers.
pub unsafe fn writeb_nodummy<P: Into<u16>>(port: P, val: u8) {
      // Safety: The caller must ensure that writing to this port is safe
      unsafe { asm!("out dx, al", in("dx") port.into(), in("al") val, options(nomem, nostack, preserves_flags)) }
}

/// Returns the value in port `port` after a dummy write for a delay,
/// if a delay isn't needed use [`readb_nodummy`].
/// # Safety
/// Reads from I/O ports.
/// See module doc comment for accessing inside of interrupt handlers.
pub unsafe fn readb<P: Into<u16>>(port: P) -> u8 {
      // Safety: The caller must ensure that reading from this port is safe
      unsafe {
            io_delay();
            readb_nodummy(port)
      }
}

/// Returns the value in port `port` without a dummy write delay.
/// # Safety
/// Reads from I/O ports.
/// See module doc comment for accessing inside of interrupt handlers.
pub unsafe fn readb_nodummy<P: Into<u16>>(port: P) -> u8 {
      let val;
      // Safety: The caller must ensure that reading from this port is safe
      unsafe { asm!("in al, dx", out("al") val, in("dx") port.into(), options(nomem, nostack, preserves_flags)) }
      val
}

/// Writes the word `val` to `port`.
/// # Safety
/// Writes to I/O ports.
pub unsafe fn writew<P: Into<u16>>(port: P, val: u16) {
      // Safety: The caller must ensure that writing to this port is safe
      unsafe { asm!("out dx, ax", in("dx") port.into(), in("ax") val, options(nomem, nostack, preserves_flags)) }
}

/// Returns the word in `port`.
/// # Safety
/// Reads from I/O ports.
pub unsafe fn readw<P: Into<u16>>(port: P) -> u16 {
      let val;
      // Safety: The caller must ensure that reading from this port is safe
      unsafe { asm!("in ax, dx", out("ax") val, in("dx") port.into(), options(nomem, nostack, preserves_flags)) }
      val
}

/// Writes the double word `val` to `port`.
/// # Safety
/// Writes to I/O ports.
pub unsafe fn writel<P: Into<u16>>(port: P, val: u32) {
      // Safety: The caller must ensure that writing to this port is safe
      unsafe { asm!("out dx, eax", in("dx") port.into(), in("eax") val, options(nomem, nostack, preserves_flags)) }
}

/// Returns the double word in `port`.
/// # Safety
/// Reads from I/O ports.
pub unsafe fn readl<P: Into<u16>>(port: P) -> u32 {
      let val;
      // Safety: The caller must ensure that reading from this port is safe
      unsafe { asm!("in eax, dx", out("eax") val, in("dx") port.into(), options(nomem, nostack, preserves_flags)) }
      val
}

/// Writes to the unused POST port, giving slow devices roughly a microsecond to catch up.
/// # Safety
/// Writes to I/O ports.
pub unsafe fn io_delay() {
      // Safety: Nothing listens on port 0x80 after POST
      unsafe { writeb_nodummy(Port::Unused, 0) }
}

#[cfg(test)]
mod tests {
      use super::*;

      /// Tests that port offsets land on the right ATA registers.
      #[test_case]
      fn ata_register_offsets() {
            assert_eq!(Port::AtaPrimaryIo.offset(7), 0x1F7);
            assert_eq!(Port::AtaSecondaryIo.offset(6), 0x176);
      }

      /// Tests that the PIC mask survives a write and read through the data port.
      #[test_case]
      fn pic_mask_round_trips() {
            // Safety: Restoring the mask straight after, with interrupts off
            unsafe {
                  let _irq = libutil::IrqGuard::new();
                  let prev = readb(Port::SecondaryPicData);
                  writeb(Port::SecondaryPicData, 0xAA);
                  assert_eq!(readb(Port::SecondaryPicData), 0xAA);
                  writeb(Port::SecondaryPicData, prev);
            }
      }

      /// Tests double word transfers against the PCI config address register.
      #[test_case]
      fn pci_address_round_trips() {
            const PCI_CONFIG_ADDRESS: u16 = 0xCF8;

            // Safety: Nothing else touches PCI config space, the old address is put back
            unsafe {
                  let _irq = libutil::IrqGuard::new();
                  let prev = readl(PCI_CONFIG_ADDRESS);
                  writel(PCI_CONFIG_ADDRESS, 0x8000_0000);
                  assert_eq!(readl(PCI_CONFIG_ADDRESS), 0x8000_0000);
                  writel(PCI_CONFIG_ADDRESS, prev);
            }
      }
}
