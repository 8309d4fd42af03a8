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
    kernel/src/interrupts.rs

    The IDT, the PICs and the handler tables behind every vector
*/

use crate::{exit_on_err, startup::ExitCode};
use core::{arch::asm, fmt::Display};
use idt::InterruptDescriptor;
use libutil::{InitLater, LoadRegisterError, TableDescriptor};

pub use dispatch::{RegisterError, register_irq, spurious_irqs};
// Nothing outside of the tests hooks exceptions yet
#[cfg_attr(not(test), allow(unused))]
pub use dispatch::{ExceptionInfo, register_isr, unregister_irq};
pub use pic::init as init_pic;

/// Handles loading the IDT and it's entry stubs.
mod idt;

/// Routes exceptions and IRQs to their registered handlers.
mod dispatch;

/// Loads both PICs and allows sending EOI commands.
mod pic;

/// Where IRQ vectors start in the IDT.
pub const IRQ_START: u8 = 32;

/// The software interrupt vector, handled like an exception that never kills the kernel.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// The loaded IDT.
pub static IDT: InitLater<Idt> = InitLater::uninit();

/// The Interrupt Descriptor Table.
#[derive(Debug)]
#[repr(transparent)]
pub struct Idt([InterruptDescriptor; 256]);

/// The interrupt stack frame.
#[derive(Debug, Default)]
#[repr(C)]
pub struct IntStackFrame {
    pub ip: u64,
    pub cs: u64,
    pub flags: u64,
    pub sp: u64,
    pub ss: u64,
}

impl Display for IntStackFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "  Location: 0x{:x}   Flags: 0x{:x}   Code segment: 0x{:x}\n  Stack pointer: 0x{:x}   Stack segment: 0x{:x}",
            self.ip, self.flags, self.cs, self.sp, self.ss
        )
    }
}

/// Loads the IDT into the `IDT` static.
///
/// # Safety
/// Only run this once, early into startup, after the GDT is loaded.
pub unsafe fn load_idt() -> ExitCode<LoadRegisterError<Idt>> {
    let idt = exit_on_err!(IDT.init(Idt::new()), Stop);
    dbg_info!("IDT loaded at 0x{:x}", idt as *const Idt as u64);

    // Safety: Using properly filled out IDT.
    let loaded_idt = unsafe { idt.load() };

    // Return Err if sidt (store IDT) != descriptor passed to lidt
    if idt_register() != loaded_idt {
        return ExitCode::Stop(LoadRegisterError::Store("IDT"));
    }

    ExitCode::Ok
}

/// Returns the current value in the IDT register.
pub fn idt_register() -> TableDescriptor<Idt> {
    let mut idt = TableDescriptor::invalid();
    // Safety: We're just storing a value
    unsafe { asm!("sidt [{}]", in(reg) (&mut idt), options(preserves_flags, nostack)) };
    idt
}

/// Sets external interrupts.
pub fn sti() {
    // Safety: Handlers for every IRQ are installed before the PIC unmasks them
    unsafe { asm!("sti", options(nomem, nostack)) }
}

/// Clears external interrupts.
pub fn cli() {
    // Safety: Just masking interrupts
    unsafe { asm!("cli", options(nomem, nostack)) }
}

/// Halts until the next interrupt.
pub fn hlt() {
    // Safety: The next interrupt wakes us back up
    unsafe { asm!("hlt", options(nomem, nostack)) }
}

/// Returns whether external interrupts are enabled.
pub fn are_enabled() -> bool {
    let flags: u64;
    // Safety: Just reading RFLAGS
    unsafe { asm!("pushfq", "pop {}", out(reg) flags, options(nomem, preserves_flags)) }
    flags & (1 << 9) != 0
}

/// Causes a triple fault.
/// Can be used as the stupidest way ever to restart the device.
pub fn triple_fault() -> ! {
    // Safety: We're deliberately being very unsafe here
    unsafe {
        let descriptor = TableDescriptor::<Idt>::invalid();
        asm!("lidt ({0})", in(reg) &descriptor, options(att_syntax)); // load invalid descriptor
        asm!("int 0x42") //  gpf -> double fault -> triple fault
    }
    crate::hang()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that various structs passed to the CPU are the size that the CPU expects them.
    #[test_case]
    fn structs_have_the_right_size() {
        assert_eq!(size_of::<IntStackFrame>(), 40);
        assert_eq!(size_of::<InterruptDescriptor>(), 16);
        assert_eq!(size_of::<Idt>(), size_of::<InterruptDescriptor>() * 256);
    }

    /// Tests that the IF flag follows sti and cli.
    #[test_case]
    fn interrupt_flag_tracks_sti_cli() {
        let were_enabled = are_enabled();
        cli();
        assert!(!are_enabled());
        sti();
        assert!(are_enabled());
        if !were_enabled {
            cli();
        }
    }
}
