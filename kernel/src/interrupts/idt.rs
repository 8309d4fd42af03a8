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
    kernel/src/interrupts/idt.rs

    Builds the IDT out of one stub per vector.
    Contained within the interrupts module
*/

use super::{IRQ_START, Idt, IntStackFrame, SYSCALL_VECTOR, dispatch};
use crate::{gdt, vga::buffers};
use core::arch::{asm, naked_asm};
use libutil::TableDescriptor;

type Handler = u64;

/// Creates a stub for exception `$vector`, which hands it to [`dispatch::exception`].
macro_rules! exception {
    ($vector: literal) => {{
        extern "x86-interrupt" fn stub(frame: IntStackFrame) {
            dispatch::exception($vector, None, &frame)
        }
        stub as *const () as Handler
    }};
    ($vector: literal, errcode) => {{
        extern "x86-interrupt" fn stub(frame: IntStackFrame, code: u64) {
            dispatch::exception($vector, Some(code), &frame)
        }
        stub as *const () as Handler
    }};
}

/// Creates a stub for IRQ `$irq`, which hands it to [`dispatch::irq`].
macro_rules! irq {
    ($irq: literal) => {{
        extern "x86-interrupt" fn stub(_frame: IntStackFrame) {
            dispatch::irq($irq)
        }
        stub as *const () as Handler
    }};
}

impl Idt {
    /// Creates a new table, with all it's required entries set.
    /// This function only creates an IDT, and doesn't load it.
    #[rustfmt::skip]
    pub fn new() -> Self {
        let mut idt = Idt([InterruptDescriptor::default(); 256]);

        // A list of entry IDs can be found at: https://wiki.osdev.org/Exceptions
        let exceptions: [Handler; 32] = [
            exception!(0),           exception!(1),           exception!(2),           exception!(3),
            exception!(4),           exception!(5),           exception!(6),           exception!(7),
            double_fault_handler as *const () as Handler,     exception!(9),
            exception!(10, errcode), exception!(11, errcode), exception!(12, errcode), exception!(13, errcode),
            exception!(14, errcode), exception!(15),          exception!(16),          exception!(17, errcode),
            exception!(18),          exception!(19),          exception!(20),          exception!(21, errcode),
            exception!(22),          exception!(23),          exception!(24),          exception!(25),
            exception!(26),          exception!(27),          exception!(28),          exception!(29, errcode),
            exception!(30, errcode), exception!(31),
        ];

        let irqs: [Handler; 16] = [
            irq!(0),  irq!(1),  irq!(2),  irq!(3),  irq!(4),  irq!(5),  irq!(6),  irq!(7),
            irq!(8),  irq!(9),  irq!(10), irq!(11), irq!(12), irq!(13), irq!(14), irq!(15),
        ];

        for (vector, handler) in exceptions.into_iter().enumerate() {
            // Double faults and page faults (stack overflows) get the emergency stack
            let ist = matches!(vector, 8 | 14).then_some(1);
            idt.set_handler(vector, ist, handler);
        }

        for (irq, handler) in irqs.into_iter().enumerate() {
            idt.set_handler(IRQ_START as usize + irq, None, handler);
        }

        idt.set_handler(SYSCALL_VECTOR as usize, None, exception!(0x80));
        idt
    }

    /// Sets the table's entry with id `entry_id`
    fn set_handler(&mut self, entry_id: usize, ist: Option<u8>, handler: Handler) {
        self.0[entry_id] = InterruptDescriptor::new(handler, ist.unwrap_or_default())
    }

    /// Loads the table into the `IDTR` register.
    /// Returns the created `IDTDescriptor`.
    /// # Safety
    /// Very bad things will happen if `self` isn't properly filed out.
    pub unsafe fn load(&'static self) -> TableDescriptor<Idt> {
        let descriptor = TableDescriptor::new(self);

        // Safety: The caller must ensure that the IDT is valid
        unsafe { asm!("lidt ({0})", in(reg) &descriptor, options(att_syntax, nostack)) }

        descriptor
    }
}

/// An entry in the `IDT`
/// [`Reference`](https://wiki.osdev.org/Interrupt_Descriptor_Table#Gate_Descriptor_2)
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct InterruptDescriptor {
    /// Offset bits 0..15
    offset_low: u16,

    /// The segment selector in the GDT
    selector: u16,

    /// The offset in the IST
    ist: u8,

    /// The gate type, dpl, and present bits
    attributes: u8,

    /// Offset bits 16..31
    offset_middle: u16,

    /// Offset bits 32..63
    offset_high: u32,
    _reserved: u32,
}

impl InterruptDescriptor {
    /// Returns a new descriptor using `handler` as it's offset and `ist` for the IST.
    fn new(offset_ptr: Handler, ist: u8) -> Self {
        /// Present = 1, dpl = 0, must be zero = 0, gate type = interrupt,
        const FLAGS: u8 = 0b1_00_0_1110;

        // Force the ist to be only 3 bits, as remaining bits are reserved
        if ist > 0b111 {
            warn!("attempted creating an int descriptor with an ist > 7 ({ist}), which will be truncated!");
        }
        let ist = ist & 0b111;

        InterruptDescriptor {
            selector: gdt::cs_register(),
            offset_low: offset_ptr as u16,
            offset_middle: (offset_ptr >> 16) as u16,
            offset_high: (offset_ptr >> 32) as u32,
            ist,
            attributes: FLAGS,
            _reserved: 0,
        }
    }

    /// Returns the descriptor's pointer / offset.
    #[cfg(test)]
    fn ptr(&self) -> Handler {
        let mut ptr = self.offset_low as u64;
        ptr |= (self.offset_middle as u64) << 16;
        ptr |= (self.offset_high as u64) << 32;
        ptr
    }
}

/// Ran when a double fault occurs.
#[unsafe(naked)]
#[unsafe(no_mangle)]
extern "C" fn double_fault_handler() -> ! {
    naked_asm!(
        "cli",                         // just in case ints got enabled somehow
        "pop rax",                     // remove the empty error code double faults push
        "mov rdi, rsp",                // store stack frame in first arg
        "call print_df_info",          // print error info
        "mov rax, 0xDFDFDFDFDFDFDFDF", // pseudo error message which can be viewed in QEMU
        "jmp hang",                    // no turning back now
    );
}

/// Used by the double fault handler to print an error message.
#[unsafe(no_mangle)]
extern "C" fn print_df_info(frame: &IntStackFrame) {
    // Safety: Whoever was holding that buffer is not going to be returned to anytime soon
    unsafe { buffers::BUFFER_HELD.store(false) }
    buffers::clear();

    println!(
        fg = LightRed,
        "EXCEPTION 8 (double fault)\n\n{frame}\n
Double faults leave nothing worth trusting behind, restart the machine to continue."
    );

    #[cfg(test)]
    crate::tests::exit_qemu(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::IDT;

    /// Tests that descriptors are filled for every exception, IRQ and the software interrupt.
    #[test_case]
    fn every_vector_is_present() {
        let idt = &IDT.read().unwrap().0;
        let present = |v: usize| idt[v].attributes & 0x80 != 0 && idt[v].ptr() != 0;

        assert!((0..48).all(present));
        assert!(present(SYSCALL_VECTOR as usize));
        assert!(!present(48));
        assert_eq!(idt[8].ptr(), double_fault_handler as *const () as Handler);
        assert_eq!(idt[8].ist, 1);
    }

    /// Tests that every gate uses the kernel code segment.
    #[test_case]
    fn gates_use_kernel_cs() {
        let idt = &IDT.read().unwrap().0;
        assert!(idt[..48].iter().all(|d| d.selector == gdt::cs_register()));
    }
}
