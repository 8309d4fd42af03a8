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
    kernel/src/interrupts/dispatch.rs

    The common exception and IRQ handlers every stub calls into.
    Contained within the interrupts module
*/

use super::{IntStackFrame, SYSCALL_VECTOR, pic};
use crate::{speaker, vga::buffers};
use core::{
    arch::asm,
    sync::atomic::{AtomicUsize, Ordering},
};
use libutil::Spinlock;
use thiserror::Error;

/// A handler for an exception or the software interrupt.
pub type IsrHandler = fn(&ExceptionInfo);

/// A handler for a hardware IRQ, the EOI is sent after it returns.
pub type IrqHandler = fn();

/// Everything the CPU told us about an exception.
pub struct ExceptionInfo<'a> {
    pub vector: u8,
    pub error_code: Option<u64>,
    pub frame: &'a IntStackFrame,
}

/// Exception handlers, only vectors 0-31 and [`SYSCALL_VECTOR`] are ever filled.
static ISR_HANDLERS: Spinlock<[Option<IsrHandler>; 256]> = Spinlock::new([None; 256]);

/// IRQ handlers, indexed by IRQ line.
static IRQ_HANDLERS: Spinlock<[Option<IrqHandler>; 16]> = Spinlock::new([None; 16]);

/// IRQs which fired without a registered handler.
static SPURIOUS: AtomicUsize = AtomicUsize::new(0);

/// The breakpoint exception, which is a trap we can return from.
const BREAKPOINT: u8 = 3;

/// The page fault exception.
const PAGE_FAULT: u8 = 14;

/// Names of the 32 CPU exceptions.
#[rustfmt::skip]
static EXCEPTION_NAMES: [&str; 32] = [
    "divide error",       "debug",                 "NMI",                   "breakpoint",
    "overflow",           "bound range exceeded",  "invalid opcode",        "device not available",
    "double fault",       "coprocessor overrun",   "invalid TSS",           "segment not present",
    "stack fault",        "GP fault",              "page fault",            "reserved",
    "x87 FP error",       "alignment check",       "machine check",         "SIMD FP error",
    "virtualization",     "control protection",    "reserved",              "reserved",
    "reserved",           "reserved",              "reserved",              "reserved",
    "hypervisor injection", "VMM communication",   "security exception",    "reserved",
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegisterError {
    #[error("vector {0} already has a handler")]
    Taken(u8),

    #[error("vector {0} can't take a handler")]
    BadVector(u8),

    #[error("the PIC isn't init")]
    NoPic,
}

/// Installs `handler` for exception `vector` (0-31) or the software interrupt.
///
/// Double faults always use their own handler.
#[cfg_attr(not(test), allow(unused))]
pub fn register_isr(vector: u8, handler: IsrHandler) -> Result<(), RegisterError> {
    if (vector >= 32 && vector != SYSCALL_VECTOR) || vector == 8 {
        return Err(RegisterError::BadVector(vector));
    }

    let mut handlers = ISR_HANDLERS.lock_irqsave();
    let slot = &mut handlers[vector as usize];
    if slot.is_some() {
        return Err(RegisterError::Taken(vector));
    }

    *slot = Some(handler);
    Ok(())
}

/// Installs `handler` for IRQ line `irq` and unmasks it.
pub fn register_irq(irq: u8, handler: IrqHandler) -> Result<(), RegisterError> {
    if !crate::startup::PIC_INIT.load() {
        return Err(RegisterError::NoPic);
    }

    let mut handlers = IRQ_HANDLERS.lock_irqsave();
    let slot = handlers.get_mut(irq as usize).ok_or(RegisterError::BadVector(irq))?;
    if slot.is_some() {
        return Err(RegisterError::Taken(irq));
    }

    *slot = Some(handler);
    pic::unmask(irq);
    Ok(())
}

/// Masks IRQ line `irq` and removes it's handler, returning it.
#[cfg_attr(not(test), allow(unused))]
pub fn unregister_irq(irq: u8) -> Option<IrqHandler> {
    pic::mask(irq);
    IRQ_HANDLERS.lock_irqsave().get_mut(irq as usize)?.take()
}

/// Returns how many IRQs have arrived without a handler.
pub fn spurious_irqs() -> usize {
    SPURIOUS.load(Ordering::Relaxed)
}

/// Ran by every exception stub.
///
/// Calls the registered handler if there is one, otherwise breakpoints and
/// the software interrupt are logged and everything else is fatal.
///
/// Breakpoints are the only CPU exception (vectors 0 to 31) which isn't fatal
/// without a handler. `int3` is a trap, so the saved `ip` already points past it
/// and returning resumes right after the breakpoint.
pub(super) fn exception(vector: u8, error_code: Option<u64>, frame: &IntStackFrame) {
    let info = ExceptionInfo {
        vector,
        error_code,
        frame,
    };

    // An exception raised while the table is locked falls through to the defaults
    let handler = ISR_HANDLERS.try_lock().and_then(|h| h[vector as usize]);
    if let Some(handler) = handler {
        return handler(&info);
    }

    match vector {
        BREAKPOINT => println!(fg = Yellow, "breakpoint at 0x{:x}", frame.ip),
        SYSCALL_VECTOR => {
            warn!("unhandled software interrupt at 0x{:x}", frame.ip);
        }
        _ => fatal(&info),
    }
}

/// Ran by every IRQ stub, the EOI is always the last thing sent.
pub(super) fn irq(irq: u8) {
    let handler = IRQ_HANDLERS.try_lock().and_then(|h| h[irq as usize]);
    match handler {
        Some(handler) => handler(),
        None => {
            SPURIOUS.fetch_add(1, Ordering::Relaxed);
        }
    }

    pic::eoi(irq);
}

/// Prints the exception and hangs forever.
fn fatal(info: &ExceptionInfo) -> ! {
    super::cli();
    speaker::stop();

    // Safety: Whoever held the buffer is never getting control back
    unsafe { buffers::BUFFER_HELD.store(false) }

    let name = EXCEPTION_NAMES.get(info.vector as usize).unwrap_or(&"unknown");
    println!(fg = LightRed, "\nEXCEPTION {} ({name})", info.vector);
    match info.error_code {
        Some(code) => println!("Error code: 0x{code:x}"),
        None => println!("Error code: none"),
    }
    println!("RIP: 0x{:x}\n{}", info.frame.ip, info.frame);

    if let Some(code) = info.error_code {
        match info.vector {
            PAGE_FAULT => pf_errcode(code),
            13 => gp_errcode(code),
            _ => (),
        }
    }

    #[cfg(test)]
    crate::tests::exit_qemu(true);

    #[cfg(not(test))]
    crate::hang()
}

/// Returns `true` if bit `bit` in `code` is set.
fn bit_set(code: u64, bit: u64) -> bool {
    code & (1 << bit) != 0
}

/// Prints out page fault info based on `errcode`.
fn pf_errcode(errcode: u64) {
    let rw = if bit_set(errcode, 1) { "Wrote" } else { "Read" };
    let cause = if bit_set(errcode, 0) {
        "Page-protection Violation"
    } else {
        "Non-present page"
    };

    let cr2: usize;
    // Safety: Just reading from a register
    unsafe { asm!("mov {}, cr2", out(reg) cr2) };
    println!("{rw} {cause} ({errcode:b})\nCR2: 0x{cr2:x}")
}

/// Prints out general protection fault info based on `errcode`.
#[rustfmt::skip]
fn gp_errcode(errcode: u64) {
    let ext = if bit_set(errcode, 0) {
        "External"
    } else {
        "Non-external"
    };
    let null = if errcode & !1 == 0 { " null" } else { "" };
    let idx = errcode >> 3; // segment selector idx
    let gate = match (errcode >> 1) & 0b11 { // IDT & TI bits
        0b00 => "GDT",
        0b10 => "LDT",
        _ => "IDT",
    };

    println!("{ext}{null} in {gate} ({errcode:b})\nIndex: {idx}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU8;

    static SEEN: AtomicU8 = AtomicU8::new(0);

    fn software_interrupt(info: &ExceptionInfo) {
        SEEN.store(info.vector, Ordering::Relaxed);
    }

    /// Tests that a registered software interrupt handler runs and the kernel carries on.
    #[test_case]
    fn software_interrupt_reaches_handler() {
        register_isr(SYSCALL_VECTOR, software_interrupt).unwrap();
        // Safety: Vector 0x80 has a handler which just records it ran
        unsafe { asm!("int 0x80") }
        assert_eq!(SEEN.load(Ordering::Relaxed), SYSCALL_VECTOR);
    }

    /// Tests that vectors only ever take one handler.
    #[test_case]
    fn vectors_take_one_handler() {
        fn nothing(_: &ExceptionInfo) {}

        assert_eq!(register_isr(8, nothing), Err(RegisterError::BadVector(8)));
        assert_eq!(register_isr(40, nothing), Err(RegisterError::BadVector(40)));
        assert_eq!(register_irq(16, || ()), Err(RegisterError::BadVector(16)));
        assert_eq!(register_irq(0, || ()), Err(RegisterError::Taken(0))); // the PIT
    }

    /// Tests that an IRQ line can be handed back and taken again.
    #[test_case]
    fn irqs_can_be_unregistered() {
        // Nothing is wired to IRQ 5 under QEMU
        register_irq(5, || ()).unwrap();
        assert!(unregister_irq(5).is_some());
        assert!(unregister_irq(5).is_none());
        register_irq(5, || ()).unwrap();
        assert!(unregister_irq(5).is_some());
    }

    /// Tests that breakpoints are reported and execution continues.
    #[test_case]
    fn breakpoints_continue() {
        // Safety: Breakpoints without a handler just print
        unsafe { asm!("int3") }
    }
}
