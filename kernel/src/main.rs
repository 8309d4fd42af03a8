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
    kernel/src/main.rs

    The kernel's entry point
*/

#![no_std]
#![no_main]
#![test_runner(tests::run_tests)]
#![reexport_test_harness_main = "tests"]
#![forbid(static_mut_refs)]
#![feature(abi_x86_interrupt, yeet_expr, custom_test_frameworks, trim_prefix_suffix)]
#![allow(
    clippy::unusual_byte_groupings,
    clippy::deref_addrof,
    clippy::identity_op
)]

extern crate alloc;

#[macro_use]
mod vga;
#[macro_use]
mod startup;
mod ata;
mod fs;
mod gdt;
mod interrupts;
mod keyboard;
mod memory;
mod panic;
mod ports;
mod serial;
mod shell;
mod speaker;
#[cfg(test)]
mod tests;
mod time;

use bootloader::BootInfo;

// Warn anyone just running `cargo build` to use seeder tool
#[cfg(any(debug_assertions, not(feature = "bootimage")))]
compile_error!(
    "Please build marigold using seeder, run `cargo sdr help` in the main marigold directory for help"
);

/// The kernel entry point, called by the bootloader in long mode.
/// # Safety
/// Please don't run the kernel twice.
#[unsafe(export_name = "_start")]
pub unsafe extern "C" fn kmain(boot_info: &'static BootInfo) -> ! {
    // Can't fail, nothing else sets it
    _ = memory::BOOT_INFO.init(boot_info);

    // Safety: Considering that this is the kernel entry point,
    // I'm pretty sure these startup tasks are only being ran once
    unsafe {
        startup::run("Connected VGA", vga::init);
        startup::run("Prepared TSS load", gdt::setup_tss);
        startup::run("Loaded GDT", gdt::load_gdt);
        startup::run("Finished TSS load", gdt::load_tss);
        startup::run("Loaded IDT", interrupts::load_idt);
        startup::run("Initialised PIC", interrupts::init_pic);
        startup::run("Set PIT frequency", time::init);
        startup::run("Initialised keyboard", keyboard::init);
        startup::run("Initialised heap", memory::init);
        startup::run("Probed ATA drives", ata::probe);
        startup::run("Initialised filesystems", fs::init);
        startup::run("Mounted root filesystem", fs::mount_root);
    }

    #[cfg(test)]
    tests();

    vga::draw_topbar("  Shell  ");
    println!(fg = Green, "\nOS ready \u{1}\n");
    vga::cursor::update_visual_pos();
    speaker::play_song(&speaker::CHIME);
    shell::run()
}

/// Hangs forever, never returning.
/// Only use this when you have to.
#[unsafe(no_mangle)]
#[unsafe(naked)]
extern "C" fn hang() -> ! {
    core::arch::naked_asm!(
        "cli",                         // disable ints to make sure nothing else is run
        "mov rbx, 0xDeadDeadDeadDead", // pseudo error message which can be viewed in QEMU
        "hlt",                         // save power by halting
        "jmp hang"                     // halt can get bypassed by a NMI or System Management Mode
    )
}
