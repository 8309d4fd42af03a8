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
    kernel/src/panic.rs

    The kernel panic screen
*/

use crate::{
    interrupts,
    ports::{self, Port},
    speaker,
    vga::{
        buffers::{self, YoinkedBuffer},
        cursor::{self, CursorPos},
        print::Color,
    },
};
use core::{
    hint,
    panic::{Location, PanicInfo},
    sync::atomic::{AtomicBool, Ordering},
};

/// Ran when a kernel panic occurs.
#[panic_handler]
#[cfg_attr(test, allow(unused))]
fn kernel_panic(info: &PanicInfo) -> ! {
    #[cfg(test)]
    {
        // tests fail by panicking
        use crate::tests::exit_qemu;
        println!("- failed, see failure cause below\n{info}");
        exit_qemu(true);
    }

    // !!!!!!!!!
    interrupts::cli();
    speaker::stop(); // in case anything was playing, prevent it from playing forever
    // Safety: Whoever was using the buffer is long gone now
    unsafe { buffers::BUFFER_HELD.store(false) };

    // Swap & wipe screen
    cursor::ALLOW_ROW_0.store(true, Ordering::Relaxed);
    buffers::swap();
    buffers::clear();

    let location = info.location();
    let (file, line, col) = location.map_or(("?", 0, 0), |l| (l.file(), l.line(), l.column()));

    println!(
        fg = White,
        "\n                                  KERNEL PANIC\n\n
      marigold encountered a kernel panic at {}:{}:{}\n
      {} | uptime {} ticks\n
      Press ESC to restart device and ENTER to show previous screen\n\n
      Error information:\n
      {}",
        file.trim_prefix("src/"),
        line,
        col,
        env!("MGK_VERSION"),
        crate::time::ticks(),
        info.message()
    );

    if let Some(mut buf) = YoinkedBuffer::try_yoink() {
        buf.paint_background(Color::Red);
    }
    cursor::hide_cursor();

    loop {
        check_keyboard(location);
        hint::spin_loop(); // can't halt because of cli
    }
}

/// Triple faults if `ESC` is pressed & shows the previous screen if `ENTER` is.
fn check_keyboard(location: Option<&Location>) {
    /// Should we allow swapping the buffers?
    static ALLOW_BUFSWAP: AtomicBool = AtomicBool::new(true);

    /// Scancodes in set 1, as the controller translates them.
    const ESC_SCANCODE: u8 = 0x01;
    const ENTER_SCANCODE: u8 = 0x1C;

    // Safety: Only reading the data port once the controller says it's full
    let scancode = unsafe {
        if ports::readb(Port::PS2Status) & 1 == 0 {
            return;
        }
        ports::readb(Port::PS2Data)
    };

    if scancode == ESC_SCANCODE {
        interrupts::triple_fault();
    } else if scancode == ENTER_SCANCODE && ALLOW_BUFSWAP.fetch_and(false, Ordering::Relaxed) {
        buffers::swap();
        CursorPos::set_row(u8::MAX);
        CursorPos::set_col(0);
        cursor::update_visual_pos();
        print!(
            fg = Grey,
            "-------------------------------------------------------------------------------- {} panicked at {}:{} | Press ESC to restart",
            env!("MGK_VERSION_SHORT"),
            location.map_or("?", |l| l.file().trim_prefix("src/")),
            location.map_or(0, |l| l.line()),
        );
        cursor::update_visual_pos();
    }
}
