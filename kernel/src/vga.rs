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
    kernel/src/vga.rs

    The text mode console, everything printed here is mirrored to COM1
*/

use crate::{
    serial,
    startup::ExitCode,
    vga::{
        buffers::RawBuffer,
        cursor::{ALLOW_ROW_0, CursorPos},
        print::Corner,
    },
};
use core::{convert::Infallible, sync::atomic::Ordering};

/// Handles the two text buffers.
pub mod buffers;

/// The cursor's logical and hardware position.
pub mod cursor;

/// The print macros and the writer behind them.
#[macro_use]
pub mod print;

/// Connects the `BUFFER` static to the vga text buffer, brings up COM1,
/// then fills the screen with spaces.
///
/// # Safety
/// The buffer must not be used ANYWHERE.
pub unsafe fn init() -> ExitCode<Infallible> {
    serial::init();

    let buf = &raw mut buffers::BUFFER;
    // Safety: The static isn't being used anywhere else and is being loaded with a valid buf.
    unsafe { *buf = &mut *(Corner::TopLeft as usize as *mut RawBuffer) }
    buffers::clear();
    draw_topbar("Booting..");

    if cfg!(test) {
        serial::write("\nRunning startup tests...\n");
    } else {
        print!("\nHello, ");
        println!(fg = Yellow, "marigold!\n");
    }

    ExitCode::Infallible
}

/// Clears the screen, keeping the topbar.
pub fn clear() {
    buffers::clear();
    draw_topbar("  Shell  ");
}

/// Draws the topbar with `title` as it's title.
/// Title must be exactly 9 bytes long.
pub fn draw_topbar(title: &'static str) {
    let _irq = libutil::IrqGuard::new();
    let len = title.len();

    // Force title to be nine bytes
    if len != 9 {
        warn!(
            "attempted setting topbar title with an invalid len ({len}), it will be truncated or discarded to preserve formatting!"
        );
    }
    let title = title.split_at_checked(9).unwrap_or(("Bad Title", "")).0;

    // Print at the top left corner, without mirroring the bar to serial
    let (prev_row, prev_col) = CursorPos::row_col();
    ALLOW_ROW_0.store(true, Ordering::Relaxed);
    CursorPos::set_row(0);
    CursorPos::set_col(0);

    let bar = format_args!(
        " {} | {title} | {} ",
        env!("MGK_VERSION_SHORT"),
        env!("MGK_PATCH_QUOTE"),
    );
    print::_print_quiet(bar, print::Color::Black, print::Color::LightGrey);

    // Pad out the rest of the row
    while CursorPos::row_col().0 == 0 {
        print::write_char_quiet(b' ', print::Color::Black, print::Color::LightGrey);
    }

    // Restore previous vga state
    ALLOW_ROW_0.store(false, Ordering::Relaxed);
    CursorPos::set_row(prev_row);
    CursorPos::set_col(prev_col);
    cursor::update_visual_pos();
}
