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
    kernel/src/vga/cursor.rs

    Tracks where the next character goes and moves the hardware cursor there.
    Contained within the vga module
*/

use super::buffers::{BUFFER_HEIGHT, BUFFER_WIDTH};
use crate::ports::{self, Port};
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering};

/// Whether the cursor may move onto the topbar's row.
pub static ALLOW_ROW_0: AtomicBool = AtomicBool::new(false);

/// The logical cursor position.
static CURSOR: CursorPos = CursorPos {
    column: AtomicU8::new(0),
    row: AtomicU8::new(1),
};

/// The last position sent to the CRTC, `u16::MAX` forces the next update through.
static HW_POS: AtomicU16 = AtomicU16::new(u16::MAX);

/// CRTC cursor registers.
const CURSOR_START_REG: u8 = 0x0A;
const CURSOR_END_REG: u8 = 0x0B;
const CURSOR_POS_REG_HIGH: u8 = 0x0E;
const CURSOR_POS_REG_LOW: u8 = 0x0F;

/// Set in the cursor start register to hide the cursor.
const CURSOR_DISABLE: u8 = 1 << 5;

/// Stores information about the VGA cursor.
pub struct CursorPos {
    pub column: AtomicU8,
    pub row: AtomicU8,
}

impl CursorPos {
    /// Returns the row and column fields of the static.
    pub fn row_col() -> (u8, u8) {
        let row = CURSOR.row.load(Ordering::Relaxed);
        let col = CURSOR.column.load(Ordering::Relaxed);
        (row, col)
    }

    /// Sets the row field in the static to `row`.
    pub fn set_row(row: u8) {
        CURSOR.row.store(row, Ordering::Relaxed);
        Self::clamp_row_col();
    }

    /// Sets the column field in the static to `col`.
    pub fn set_col(col: u8) {
        CURSOR.column.store(col, Ordering::Relaxed);
        Self::clamp_row_col();
    }

    /// Forces the row and column of the static to contain valid values.
    pub fn clamp_row_col() {
        let (row, col) = Self::row_col();

        // Clamp row
        let row = if ALLOW_ROW_0.load(Ordering::Relaxed) {
            row.min(BUFFER_HEIGHT - 1)
        } else {
            row.clamp(1, BUFFER_HEIGHT - 1)
        };
        CURSOR.row.store(row, Ordering::Relaxed);

        // Clamp column
        let col = col.min(BUFFER_WIDTH - 1);
        CURSOR.column.store(col, Ordering::Relaxed);
    }
}

/// Moves the cursor to column `x` of row `y`, then updates the hardware cursor.
pub fn set_cursor(x: u8, y: u8) {
    CursorPos::set_col(x);
    CursorPos::set_row(y);
    update_visual_pos();
}

/// Updates the visual position of the vga cursor on the screen using `CursorPos`,
/// skipping the port writes when it hasn't moved.
pub fn update_visual_pos() {
    CursorPos::clamp_row_col();
    let (row, col) = CursorPos::row_col();
    let pos = row as u16 * BUFFER_WIDTH as u16 + col as u16;

    if HW_POS.swap(pos, Ordering::Relaxed) == pos {
        return;
    }

    // Safety: The cursor is forced into valid values due to CursorPos::clamp_row_col
    unsafe {
        ports::writeb(Port::VGASelectorC, CURSOR_POS_REG_HIGH);
        ports::writeb(Port::VGARegisterC, (pos >> 8) as u8);
        ports::writeb(Port::VGASelectorC, CURSOR_POS_REG_LOW);
        ports::writeb(Port::VGARegisterC, pos as u8);
    }
}

/// Stops the hardware cursor from blinking anywhere.
pub fn hide_cursor() {
    // Safety: Only toggling the disable bit of the cursor start register
    unsafe {
        ports::writeb(Port::VGASelectorC, CURSOR_START_REG);
        let start = ports::readb(Port::VGARegisterC);
        ports::writeb(Port::VGARegisterC, start | CURSOR_DISABLE);
    }
}

/// Shows the hardware cursor as an underline on the bottom two scanlines.
pub fn show_cursor() {
    // Safety: Writing the scanline range, keeping the reserved upper bits
    unsafe {
        ports::writeb(Port::VGASelectorC, CURSOR_START_REG);
        let start = ports::readb(Port::VGARegisterC) & 0xC0;
        ports::writeb(Port::VGARegisterC, start | 14);

        ports::writeb(Port::VGASelectorC, CURSOR_END_REG);
        let end = ports::readb(Port::VGARegisterC) & 0xE0;
        ports::writeb(Port::VGARegisterC, end | 15);
    }

    // The position may be stale after the cursor was hidden
    HW_POS.store(u16::MAX, Ordering::Relaxed);
    update_visual_pos();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that `CursorPos::clamp_row_col()` clamps away invalid values.
    #[test_case]
    fn clamp_removes_invalid_values() {
        let (row, col) = CursorPos::row_col();
        let row0 = ALLOW_ROW_0.load(Ordering::Relaxed);

        ALLOW_ROW_0.store(false, Ordering::Relaxed);
        CursorPos::set_row(0);
        assert_eq!(1, CursorPos::row_col().0);

        ALLOW_ROW_0.store(true, Ordering::Relaxed);
        CursorPos::set_row(0);
        assert_eq!(0, CursorPos::row_col().0);

        CursorPos::set_row(u8::MAX);
        assert_eq!(BUFFER_HEIGHT - 1, CursorPos::row_col().0);

        CursorPos::set_col(u8::MAX);
        assert_eq!(BUFFER_WIDTH - 1, CursorPos::row_col().1);

        CursorPos::set_row(row);
        CursorPos::set_col(col);
        ALLOW_ROW_0.store(row0, Ordering::Relaxed);
    }

    /// Tests that the hardware cursor lands on the requested cell.
    #[test_case]
    fn hardware_cursor_follows() {
        let (row, col) = CursorPos::row_col();
        set_cursor(7, 3);

        // Safety: Reading back the position registers
        let pos = unsafe {
            ports::writeb(Port::VGASelectorC, CURSOR_POS_REG_HIGH);
            let high = ports::readb(Port::VGARegisterC) as u16;
            ports::writeb(Port::VGASelectorC, CURSOR_POS_REG_LOW);
            (high << 8) | ports::readb(Port::VGARegisterC) as u16
        };
        assert_eq!(pos, 3 * BUFFER_WIDTH as u16 + 7);

        set_cursor(col, row);
    }
}
