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
    kernel/src/vga/print.rs

    Colors, the print macros and the writer which puts characters on screen.
    Contained within the vga module
*/

use super::{
    buffers::{BUFFER_HEIGHT, BUFFER_WIDTH, YoinkedBuffer},
    cursor::{self, CursorPos},
};
use crate::serial;
use core::{
    fmt::{self, Write},
    sync::atomic::{AtomicU8, Ordering},
};

/// The color palette used by `VGAChar`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
#[repr(u16)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Purple = 5,
    Brown = 6,
    Grey = 7,
    LightGrey = 8,
    LightBlue = 9,
    Lime = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

impl Color {
    /// Returns the color with palette index `idx`, ignoring anything above 15.
    pub const fn from_index(idx: u8) -> Color {
        match idx & 0xF {
            0 => Color::Black,
            1 => Color::Blue,
            2 => Color::Green,
            3 => Color::Cyan,
            4 => Color::Red,
            5 => Color::Purple,
            6 => Color::Brown,
            7 => Color::Grey,
            8 => Color::LightGrey,
            9 => Color::LightBlue,
            10 => Color::Lime,
            11 => Color::LightCyan,
            12 => Color::LightRed,
            13 => Color::Pink,
            14 => Color::Yellow,
            _ => Color::White,
        }
    }
}

/// A character value supported by the VGA's [text mode](https://en.wikipedia.org/wiki/VGA_text_mode).
/// It has the following bit layout:
///
/// - Bits 0-7 ~ Character
/// - Bits 8-11 ~ Foreground [`color`](Color)
/// - Bits 12-15 ~ Background [`color`](Color) (bit 15 is sometimes blink)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct VGAChar(u16);

impl VGAChar {
    /// The space character.
    pub const SPACE: VGAChar = VGAChar::new(0x20, Color::White, Color::Black);

    /// Constructs a new color using `fg` as the text color and `bg` as the background color.
    pub const fn new(char: u8, fg: Color, bg: Color) -> VGAChar {
        VGAChar((char as u16) | (bg as u16) << 12 | (fg as u16) << 8)
    }

    /// Returns `self` as an int.
    pub const fn as_raw(&self) -> u16 {
        self.0
    }

    /// Returns a mutable reference to `self` as an int.
    pub const fn as_raw_mut(&mut self) -> &mut u16 {
        &mut self.0
    }
}

/// The colors used when a print doesn't pick any, packed as `(bg << 4) | fg`.
static COLOR: AtomicU8 = AtomicU8::new(Color::White as u8);

/// Sets the colors used by prints which don't specify their own.
pub fn set_color(fg: Color, bg: Color) {
    COLOR.store(((bg as u8) << 4) | fg as u8, Ordering::Relaxed);
}

/// Returns the current default `(fg, bg)` colors.
pub fn color() -> (Color, Color) {
    let packed = COLOR.load(Ordering::Relaxed);
    (Color::from_index(packed), Color::from_index(packed >> 4))
}

/// Prints to the vga text buffer.
#[macro_export]
macro_rules! print {
    (fg = $fg:ident, bg = $bg:ident, $($args:tt)+) => ($crate::vga::print::_print(format_args!($($args)+), $crate::vga::print::Color::$fg, $crate::vga::print::Color::$bg));
    (fg = $fg:ident, $($args:tt)+) => ($crate::vga::print::_print(format_args!($($args)+), $crate::vga::print::Color::$fg, $crate::vga::print::color().1));
    (bg = $bg:ident, $($args:tt)+) => ($crate::vga::print::_print(format_args!($($args)+), $crate::vga::print::color().0, $crate::vga::print::Color::$bg));
    ($($args:tt)+) => ({
        let (fg, bg) = $crate::vga::print::color();
        $crate::vga::print::_print(format_args!($($args)+), fg, bg)
    });
}

/// Prints to the vga text buffer with a trailing newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    (fg = $fg:ident, bg = $bg:ident, $($arg:tt)+) => ($crate::print!(fg = $fg, bg = $bg, "{}\n", format_args!($($arg)+)));
    (fg = $fg:ident, $($arg:tt)+) => ($crate::print!(fg = $fg, "{}\n", format_args!($($arg)+)));
    (bg = $bg:ident, $($arg:tt)+) => ($crate::print!(bg = $bg, "{}\n", format_args!($($arg)+)));
    ($($arg:tt)+) => ($crate::print!("{}\n", format_args!($($arg)+)));
}

/// Prints to the vga text buffer if the `debug_info` feature is enabled.
#[macro_export]
macro_rules! dbg_info {
    ($($arg:tt)+) => {{
        #[cfg(feature = "debug_info")]
        $crate::println!(fg = LightGrey, "debug: {}", format_args!($($arg)+))
    }};
}

/// Prints a warning to the vga text buffer if the `debug_info` feature is enabled.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => {
    #[cfg(feature = "debug_info")]
    {
        $crate::print!(fg = LightRed, "warning: ");
        $crate::println!(fg = LightGrey, $($arg)+)
    }};
}

/// The memory addresses to the four corners of the VGA text buffer.
#[derive(PartialEq, Clone, Copy)]
#[repr(usize)]
#[allow(dead_code)]
pub enum Corner {
    TopLeft = 0xb8000,
    TopRight = 0xb809e,
}

/// Used by `_print` to print.
/// Uses `fg` as the text color and `bg` as the background color.
struct VGAWriter {
    fg: Color,
    bg: Color,
    mirror: bool,
}

impl Write for VGAWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            write_char_quiet(byte, self.fg, self.bg);
        }

        if self.mirror {
            serial::write(s);
        }

        Ok(())
    }
}

/// Used by `print!` and `println!` to write to the VGA text buffer and COM1.
pub fn _print(args: fmt::Arguments, fg: Color, bg: Color) {
    let mut writer = VGAWriter { fg, bg, mirror: true };
    // VGAWriter never fails
    _ = writer.write_fmt(args);
    cursor::update_visual_pos();
}

/// Like [`_print`], but nothing is sent to COM1.
pub fn _print_quiet(args: fmt::Arguments, fg: Color, bg: Color) {
    let mut writer = VGAWriter { fg, bg, mirror: false };
    _ = writer.write_fmt(args);
}

/// Writes `s` using the current colors.
pub fn write(s: &str) {
    let (fg, bg) = color();
    _print(format_args!("{s}"), fg, bg);
}

/// Writes a single byte using the current colors.
pub fn putchar(byte: u8) {
    let (fg, bg) = color();
    write_char(byte, fg, bg);
    cursor::update_visual_pos();
}

/// Writes `byte` to VGA and COM1 as a character using `fg` as the text color and `bg` as the background color.
pub fn write_char(byte: u8, fg: Color, bg: Color) {
    match byte {
        b'\n' => serial::write("\n"),
        byte => serial::write_byte(byte),
    }
    write_char_quiet(byte, fg, bg);
}

/// Writes `byte` to VGA only, interpreting newlines, tabs and backspaces.
pub fn write_char_quiet(byte: u8, fg: Color, bg: Color) {
    match byte {
        b'\n' => newline(),
        b'\t' => (0..4).for_each(|_| write_char_quiet(b' ', fg, bg)),
        0x08 => delete_prev_char(),
        byte => {
            let (row, col) = CursorPos::row_col();
            let newline = col >= BUFFER_WIDTH - 1;

            // Print character
            if let Some(mut buf) = YoinkedBuffer::try_yoink() {
                buf.buffer()[row as usize][col as usize] = VGAChar::new(byte, fg, bg);
            }

            if newline {
                self::newline();
            } else {
                CursorPos::set_col(col + 1);
            }
        }
    }
}

/// Moves to the start of the next row, scrolling everything under the topbar if on the last row.
fn newline() {
    let (row, _) = CursorPos::row_col();
    CursorPos::set_col(0);

    if row < BUFFER_HEIGHT - 1 {
        return CursorPos::set_row(row + 1);
    }

    if let Some(mut buf) = YoinkedBuffer::try_yoink() {
        let top_row = !cursor::ALLOW_ROW_0.load(Ordering::Relaxed) as usize;
        buf.scroll_up(top_row);
    }
}

/// Deletes the character to the left of the cursor.
/// Equivalent to a backspace.
pub fn delete_prev_char() {
    let (row, col) = CursorPos::row_col();
    let (row, col) = match (row, col) {
        (_, 0) if row <= 1 => return, // nothing left of the first text cell
        (_, 0) => (row - 1, BUFFER_WIDTH - 1),
        _ => (row, col - 1),
    };

    if let Some(mut buf) = YoinkedBuffer::try_yoink() {
        buf.buffer()[row as usize][col as usize] = VGAChar::SPACE;
    }
    CursorPos::set_row(row);
    CursorPos::set_col(col);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vga::buffers;

    /// Tests that tabs are four spaces wide and backspace blanks the previous cell.
    #[test_case]
    fn tabs_and_backspaces() {
        println!();
        let (row, _) = CursorPos::row_col();
        print!("\tab\x08c");
        let mut line = [0; 6];
        buffers::read_row(row, &mut line);
        assert_eq!(&line, b"    ac");
        println!();
    }

    /// Tests that the default colors can be swapped and read back.
    #[test_case]
    fn default_colors() {
        let prev = color();
        set_color(Color::Yellow, Color::Blue);
        assert_eq!(color(), (Color::Yellow, Color::Blue));
        set_color(prev.0, prev.1);
    }
}
