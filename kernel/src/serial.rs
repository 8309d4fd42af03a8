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
    kernel/src/serial.rs

    COM1, which receives a copy of everything printed to the console
*/

use crate::ports::Port;
use libutil::Spinlock;
use uart_16550::SerialPort;

/// COM1, `None` until [`init`] is ran.
static COM1: Spinlock<Option<SerialPort>> = Spinlock::new(None);

/// Sets up COM1 as a 38400 baud 8N1 line.
pub fn init() {
    // Safety: Port 0x3F8 is a valid serial port device and only used through `COM1`
    let mut port = unsafe { SerialPort::new(Port::SerialPort1 as u16) };
    port.init();
    *COM1.lock_irqsave() = Some(port);
}

/// Writes `s` to COM1, translating newlines into CRLF.
///
/// Drops the output if COM1 is busy, which only happens when printing from
/// an exception that interrupted another print.
pub fn write(s: &str) {
    let Some(mut com1) = COM1.try_lock() else {
        return;
    };

    if let Some(port) = com1.as_mut() {
        for byte in s.bytes() {
            if byte == b'\n' {
                port.send(b'\r');
            }
            port.send(byte);
        }
    }
}

/// Writes a single byte to COM1.
pub fn write_byte(byte: u8) {
    if let Some(mut com1) = COM1.try_lock()
        && let Some(port) = com1.as_mut()
    {
        port.send(byte);
    }
}
