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
    kernel/src/keyboard.rs

    PS/2 keyboard driver, decodes scancode set 1 into key codes
*/

use crate::{
    interrupts::{self, RegisterError},
    ports::{self, Port},
    startup::{self, ExitCode},
};
use bitflags::bitflags;
use core::{
    fmt::Display,
    hint,
    sync::atomic::{AtomicU8, Ordering},
};
use libutil::{ByteRing, Spinlock};
use pc_keyboard::{
    DecodedKey, HandleControl, KeyCode, Keyboard, ScancodeSet1,
    layouts::{AnyLayout, Colemak, Dvorak104Key, No105Key, Uk105Key, Us104Key},
};
use ps2::{
    Controller,
    error::{ControllerError, KeyboardError},
    flags::{ControllerConfigFlags, KeyboardLedFlags},
};

/// Key codes outside of ASCII, every other key is it's ASCII value.
#[rustfmt::skip]
pub mod keys {
    pub const ESCAPE: u8    = 0x80;
    pub const UP: u8        = 0x81;
    pub const DOWN: u8      = 0x82;
    pub const LEFT: u8      = 0x83;
    pub const RIGHT: u8     = 0x84;
    pub const HOME: u8      = 0x85;
    pub const END: u8       = 0x86;
    pub const PAGE_UP: u8   = 0x87;
    pub const PAGE_DOWN: u8 = 0x88;
    pub const INSERT: u8    = 0x89;
    pub const DELETE: u8    = 0x8A;
    /// F1 through F12 are `F1..=F1 + 11`.
    pub const F1: u8        = 0x90;
}

/// Decoded keys waiting to be read, new keys are dropped when full.
static KEYS: ByteRing<65> = ByteRing::new();

/// The scancode decoder, also tracks modifier state.
static DECODER: Spinlock<Keyboard<AnyLayout, ScancodeSet1>> = Spinlock::new(Keyboard::new(
    ScancodeSet1::new(),
    AnyLayout::Us104Key(Us104Key),
    HandleControl::Ignore,
));

/// Snapshot of [`Modifiers`], updated after every scancode.
static MODIFIERS: AtomicU8 = AtomicU8::new(0);

/// The active keymap, stored as it's index.
static KEYMAP: AtomicU8 = AtomicU8::new(Keymap::Us as u8);

bitflags! {
    /// Modifier keys currently held or toggled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT = 1 << 0;
        const CTRL  = 1 << 1;
        const ALT   = 1 << 2;
        const CAPS  = 1 << 3;
    }
}

/// Keyboard layouts printable keys can be mapped through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Keymap {
    Us,
    Uk,
    Dvorak,
    Colemak,
    Norwegian,
}

impl Keymap {
    pub const ALL: [Keymap; 5] = [
        Keymap::Us,
        Keymap::Uk,
        Keymap::Dvorak,
        Keymap::Colemak,
        Keymap::Norwegian,
    ];

    /// Returns the keymap called `name`, as used by the VERSION file and prompt.
    pub fn from_name(name: &str) -> Option<Keymap> {
        Keymap::ALL.into_iter().find(|k| k.name().eq_ignore_ascii_case(name))
    }

    pub const fn name(self) -> &'static str {
        match self {
            Keymap::Us => "us",
            Keymap::Uk => "uk",
            Keymap::Dvorak => "dvorak",
            Keymap::Colemak => "colemak",
            Keymap::Norwegian => "no",
        }
    }

    fn layout(self) -> AnyLayout {
        match self {
            Keymap::Us => AnyLayout::Us104Key(Us104Key),
            Keymap::Uk => AnyLayout::Uk105Key(Uk105Key),
            Keymap::Dvorak => AnyLayout::Dvorak104Key(Dvorak104Key),
            Keymap::Colemak => AnyLayout::Colemak(Colemak),
            Keymap::Norwegian => AnyLayout::No105Key(No105Key),
        }
    }
}

/// Disables mouse, runs some tests, sets config, then starts taking IRQ 1.
/// # Safety
/// Ports `0x60` & `0x64` must not be used anywhere else.
pub unsafe fn init() -> ExitCode<KbdInitError> {
    if !startup::PIC_INIT.load() {
        return ExitCode::Error(KbdInitError::new("The PIC isn't init!"));
    }

    // Safety: This is the only use of ports 0x60 & 0x64, excluding the IRQ handler
    let mut controller = unsafe { Controller::new() };

    macro_rules! parse_err {
        ($msg: expr, $res: expr) => {
            if let Err(e) = $res {
                return ExitCode::Error(KbdInitError {
                    msg: $msg,
                    err: Some(e.into()),
                });
            }
        };
    }

    // Disable devices
    parse_err!("Disable keyboard", controller.disable_keyboard());
    parse_err!("Disable mouse", controller.disable_mouse());

    // It doesn't matter if it's an err since we're just flushing the buffer
    _ = controller.read_data();

    // Tests
    parse_err!("Controller test", controller.test_controller());
    parse_err!("Keyboard test", controller.test_keyboard());

    // Config, the controller translates the keyboard's set 2 into set 1 for us
    let mut cfg = ControllerConfigFlags::all();
    cfg.set(ControllerConfigFlags::DISABLE_KEYBOARD, false);
    cfg.set(ControllerConfigFlags::ENABLE_MOUSE_INTERRUPT, false);
    cfg.set(ControllerConfigFlags::DISABLE_MOUSE, true);
    parse_err!("Set config", controller.write_config(cfg));

    let mut kbd = controller.keyboard();
    parse_err!("Reset keyboard", kbd.reset_and_self_test());
    parse_err!("Keyboard Echo", kbd.echo());
    parse_err!("Set scancode", kbd.set_scancode_set(2));
    parse_err!("Set LEDS", kbd.set_leds(KeyboardLedFlags::NUM_LOCK));

    let keymap = Keymap::from_name(env!("MGK_KEYMAP")).unwrap_or(Keymap::Us);
    set_keymap(keymap);

    if let Err(e) = interrupts::register_irq(1, irq_handler) {
        return ExitCode::Error(KbdInitError {
            msg: "Register IRQ 1",
            err: Some(InnerError::Irq(e)),
        });
    }

    // Safety: We just initialised it above
    unsafe { startup::KBD_INIT.store(true) }

    ExitCode::Ok
}

/// Error returned from `init`.
pub struct KbdInitError {
    msg: &'static str,
    err: Option<InnerError>,
}

/// Whatever went wrong while talking to the controller.
enum InnerError {
    Controller(ControllerError),
    Keyboard(KeyboardError),
    Irq(RegisterError),
}

impl From<ControllerError> for InnerError {
    fn from(e: ControllerError) -> Self {
        InnerError::Controller(e)
    }
}

impl From<KeyboardError> for InnerError {
    fn from(e: KeyboardError) -> Self {
        InnerError::Keyboard(e)
    }
}

impl KbdInitError {
    /// Returns a new error without the `err` field.
    fn new(msg: &'static str) -> Self {
        KbdInitError { msg, err: None }
    }
}

impl Display for KbdInitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.msg)?;

        match self.err {
            Some(InnerError::Controller(ref e)) => write!(f, " - {e:?}"),
            Some(InnerError::Keyboard(ref e)) => write!(f, " - {e:?}"),
            Some(InnerError::Irq(ref e)) => write!(f, " - {e}"),
            None => Ok(()),
        }
    }
}

/// IRQ 1 handler, the EOI is sent by the dispatcher afterwards.
fn irq_handler() {
    // Safety: Port 0x60 holds the scancode which raised this IRQ
    let scancode = unsafe { ports::readb(Port::PS2Data) };
    handle_scancode(scancode);
}

/// Feeds `scancode` through the decoder, queueing any key it completes.
fn handle_scancode(scancode: u8) {
    let mut kbd = DECODER.lock_irqsave();

    let Ok(Some(event)) = kbd.add_byte(scancode) else {
        return;
    };
    let decoded = kbd.process_keyevent(event);

    let mods = kbd.get_modifiers();
    let mut snapshot = Modifiers::empty();
    snapshot.set(Modifiers::SHIFT, mods.is_shifted());
    snapshot.set(Modifiers::CTRL, mods.is_ctrl());
    snapshot.set(Modifiers::ALT, mods.lalt || mods.ralt);
    snapshot.set(Modifiers::CAPS, mods.capslock);
    MODIFIERS.store(snapshot.bits(), Ordering::Relaxed);
    drop(kbd);

    if let Some(key) = decoded.and_then(key_code) {
        KEYS.push(key);
    }
}

/// Converts a decoded key into it's key code, if it has one.
fn key_code(key: DecodedKey) -> Option<u8> {
    match key {
        DecodedKey::Unicode('\u{1B}') => Some(keys::ESCAPE),
        DecodedKey::Unicode('\u{7F}') => Some(keys::DELETE),
        DecodedKey::Unicode(c) if c.is_ascii() => Some(c as u8),
        DecodedKey::Unicode(_) => None,
        DecodedKey::RawKey(code) => raw_key_code(code),
    }
}

#[rustfmt::skip]
fn raw_key_code(code: KeyCode) -> Option<u8> {
    let key = match code {
        KeyCode::Escape     => keys::ESCAPE,
        KeyCode::ArrowUp    => keys::UP,
        KeyCode::ArrowDown  => keys::DOWN,
        KeyCode::ArrowLeft  => keys::LEFT,
        KeyCode::ArrowRight => keys::RIGHT,
        KeyCode::Home       => keys::HOME,
        KeyCode::End        => keys::END,
        KeyCode::PageUp     => keys::PAGE_UP,
        KeyCode::PageDown   => keys::PAGE_DOWN,
        KeyCode::Insert     => keys::INSERT,
        KeyCode::Delete     => keys::DELETE,
        KeyCode::F1         => keys::F1,
        KeyCode::F2         => keys::F1 + 1,
        KeyCode::F3         => keys::F1 + 2,
        KeyCode::F4         => keys::F1 + 3,
        KeyCode::F5         => keys::F1 + 4,
        KeyCode::F6         => keys::F1 + 5,
        KeyCode::F7         => keys::F1 + 6,
        KeyCode::F8         => keys::F1 + 7,
        KeyCode::F9         => keys::F1 + 8,
        KeyCode::F10        => keys::F1 + 9,
        KeyCode::F11        => keys::F1 + 10,
        KeyCode::F12        => keys::F1 + 11,
        _ => return None,
    };
    Some(key)
}

/// Returns whether a key is waiting to be read.
pub fn available() -> bool {
    !KEYS.is_empty()
}

/// Returns the next key, if one was pressed.
pub fn get_nonblocking() -> Option<u8> {
    KEYS.pop()
}

/// Waits until a key is pressed, then returns it.
///
/// Never returns if external interrupts are disabled and nothing is queued.
pub fn get_blocking() -> u8 {
    loop {
        if let Some(key) = KEYS.pop() {
            return key;
        }

        if interrupts::are_enabled() {
            interrupts::hlt();
        } else {
            hint::spin_loop();
        }
    }
}

/// Switches the layout printable keys are mapped through.
///
/// Any held modifiers are forgotten.
pub fn set_keymap(keymap: Keymap) {
    *DECODER.lock_irqsave() =
        Keyboard::new(ScancodeSet1::new(), keymap.layout(), HandleControl::Ignore);
    KEYMAP.store(keymap as u8, Ordering::Relaxed);
    MODIFIERS.store(0, Ordering::Relaxed);
}

/// Returns the active keymap.
pub fn keymap() -> Keymap {
    let idx = KEYMAP.load(Ordering::Relaxed) as usize;
    Keymap::ALL.get(idx).copied().unwrap_or(Keymap::Us)
}

/// Returns the modifiers as of the last scancode.
pub fn modifiers() -> Modifiers {
    Modifiers::from_bits_truncate(MODIFIERS.load(Ordering::Relaxed))
}

/// Keys which got dropped because nobody was reading them.
pub fn dropped() -> usize {
    KEYS.dropped()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Empties the key queue.
    fn drain() {
        while get_nonblocking().is_some() {}
    }

    /// Tests that a press and release of `a` queues a single `a`.
    #[test_case]
    fn press_queues_ascii() {
        drain();
        handle_scancode(0x1E);
        handle_scancode(0x9E);
        assert!(available());
        assert_eq!(get_nonblocking(), Some(b'a'));
        assert_eq!(get_nonblocking(), None);
    }

    /// Tests that shift and caps lock give the upper variant.
    #[test_case]
    fn shift_and_caps_give_upper() {
        drain();
        handle_scancode(0x2A); // lshift down
        assert!(modifiers().contains(Modifiers::SHIFT));
        handle_scancode(0x02); // 1
        handle_scancode(0xAA); // lshift up
        assert!(!modifiers().contains(Modifiers::SHIFT));
        assert_eq!(get_nonblocking(), Some(b'!'));

        handle_scancode(0x3A); // caps lock
        handle_scancode(0xBA);
        handle_scancode(0x10); // q
        assert_eq!(get_nonblocking(), Some(b'Q'));
        handle_scancode(0x3A);
        handle_scancode(0xBA);
        assert!(!modifiers().contains(Modifiers::CAPS));
    }

    /// Tests that extended scancodes produce special key codes.
    #[test_case]
    fn extended_keys() {
        drain();
        for byte in [0xE0, 0x48, 0xE0, 0xC8, 0xE0, 0x53, 0x01, 0x3C] {
            handle_scancode(byte);
        }
        assert_eq!(get_nonblocking(), Some(keys::UP));
        assert_eq!(get_nonblocking(), Some(keys::DELETE));
        assert_eq!(get_nonblocking(), Some(keys::ESCAPE));
        assert_eq!(get_nonblocking(), Some(keys::F1 + 1));
    }

    /// Tests that a full queue drops new keys and keeps the old ones.
    #[test_case]
    fn overflow_drops_new_keys() {
        drain();
        let dropped = dropped();
        for _ in 0..70 {
            handle_scancode(0x30); // b
            handle_scancode(0xB0);
        }
        handle_scancode(0x2E); // c

        let mut count = 0;
        while let Some(key) = get_nonblocking() {
            assert_eq!(key, b'b');
            count += 1;
        }
        assert_eq!(count, 64);
        assert_eq!(dropped() - dropped, 7);
    }

    /// Tests that switching keymaps changes what printable keys map to.
    #[test_case]
    fn keymaps_switch() {
        drain();
        assert_eq!(Keymap::from_name("DVORAK"), Some(Keymap::Dvorak));
        assert_eq!(Keymap::from_name("qwertz"), None);

        let prev = keymap();
        set_keymap(Keymap::Dvorak);
        assert_eq!(keymap(), Keymap::Dvorak);
        handle_scancode(0x10); // q on qwerty, ' on dvorak
        handle_scancode(0x90);
        assert_eq!(get_nonblocking(), Some(b'\''));

        set_keymap(prev);
    }
}
