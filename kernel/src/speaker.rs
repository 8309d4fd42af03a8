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
    kernel/src/speaker.rs

    Allows playing sounds through the PC speaker
*/

use crate::{
    ports::{self, Port},
    startup, time,
};

/// The bits required for the PC speaker to play sound through PIT channel 2.
const PLAY_BITS: u8 = 0b11;

/// Silence left between two notes so repeated notes don't blur together.
const NOTE_GAP_MS: u32 = 5;

/// A note in a song, a `freq` of 0 is a rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note {
    pub freq: u32,
    pub ms: u32,
}

impl Note {
    pub const fn new(freq: u32, ms: u32) -> Self {
        Note { freq, ms }
    }

    pub const fn rest(ms: u32) -> Self {
        Note { freq: 0, ms }
    }
}

/// Played once the kernel finishes booting.
pub const CHIME: [Note; 4] = [
    Note::new(600, 350),
    Note::new(620, 450),
    Note::new(600, 350),
    Note::new(780, 900),
];

/// A short scale, played by the prompt's `play` command.
pub const SCALE: [Note; 8] = [
    Note::new(262, 150),
    Note::new(294, 150),
    Note::new(330, 150),
    Note::new(349, 150),
    Note::new(392, 150),
    Note::new(440, 150),
    Note::new(494, 150),
    Note::new(523, 300),
];

/// Plays a sound with the specified frequency to the pc speaker.
///
/// Note: QEMU doesn't seem to be able to rapidly switch between playing different sounds
/// when used with certain headphones and requires passing
/// `-audio driver=<insert driver here>,model=virtio,id=speaker --machine pcspk-audiodev=speaker`
pub fn play(freq: u32) {
    /// Channel 2, low & high byte, square wave, binary mode
    const COMMAND: u8 = 0b10_11_011_0;

    if freq == 0 {
        return stop();
    }

    let div = (time::PIT_BASE_FREQ / freq).clamp(1, u16::MAX as u32);

    // Safety: Programming channel 2 only affects the speaker
    unsafe {
        ports::writeb(Port::PITCmd, COMMAND);
        ports::writeb(Port::PITChannel2, div as u8); // low byte
        ports::writeb(Port::PITChannel2, (div >> 8) as u8); // high byte

        // If the play bits are not set, enable them
        let val = ports::readb(Port::PCSpeaker);
        if val != val | PLAY_BITS {
            ports::writeb(Port::PCSpeaker, val | PLAY_BITS);
        }
    }
}

/// Stops the current sound the pc speaker is playing.
pub fn stop() {
    // Safety: We're just disabling the play bits
    unsafe {
        let val = ports::readb(Port::PCSpeaker) & !PLAY_BITS;
        ports::writeb(Port::PCSpeaker, val);
    }
}

/// Returns whether the speaker is currently gated on.
pub fn is_playing() -> bool {
    // Safety: Just reading the system control port
    unsafe { ports::readb(Port::PCSpeaker) & PLAY_BITS == PLAY_BITS }
}

/// Plays every note in `song`, pausing briefly between them.
///
/// Only re-entrant while interrupts are enabled.
pub fn play_song(song: &[Note]) {
    if !startup::PIT_INIT.load() {
        warn!("attempted playing a song with an uninit PIT!");
        return;
    }

    for (i, note) in song.iter().enumerate() {
        if i != 0 {
            time::sleep_interrupt(NOTE_GAP_MS);
        }

        play(note.freq);
        time::sleep_interrupt(note.ms);
        stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that a song with a rest takes at least as long as it's notes.
    #[test_case]
    fn songs_take_their_length() {
        const SONG: [Note; 3] = [Note::new(440, 200), Note::rest(100), Note::new(880, 200)];

        let before = time::ticks();
        play_song(&SONG);
        let elapsed = time::ticks() - before;

        assert!(elapsed >= time::ms_to_ticks(500));
        assert!(!is_playing());
    }

    /// Tests that rests silence the speaker.
    #[test_case]
    fn rests_are_silent() {
        play(440);
        assert!(is_playing());
        play(0);
        assert!(!is_playing());
    }
}
