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
    kernel/src/ata.rs

    PIO driver for the two legacy ATA channels.

    Drives are named `hda` (primary master), `hdb` (primary slave),
    `hdc` (secondary master) and `hdd` (secondary slave). Interrupts are
    disabled on both channels, every wait is a bounded poll.
*/

use crate::{
    ports::{self, Port},
    startup::ExitCode,
};
use alloc::{string::String, sync::Arc, vec::Vec};
use core::{
    fmt::Display,
    hint,
    sync::atomic::{AtomicUsize, Ordering},
};
use libfs::{BlockDevice, BlockError, SECTOR_SIZE, block::check_request};
use libutil::{InitLater, IrqGuard, Spinlock};

/// Every drive `probe` found.
pub static DRIVES: InitLater<Vec<Arc<AtaDrive>>> = InitLater::uninit();

/// How many times a status bit is polled before giving up.
const TIMEOUT: usize = 1_000_000;

/// The biggest READ/WRITE MULTIPLE block we use.
const MAX_MULTIPLE: u16 = 16;

/// Highest sector reachable without LBA48.
const LBA28_LIMIT: u64 = 1 << 28;

/// Most sectors one command moves, a count of 0 means 256.
const MAX_SECTORS_PER_CMD: u64 = 256;

static PRIMARY: Spinlock<Channel> = Spinlock::new(Channel::new(Port::AtaPrimaryIo, Port::AtaPrimaryCtrl));
static SECONDARY: Spinlock<Channel> =
    Spinlock::new(Channel::new(Port::AtaSecondaryIo, Port::AtaSecondaryCtrl));

/// Register offsets from a channel's I/O base.
#[rustfmt::skip]
mod reg {
    pub const DATA: u16     = 0;
    pub const ERROR: u16    = 1;
    pub const COUNT: u16    = 2;
    pub const LBA_LO: u16   = 3;
    pub const LBA_MID: u16  = 4;
    pub const LBA_HI: u16   = 5;
    pub const DRIVE: u16    = 6;
    /// Status on reads, command on writes.
    pub const STATUS: u16   = 7;
}

#[rustfmt::skip]
mod status {
    pub const ERR: u8 = 1 << 0;
    pub const DRQ: u8 = 1 << 3;
    pub const DF: u8  = 1 << 5;
    pub const BSY: u8 = 1 << 7;
}

#[rustfmt::skip]
mod cmd {
    pub const READ: u8           = 0x20;
    pub const READ_EXT: u8       = 0x24;
    pub const WRITE: u8          = 0x30;
    pub const WRITE_EXT: u8      = 0x34;
    pub const READ_MULTIPLE: u8  = 0xC4;
    pub const READ_MULT_EXT: u8  = 0x29;
    pub const WRITE_MULTIPLE: u8 = 0xC5;
    pub const WRITE_MULT_EXT: u8 = 0x3A;
    pub const SET_MULTIPLE: u8   = 0xC6;
    pub const FLUSH: u8          = 0xE7;
    pub const FLUSH_EXT: u8      = 0xEA;
    pub const IDENTIFY: u8       = 0xEC;
}

/// Device control bit which stops the drive raising interrupts.
const CTRL_NIEN: u8 = 1 << 1;

/// The I/O ports of a channel.
struct Channel {
    io: u16,
    ctrl: u16,
}

impl Channel {
    const fn new(io: Port, ctrl: Port) -> Self {
        Channel { io: io as u16, ctrl: ctrl as u16 }
    }

    fn read(&self, reg: u16) -> u8 {
        // Safety: Reading a register of a channel we hold the lock for
        unsafe { ports::readb_nodummy(self.io + reg) }
    }

    fn write(&self, reg: u16, val: u8) {
        // Safety: Writing a register of a channel we hold the lock for
        unsafe { ports::writeb_nodummy(self.io + reg, val) }
    }

    fn alt_status(&self) -> u8 {
        // Safety: Reading the alternate status has no side effects
        unsafe { ports::readb_nodummy(self.ctrl) }
    }

    /// Waits around 400 ns by reading the alternate status four times.
    fn delay400(&self) {
        for _ in 0..4 {
            self.alt_status();
        }
    }

    /// Polls until BSY clears.
    fn wait_idle(&self) -> Result<u8, BlockError> {
        for _ in 0..TIMEOUT {
            let st = self.read(reg::STATUS);
            if st & status::BSY == 0 {
                return Ok(st);
            }
            hint::spin_loop();
        }
        Err(BlockError::Timeout)
    }

    /// Polls until the drive is ready to move data.
    fn wait_drq(&self) -> Result<(), BlockError> {
        for _ in 0..TIMEOUT {
            let st = self.read(reg::STATUS);
            if st & status::BSY == 0 {
                if st & status::ERR != 0 {
                    return Err(BlockError::DeviceError);
                } else if st & status::DF != 0 {
                    return Err(BlockError::DeviceFault);
                } else if st & status::DRQ != 0 {
                    return Ok(());
                }
            }
            hint::spin_loop();
        }
        Err(BlockError::Timeout)
    }

    /// Checks the result of a command which moves no data.
    fn finish(&self) -> Result<(), BlockError> {
        let st = self.wait_idle()?;
        if st & status::ERR != 0 {
            Err(BlockError::DeviceError)
        } else if st & status::DF != 0 {
            Err(BlockError::DeviceFault)
        } else {
            Ok(())
        }
    }

    fn read_words(&self, buf: &mut [u8]) {
        for pair in buf.chunks_exact_mut(2) {
            // Safety: The drive has DRQ set, so the data register holds the next word
            let word = unsafe { ports::readw(self.io + reg::DATA) };
            pair.copy_from_slice(&word.to_le_bytes());
        }
    }

    fn write_words(&self, buf: &[u8]) {
        for pair in buf.chunks_exact(2) {
            let word = u16::from_le_bytes([pair[0], pair[1]]);
            // Safety: The drive has DRQ set, so it's waiting for the next word
            unsafe { ports::writew(self.io + reg::DATA, word) }
        }
    }

    /// Selects `slave` with LBA addressing, `high` is bits 24-27 of an LBA28 address.
    fn select(&self, slave: bool, high: u8) {
        self.write(reg::DRIVE, 0xE0 | ((slave as u8) << 4) | (high & 0x0F));
        self.delay400();
    }

    /// Programs the sector count and address, then sends `command`.
    fn issue(&self, slave: bool, lba: u64, count: u16, lba48: bool, command: u8) {
        if lba48 {
            self.select(slave, 0);
            self.write(reg::COUNT, (count >> 8) as u8);
            self.write(reg::LBA_LO, (lba >> 24) as u8);
            self.write(reg::LBA_MID, (lba >> 32) as u8);
            self.write(reg::LBA_HI, (lba >> 40) as u8);
        } else {
            self.select(slave, (lba >> 24) as u8);
        }

        self.write(reg::COUNT, count as u8);
        self.write(reg::LBA_LO, lba as u8);
        self.write(reg::LBA_MID, (lba >> 8) as u8);
        self.write(reg::LBA_HI, (lba >> 16) as u8);
        self.write(reg::STATUS, command);
        self.delay400();
    }
}

/// What IDENTIFY told us about a drive.
#[derive(Debug, Clone)]
pub struct Identify {
    pub model: String,
    pub sectors: u64,
    pub lba48: bool,
    /// Sectors per READ/WRITE MULTIPLE block, 0 if those commands aren't used.
    pub multiple: u16,
}

impl Identify {
    /// Parses the 256 word identify block.
    pub fn parse(words: &[u16; 256]) -> Self {
        let lba48 = words[83] & (1 << 10) != 0;
        let sectors = if lba48 {
            (0..4).fold(0u64, |acc, i| acc | (words[100 + i] as u64) << (16 * i))
        } else {
            words[60] as u64 | (words[61] as u64) << 16
        };

        let max = (words[47] & 0xFF).min(MAX_MULTIPLE);
        let multiple = if max > 1 && max.is_power_of_two() { max } else { 0 };

        let mut model = String::with_capacity(40);
        for word in &words[27..47] {
            for byte in word.to_be_bytes() {
                model.push(if byte.is_ascii_graphic() || byte == b' ' { byte as char } else { '?' });
            }
        }
        let len = model.trim_end().len();
        model.truncate(len);

        Identify { model, sectors, lba48, multiple }
    }
}

impl Display for Identify {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} ({} KiB, lba{}, multiple {})",
            self.model,
            self.sectors * SECTOR_SIZE as u64 / 1024,
            if self.lba48 { 48 } else { 28 },
            self.multiple
        )
    }
}

/// Commands a drive has been sent, by kind.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CommandCounts {
    pub single_reads: usize,
    pub single_writes: usize,
    pub multiple_reads: usize,
    pub multiple_writes: usize,
    pub flushes: usize,
}

/// A drive on one of the ATA channels.
pub struct AtaDrive {
    name: &'static str,
    channel: &'static Spinlock<Channel>,
    slave: bool,
    info: Identify,
    counts: [AtomicUsize; 5],
}

impl AtaDrive {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn info(&self) -> &Identify {
        &self.info
    }

    pub fn counts(&self) -> CommandCounts {
        let c = |i: usize| self.counts[i].load(Ordering::Relaxed);
        CommandCounts {
            single_reads: c(0),
            single_writes: c(1),
            multiple_reads: c(2),
            multiple_writes: c(3),
            flushes: c(4),
        }
    }

    /// Moves `buf` to or from the drive, starting at `lba`.
    fn transfer(&self, lba: u64, buf: Transfer) -> Result<(), BlockError> {
        let count = check_request(lba, buf.len(), self.info.sectors)?;
        if lba + count > LBA28_LIMIT && !self.info.lba48 {
            return Err(BlockError::Unsupported);
        }

        let _irq = IrqGuard::new();
        let channel = self.channel.try_lock().ok_or(BlockError::Locked)?;

        let write = matches!(buf, Transfer::Write(_));
        let mult = self.info.multiple as u64;
        let mut buf = buf;
        let mut done = 0;

        while done < count {
            let remaining = count - done;
            let at = lba + done;
            let lba48 = self.info.lba48 && at + remaining.min(MAX_SECTORS_PER_CMD) > LBA28_LIMIT;

            // (sectors in the command, sectors per DRQ block)
            let (sectors, block, command, counter) = if mult > 1 && remaining >= mult {
                match (write, lba48) {
                    (false, false) => (mult, mult, cmd::READ_MULTIPLE, 2),
                    (false, true) => (mult, mult, cmd::READ_MULT_EXT, 2),
                    (true, false) => (mult, mult, cmd::WRITE_MULTIPLE, 3),
                    (true, true) => (mult, mult, cmd::WRITE_MULT_EXT, 3),
                }
            } else {
                let sectors = remaining.min(MAX_SECTORS_PER_CMD);
                match (write, lba48) {
                    (false, false) => (sectors, 1, cmd::READ, 0),
                    (false, true) => (sectors, 1, cmd::READ_EXT, 0),
                    (true, false) => (sectors, 1, cmd::WRITE, 1),
                    (true, true) => (sectors, 1, cmd::WRITE_EXT, 1),
                }
            };

            channel.wait_idle()?;
            // A count of 256 wraps to 0 in the register, which the drive reads as 256
            channel.issue(self.slave, at, sectors as u16, lba48, command);
            self.counts[counter].fetch_add(1, Ordering::Relaxed);

            let mut moved = 0;
            while moved < sectors {
                channel.wait_drq()?;
                let start = ((done + moved) as usize) * SECTOR_SIZE;
                let end = start + (block as usize) * SECTOR_SIZE;
                match buf {
                    Transfer::Read(ref mut out) => channel.read_words(&mut out[start..end]),
                    Transfer::Write(data) => channel.write_words(&data[start..end]),
                }
                channel.delay400();
                moved += block;
            }

            if write {
                channel.finish()?;
            }
            done += sectors;
        }

        if write {
            self.flush_locked(&channel)?;
        }
        Ok(())
    }

    fn flush_locked(&self, channel: &Channel) -> Result<(), BlockError> {
        channel.wait_idle()?;
        channel.select(self.slave, 0);
        channel.write(reg::STATUS, if self.info.lba48 { cmd::FLUSH_EXT } else { cmd::FLUSH });
        self.counts[4].fetch_add(1, Ordering::Relaxed);
        channel.finish()
    }
}

/// The direction of a transfer, with the caller's buffer.
enum Transfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Transfer<'_> {
    fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(buf) => buf.len(),
        }
    }
}

impl BlockDevice for AtaDrive {
    fn sector_count(&self) -> u64 {
        self.info.sectors
    }

    fn read(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        self.transfer(lba, Transfer::Read(buf))
    }

    fn write(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        self.transfer(lba, Transfer::Write(buf))
    }

    fn flush(&self) -> Result<(), BlockError> {
        let _irq = IrqGuard::new();
        let channel = self.channel.try_lock().ok_or(BlockError::Locked)?;
        self.flush_locked(&channel)
    }
}

/// Sends IDENTIFY to a drive, then enables READ/WRITE MULTIPLE if it supports it.
fn identify(channel: &Channel, slave: bool) -> Result<Identify, BlockError> {
    // Nothing drives a floating bus
    if channel.read(reg::STATUS) == 0xFF {
        return Err(BlockError::NoDevice);
    }

    channel.write(reg::DRIVE, 0xA0 | ((slave as u8) << 4));
    channel.delay400();
    for r in [reg::COUNT, reg::LBA_LO, reg::LBA_MID, reg::LBA_HI] {
        channel.write(r, 0);
    }
    channel.write(reg::STATUS, cmd::IDENTIFY);

    if channel.read(reg::STATUS) == 0 {
        return Err(BlockError::NoDevice);
    }
    channel.wait_idle()?;

    // ATAPI and SATA devices put their signature here instead of answering
    if channel.read(reg::LBA_MID) != 0 || channel.read(reg::LBA_HI) != 0 {
        return Err(BlockError::Unsupported);
    }
    channel.wait_drq()?;

    let mut raw = [0u8; SECTOR_SIZE];
    channel.read_words(&mut raw);
    let mut words = [0u16; 256];
    for (word, pair) in words.iter_mut().zip(raw.chunks_exact(2)) {
        *word = u16::from_le_bytes([pair[0], pair[1]]);
    }

    let mut info = Identify::parse(&words);
    if info.sectors == 0 {
        return Err(BlockError::Unsupported);
    }

    if info.multiple > 1 {
        channel.write(reg::COUNT, info.multiple as u8);
        channel.write(reg::STATUS, cmd::SET_MULTIPLE);
        if channel.finish().is_err() {
            warn!("ata: drive refused SET MULTIPLE {}, error 0x{:x}", info.multiple, channel.read(reg::ERROR));
            info.multiple = 0;
        }
    }

    Ok(info)
}

/// Finds every drive on both channels.
///
/// # Safety
/// Only run once at startup, the ATA ports must not be used anywhere else.
pub unsafe fn probe() -> ExitCode<ProbeError> {
    let slots: [(&'static str, &'static Spinlock<Channel>, bool); 4] = [
        ("hda", &PRIMARY, false),
        ("hdb", &PRIMARY, true),
        ("hdc", &SECONDARY, false),
        ("hdd", &SECONDARY, true),
    ];

    let mut drives = Vec::new();
    for (name, channel, slave) in slots {
        let info = {
            let _irq = IrqGuard::new();
            let ch = channel.lock();
            // Safety: Only stops the drives raising interrupts
            unsafe { ports::writeb(ch.ctrl, CTRL_NIEN) };
            identify(&ch, slave)
        };

        match info {
            Ok(info) => {
                println!(fg = LightGrey, "{name}: {info}");
                drives.push(Arc::new(AtaDrive {
                    name,
                    channel,
                    slave,
                    info,
                    counts: [const { AtomicUsize::new(0) }; 5],
                }));
            }
            Err(e) => dbg_info!("ata: {name}: {}", e.name()),
        }
    }

    if drives.is_empty() {
        return ExitCode::Error(ProbeError::NoDrives);
    }

    if DRIVES.init(drives).is_err() {
        return ExitCode::Error(ProbeError::AlreadyProbed);
    }
    ExitCode::Ok
}

/// Returns the drive called `name`.
pub fn drive(name: &str) -> Option<Arc<AtaDrive>> {
    DRIVES.read().ok()?.iter().find(|d| d.name == name).cloned()
}

#[derive(Debug)]
pub enum ProbeError {
    NoDrives,
    AlreadyProbed,
}

impl Display for ProbeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProbeError::NoDrives => write!(f, "No ATA drives were found"),
            ProbeError::AlreadyProbed => write!(f, "The ATA drives were already probed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// Tests that identify words are decoded like a drive reports them.
    #[test_case]
    fn identify_parses_words() {
        let mut words = [0u16; 256];
        words[27] = u16::from_be_bytes(*b"QE");
        words[28] = u16::from_be_bytes(*b"MU");
        words[29..47].fill(u16::from_be_bytes(*b"  "));
        words[47] = 0x8010;
        words[60] = 0x0000;
        words[61] = 0x0002;
        let info = Identify::parse(&words);
        assert_eq!(info.model, "QEMU");
        assert_eq!(info.sectors, 0x20000);
        assert!(!info.lba48);
        assert_eq!(info.multiple, 16);

        words[47] = 0x8003; // not a power of two
        words[83] = 1 << 10;
        words[100] = 0x1234;
        words[102] = 0x0001;
        let info = Identify::parse(&words);
        assert!(info.lba48);
        assert_eq!(info.sectors, 0x0001_0000_1234);
        assert_eq!(info.multiple, 0);
    }

    /// Tests that 128 sectors go through as whole MULTIPLE blocks and read back the same.
    #[test_case]
    fn multiple_sector_round_trip() {
        let drive = drive(env!("MGK_ROOT_DEVICE")).unwrap();
        let lba = drive.sector_count() - 128;
        let len = 128 * SECTOR_SIZE;

        let mut saved = vec![0u8; len];
        drive.read(lba, &mut saved).unwrap();

        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let before = drive.counts();
        drive.write(lba, &data).unwrap();
        let after = drive.counts();

        let mult = drive.info().multiple as usize;
        let expected = if mult > 1 { 128 / mult } else { 0 };
        assert_eq!(after.multiple_writes - before.multiple_writes, expected);
        assert_eq!(after.flushes - before.flushes, 1);

        let mut back = vec![0u8; len];
        drive.read(lba, &mut back).unwrap();
        assert!(back == data);

        drive.write(lba, &saved).unwrap();
    }

    /// Tests single sector requests and out of range requests.
    #[test_case]
    fn single_sectors_and_bounds() {
        let drive = drive(env!("MGK_ROOT_DEVICE")).unwrap();
        let end = drive.sector_count();

        let mut one = [0u8; SECTOR_SIZE];
        drive.read(end - 1, &mut one).unwrap();
        assert_eq!(drive.read(end, &mut one), Err(BlockError::Bounds));
        assert_eq!(drive.read(0, &mut one[..100]), Err(BlockError::Params));
    }
}
