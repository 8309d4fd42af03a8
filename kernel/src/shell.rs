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
    kernel/src/shell.rs

    A tiny command prompt for poking at the filesystem and drivers
*/

use crate::{
    fs::{self, VFS},
    interrupts, keyboard, memory, speaker, time, vga,
};
use alloc::{string::String, vec::Vec};
use libfs::{FileType, FsError, MountFlags, OpenFlags, path};

/// The longest line the prompt accepts.
const MAX_LINE: usize = 76;

/// Every command, with it's usage and description.
#[rustfmt::skip]
const COMMANDS: [(&str, &str, &str); 16] = [
    ("ls",     "[path]",              "List a directory"),
    ("cat",    "<path>",              "Print a file"),
    ("write",  "<path> <text>",       "Replace a file with a line of text"),
    ("rm",     "<path>",              "Delete a file or empty directory"),
    ("mkdir",  "<path>",              "Create a directory"),
    ("stat",   "<path>",              "Show a file's size and type"),
    ("mount",  "<dev> <path> [fs]",   "Mount a device"),
    ("umount", "<path>",              "Unmount a filesystem"),
    ("mounts", "",                    "List mounted filesystems"),
    ("sync",   "",                    "Write cached sectors to disk"),
    ("ticks",  "",                    "Show the tick counter"),
    ("mem",    "[leaks]",             "Show heap and cache statistics"),
    ("play",   "",                    "Play a scale on the PC speaker"),
    ("keymap", "[name]",              "Show or change the keyboard layout"),
    ("clear",  "",                    "Clear the screen"),
    ("help",   "",                    "Show this message"),
];

/// Reads and runs commands forever.
pub fn run() -> ! {
    let mut line = String::with_capacity(MAX_LINE);
    vga::cursor::show_cursor();

    loop {
        print!(fg = Lime, "marigold");
        print!(":/> ");
        read_line(&mut line);
        execute(&line);
    }
}

/// Fills `line` from the keyboard until enter is pressed.
fn read_line(line: &mut String) {
    line.clear();

    loop {
        match keyboard::get_blocking() {
            b'\n' | b'\r' => {
                println!();
                return;
            }
            0x08 => {
                if line.pop().is_some() {
                    print!("\u{8}");
                }
            }
            key @ (b' '..=b'~') if line.len() < MAX_LINE => {
                line.push(key as char);
                print!("{}", key as char);
            }
            _ => (),
        }
    }
}

/// Runs a single command line.
pub fn execute(line: &str) {
    let mut args = line.split_whitespace();
    let Some(cmd) = args.next() else {
        return;
    };
    let args: Vec<&str> = args.collect();

    match (cmd, args.as_slice()) {
        ("ls", []) => ls("/"),
        ("ls", [path]) => ls(path),
        ("cat", [path]) => cat(path),
        ("write", [path, ..]) => {
            let text = line.trim_start().splitn(3, char::is_whitespace).nth(2).unwrap_or("");
            write(path, text)
        }
        ("rm", [path]) => report("rm", path, VFS.unlink(&absolute(path))),
        ("mkdir", [path]) => report("mkdir", path, VFS.mkdir(&absolute(path))),
        ("stat", [path]) => stat(path),
        ("mount", [dev, point]) => mount(dev, point, "fat"),
        ("mount", [dev, point, fs]) => mount(dev, point, fs),
        ("umount", [point]) => report("umount", point, VFS.unmount(&absolute(point))),
        ("mounts", []) => mounts(),
        ("sync", []) => report("sync", "/", fs::sync()),
        ("ticks", []) => ticks(),
        ("mem", []) => mem(),
        ("mem", ["leaks"]) => {
            let leaks = memory::dump_leaks();
            println!("{leaks} live allocations");
        }
        ("play", []) => speaker::play_song(&speaker::SCALE),
        ("keymap", []) => println!("keymap: {}", keyboard::keymap().name()),
        ("keymap", [name]) => match keyboard::Keymap::from_name(name) {
            Some(map) => keyboard::set_keymap(map),
            None => println!(fg = LightRed, "keymap: {name}: unknown keymap"),
        },
        ("clear", []) => vga::clear(),
        ("help", []) => help(),
        _ => match COMMANDS.iter().find(|c| c.0 == cmd) {
            Some((name, usage, _)) => println!(fg = LightRed, "usage: {name} {usage}"),
            None => println!(fg = LightRed, "{cmd}: unknown command, try help"),
        },
    }
}

/// Prints `"<op>: <path>: <error>"` if `res` failed.
fn report(op: &str, path: &str, res: Result<(), FsError>) {
    if let Err(e) = res {
        println!(fg = LightRed, "{op}: {path}: {}", e.name());
    }
}

/// Makes `path` absolute, as there's no working directory.
fn absolute(path: &str) -> String {
    if path::is_absolute(path) {
        String::from(path)
    } else {
        path::join("/", path)
    }
}

fn ls(path: &str) {
    let entries = match VFS.list_dir(&absolute(path)) {
        Ok(entries) => entries,
        Err(e) => return report("ls", path, Err(e)),
    };

    for entry in entries {
        match entry.kind {
            FileType::Directory => println!(fg = LightBlue, "  {}/", entry.name),
            FileType::Regular => println!("  {:<40} {:>10}", entry.name, entry.size),
        }
    }
}

fn cat(path: &str) {
    let fd = match VFS.open(&absolute(path), OpenFlags::RDONLY) {
        Ok(fd) => fd,
        Err(e) => return report("cat", path, Err(e)),
    };

    let mut buf = [0u8; 512];
    let res = loop {
        match VFS.read(fd, &mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => buf[..n].iter().for_each(|b| vga::print::putchar(*b)),
            Err(e) => break Err(e),
        }
    };

    report("cat", path, res.and(VFS.close(fd)));
}

fn write(path: &str, text: &str) {
    let flags = OpenFlags::CREAT | OpenFlags::WRONLY | OpenFlags::TRUNC;
    let fd = match VFS.open(&absolute(path), flags) {
        Ok(fd) => fd,
        Err(e) => return report("write", path, Err(e)),
    };

    let res = VFS.write(fd, text.as_bytes()).and_then(|_| VFS.write(fd, b"\n"));
    report("write", path, res.map(|_| ()).and(VFS.close(fd)));
}

fn stat(path: &str) {
    match VFS.stat(&absolute(path)) {
        Ok(st) => println!(
            "{path}: {} bytes, {}{}",
            st.size,
            if st.kind == FileType::Directory { "directory" } else { "file" },
            if st.read_only { ", read-only" } else { "" }
        ),
        Err(e) => report("stat", path, Err(e)),
    }
}

fn mount(dev: &str, point: &str, fs: &str) {
    report("mount", point, VFS.mount(&absolute(point), dev, fs, MountFlags::empty()));
}

fn mounts() {
    for m in VFS.list_mounts() {
        let ro = if m.flags.contains(MountFlags::READ_ONLY) { " (ro)" } else { "" };
        println!("  {:<6} on {:<16} type {}{ro}", m.device, m.point, m.fs_name);
    }
}

fn ticks() {
    let ticks = time::ticks();
    let secs = ticks / time::TICK_HZ;
    println!(
        "{ticks} ticks at {} Hz ({}h {}m {}s), {} spurious IRQs, {} dropped keys",
        time::TICK_HZ,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        interrupts::spurious_irqs(),
        keyboard::dropped()
    );
}

fn mem() {
    let stats = memory::stats();
    let buddy = stats.buddy;
    println!(
        "heap: {} / {} KiB free, {} allocs, {} frees, {} failed",
        buddy.free_bytes / 1024,
        buddy.total_bytes / 1024,
        buddy.alloc_count,
        buddy.free_count,
        buddy.failed_alloc_count
    );
    println!(
        "kmalloc: {} slab, {} buddy, {} freed, {} live objects in {} slabs",
        stats.slab_allocs, stats.buddy_allocs, stats.frees, stats.slab.live, stats.slab.slabs
    );

    if let Ok(cache) = fs::CACHE.read() {
        let c = cache.stats();
        println!(
            "cache: {} sectors ({} dirty), {} hits, {} misses, {} evictions",
            c.entries, c.dirty, c.hits, c.misses, c.evictions
        );
    }
}

fn help() {
    println!(fg = LightBlue, "Commands");
    for (name, usage, desc) in COMMANDS {
        println!("  {name:<7}{usage:<20}{desc}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that relative paths are taken from the root.
    #[test_case]
    fn paths_are_made_absolute() {
        assert_eq!(absolute("a.txt"), "/a.txt");
        assert_eq!(absolute("/b/c"), "/b/c");
    }

    /// Tests that commands can write, read and remove a file.
    #[test_case]
    fn commands_touch_the_filesystem() {
        execute("write shell.txt some words  here");
        let fd = VFS.open("/shell.txt", OpenFlags::RDONLY).unwrap();
        let mut buf = [0u8; 32];
        let n = VFS.read(fd, &mut buf).unwrap();
        VFS.close(fd).unwrap();
        assert_eq!(&buf[..n], b"some words  here\n");

        execute("cat /shell.txt");
        execute("rm shell.txt");
        assert_eq!(VFS.stat("/shell.txt"), Err(FsError::NotFound));
        execute("not-a-command");
        execute("rm");
    }
}
