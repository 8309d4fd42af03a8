/* ---------------------------------------------------------------------------
    seeder - Sunflower's build tool, sunflowerkernel.org
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
    seeder/src/main.rs

    Seeder's entry point
*/

#![feature(exit_status_error)]

use clap::{
    Arg, ArgMatches, Command, arg,
    builder::{
        Styles,
        styling::{Color, RgbColor, Style},
    },
    command, value_parser,
};
use cmd::{BUILT_KERNEL_IMG, RunCommand};
use std::process::{self, Command as Cmd};

/// The color used for headers and usage.
const MARIGOLD_ORANGE: Color = Color::Rgb(RgbColor(255, 163, 26));

/// The color used for literals.
const PETAL_YELLOW: Color = Color::Rgb(RgbColor(255, 214, 102));

mod cmd;
mod disk;

fn main() {
    let mut command = command!()
        .about("marigold's build tool, seeder")
        .override_usage("cargo sdr COMMAND [OPTIONS]")
        .styles(
            Styles::styled()
                .usage(Style::new().bold().fg_color(Some(MARIGOLD_ORANGE)))
                .header(Style::new().bold().fg_color(Some(MARIGOLD_ORANGE)))
                .literal(Style::new().bold().fg_color(Some(PETAL_YELLOW))),
        )
        .subcommand(
            Command::new("build, b")
                .alias("build")
                .alias("b")
                .about("Builds the kernel")
                .args(args()),
        )
        .subcommand(
            Command::new("run, r")
                .alias("run")
                .alias("r")
                .about("Builds then runs the kernel in QEMU, requires passing in an audio flag")
                .args(args()),
        )
        .subcommand(
            Command::new("did-i-break-anything, diba")
                .alias("did-i-break-anything")
                .alias("diba")
                .about("Runs the library tests, then the kernel tests in QEMU")
                .args(args()),
        )
        .subcommand(
            Command::new("clippy, c")
                .alias("clippy")
                .alias("c")
                .about("Checks marigold using clippy")
                .args(args()),
        )
        .subcommand(
            Command::new("dbg, d")
                .alias("dbg")
                .alias("d")
                .about("alias: run -dn")
                .args(args()),
        )
        .subcommand(
            Command::new("mkdisk, m")
                .alias("mkdisk")
                .alias("m")
                .about("Creates a FAT16 disk image with a README.TXT, which QEMU attaches as hdb")
                .arg(arg!(force: -f --force "Overwrite the image if it already exists"))
                .arg(
                    arg!(size: -s --size <MIB> "Size of the image in MiB")
                        .value_parser(value_parser!(u64).range(disk::MIN_SIZE_MIB..=disk::MAX_SIZE_MIB))
                        .default_value("32"),
                )
                .arg(arg!(out: -o --out <FILE> "Where to write the image").default_value(disk::DISK_IMG)),
        )
        .args(args());

    match command.clone().get_matches().subcommand() {
        None => _ = command.print_help(), // show help if no or unknown commands are specified
        Some(cmd) => {
            // Ok! we've gotten a command
            match cmd.0 {
                "build, b" => build(cmd.1),
                "run, r" => run(cmd.1),
                "did-i-break-anything, diba" => run_alldirs(&RunCommand::Test, cmd.1),
                "clippy, c" => run_alldirs(&RunCommand::Clippy, cmd.1),
                "dbg, d" => run(&Command::new("")
                    .args(args())
                    .get_matches_from(["", "-d", "-n"])),
                "mkdisk, m" => mkdisk(cmd.1),
                s => panic!("got unknown command: {s}"),
            }
        }
    }
}

/// Ran when the build command is specified.
fn build(args: &ArgMatches) {
    warn_unneeded_arg("build", "pipewire", args);
    warn_unneeded_arg("build", "pulseaudio", args);
    warn_unneeded_arg("build", "nosound", args);

    cmd::run_command(&RunCommand::Build, "./kernel", args);
}

/// Ran when the run command is specified.
fn run(args: &ArgMatches) {
    let pipe = args.get_flag("pipewire");
    let pulse = args.get_flag("pulseaudio");
    let nosound = args.get_flag("nosound");

    // Prevent using multiple audio options at once
    if (pipe & pulse) | (pipe & nosound) | (pulse & nosound) {
        println!(
            "error: options `--pipewire`, `--pulseaudio` and `--nosound` cannot be used together in any combination"
        );
        process::exit(4)
    }

    let audio = if pipe {
        "pipewire"
    } else if pulse {
        "pa"
    } else {
        if !nosound {
            println!("warning: no audio flag specified, assuming --nosound")
        }
        "none"
    };

    let monitor = if args.get_flag("debug") {
        &["-monitor", "stdio"]
    } else {
        &["-serial", "stdio"]
    };

    cmd::run_command(&RunCommand::Build, "./kernel", args);
    println!("Running QEMU with audio driver `{audio}`...");

    // Run QEMU!!
    if let Err(e) = Cmd::new("qemu-system-x86_64")
        .args([
            "-drive",
            format!("format=raw,file={BUILT_KERNEL_IMG}").as_str(),
            "-drive",
            format!("format=raw,file={},if=ide,index=1", disk::DISK_IMG).as_str(),
            "-audio",
            format!("driver={audio},model=virtio,id=speaker").as_str(),
            "--machine",
            "pcspk-audiodev=speaker",
        ])
        .args(monitor)
        .status()
    {
        println!(
            "error: failed running QEMU (qemu-system-x86_64): {e}\nDid you install QEMU from https://www.qemu.org/download/ ?"
        );
        process::exit(5)
    }
}

/// Ran when the mkdisk command is specified.
fn mkdisk(args: &ArgMatches) {
    let size = args.get_one::<u64>("size").copied().unwrap_or(disk::DEFAULT_SIZE_MIB);
    let out = args.get_one::<String>("out").map_or(disk::DISK_IMG, String::as_str);

    if std::path::Path::new(out).exists() && !args.get_flag("force") {
        println!("error: `{out}` already exists, pass --force to overwrite it");
        process::exit(7)
    }

    match disk::make_disk(out, size) {
        Ok(()) => println!("Created {size} MiB FAT16 disk image at `{out}`"),
        Err(e) => {
            println!("error: failed creating `{out}`, {e}");
            process::exit(3)
        }
    }
}

/// Runs command `cmd` in every crate, warning on any unneeded arguments.
fn run_alldirs(cmd: &RunCommand, args: &ArgMatches) {
    /// The dirs which `cmd` will be ran in
    static DIRS: [&str; 5] = ["seeder", "libutil", "libmem", "libfs", "kernel"];

    let str = cmd.as_str();
    warn_unneeded_arg(str, "debug", args);
    warn_unneeded_arg(str, "pipewire", args);
    warn_unneeded_arg(str, "pulseaudio", args);
    warn_unneeded_arg(str, "nosound", args);
    cmd::run_command(&RunCommand::Build, "./kernel", args);

    for dir in DIRS {
        println!("Running {str} in {dir}...");
        cmd::run_command(cmd, dir, args);
    }
}

/// Warns the user that they didn't need an argument.
fn warn_unneeded_arg(cmd: &str, arg: &str, args: &ArgMatches) {
    if args.get_flag(arg) {
        println!("warn: argument `--{arg}` is ignored when using command `{cmd}`")
    }
}

/// The optional arguments for seeder.
fn args() -> [Arg; 6] {
    [
        arg!(debug: -d --debug "Enables runtime debug tools and information"),
        arg!(allocdebug: -m --"alloc-debug" "Wraps heap allocations in canaries and tracks leaks"),
        arg!(path: -p --path <FILE> "The file to write the built bootable disk image to"),
        arg!(pipewire: -w --pipewire "Run with pipewire audio support"),
        arg!(pulseaudio: -a --pulseaudio "Run with pulseaudio audio support"),
        arg!(nosound: -n --nosound "Run without audio"),
    ]
}
