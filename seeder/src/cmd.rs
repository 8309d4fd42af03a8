use clap::ArgMatches;
use std::{
    fs,
    io,
    path::Path,
    process::{self, Command, ExitStatusError},
};
use thiserror::Error;

/// Where bootimage puts the built kernel image.
pub const BUILT_KERNEL_IMG: &str = "kernel/target/x86_64-marigold/release/bootimage-marigold.bin";

/// Where the kernel image is copied to if `--path` isn't given.
const COPIED_KERNEL_IMG: &str = "marigold.bin";

/// A command which can be ran by seeder.
#[derive(PartialEq)]
pub enum RunCommand {
    Build,
    Clippy,
    Test,
}

impl RunCommand {
    /// Converts the command to a `&str`.
    pub fn as_str(&self) -> &str {
        match self {
            RunCommand::Build => "bootimage",
            RunCommand::Clippy => "paperclip",
            RunCommand::Test => "did-i-break-anything",
        }
    }
}

/// Runs command `cmd` in dir `dir`, installing bootimage if required and aborting if any errors occured.
/// See `kernel/.cargo/config.toml` for a list of commands.
pub fn run_command(cmd: &RunCommand, dir: &str, args: &ArgMatches) {
    let cmd_str = cmd.as_str();
    if let Err(e) = try_run(cmd_str, dir, args) {
        if *cmd != RunCommand::Build {
            println!("error: failed running command {cmd_str}: {e}");
            process::exit(6)
        }

        // cargo couldn't run bootimage... :c
        println!("Installing bootimage build tool...");

        if let Err(e) = Command::new("cargo")
            .args(["install", "bootimage@0.10.3"])
            .status()
        {
            // cargo couldn't install bootimage?
            println!("error: running `cargo` to install bootimage@0.10.3, {e}");
            process::exit(1)
        }

        // ok! we installed bootimage
        if let Err(e) = try_run(cmd_str, dir, args) {
            println!("error: failed running build command, {e}");
            process::exit(2)
        }
    }

    // QEMU attaches the disk as hdb for both runs and tests
    if !Path::new(crate::disk::DISK_IMG).exists() {
        println!("Creating {}...", crate::disk::DISK_IMG);
        if let Err(e) = crate::disk::make_disk(crate::disk::DISK_IMG, crate::disk::DEFAULT_SIZE_MIB) {
            println!("error: failed creating {}, {e}", crate::disk::DISK_IMG);
            process::exit(3)
        }
    }

    // just need to copy over the bin and we're done!
    if *cmd == RunCommand::Build {
        let path = if let Some(path) = args.get_one("path") {
            path
        } else {
            &String::from(COPIED_KERNEL_IMG)
        };
        println!("Built kernel image at `{BUILT_KERNEL_IMG}`, copying to `{path}`...");
        if fs::copy(BUILT_KERNEL_IMG, path).is_err() {
            println!("warn: failed copying kernel image, yet a built image of marigold still exists at `{path}`");
        } else {
            println!("Successfully built bootable marigold image located at `{path}`")
        }
    }
}

/// Attempts to run command `cmd`, returning false if any errors occured.
fn try_run(cmd: &str, dir: &str, args: &ArgMatches) -> Result<(), RunCargoError> {
    // Check for any features, host crates don't have them
    let mut feats = Vec::new();
    if dir == "kernel" || dir == "./kernel" {
        if args.get_flag("debug") {
            feats.push("debug_info");
        }
        if args.get_flag("allocdebug") {
            feats.push("alloc_debug");
        }
    }
    let feats = if feats.is_empty() {
        Vec::new()
    } else {
        vec![String::from("-F"), feats.join(",")]
    };

    let path = fs::canonicalize(dir).map_err(|e| RunCargoError::NoDir(dir.to_owned(), e))?;

    // The kernel has it's own aliases, everything else is plain cargo
    let cmd = match (dir.ends_with("kernel"), cmd) {
        (false, "paperclip") => "clippy",
        (false, "did-i-break-anything") => "test",
        (false, _) => "build",
        (true, cmd) => cmd,
    };

    let mut build_cmd = Command::new("cargo");
    let build_cmd = build_cmd
        .args([cmd, "--manifest-path", "./Cargo.toml"])
        .args(&feats)
        .current_dir(path);
    build_cmd.status()?.exit_ok().map_err(Into::into)
}

#[derive(Error, Debug)]
enum RunCargoError {
    #[error("failed running cargo, {0}")]
    CouldntRun(#[from] io::Error),

    #[error("cargo returned error: {0}")]
    BadExitStatus(#[from] ExitStatusError),

    #[error("no {0}/ directory found, {1}")]
    NoDir(String, io::Error),
}
