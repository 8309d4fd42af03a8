use std::{fs, io};

use chrono::{Datelike, Local};
use serde::Deserialize;
use thiserror::Error;
use toml::de;

/// The path to the version file.
const VERSION: &str = "../VERSION";

/// The parsed VERSION file.
#[derive(Deserialize)]
pub struct Version {
      kernel: Kernel,
      #[serde(default)]
      config: Config,
}

/// The kernel's version fields.
#[derive(Deserialize)]
pub struct Kernel {
      version_major: String,
      version_minor: String,
      version_patch: String,
      patch_quote:   String,
}

/// Boot time defaults, every field can be left out.
#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
      pit_hz:      u32,
      root_device: String,
      root_fs:     String,
      keymap:      String,
}

impl Default for Config {
      fn default() -> Self {
            Config {
                  pit_hz:      1000,
                  root_device: String::from("hdb"),
                  root_fs:     String::from("fat"),
                  keymap:      String::from("us"),
            }
      }
}

/// Parses the VERSION file ands sends it to marigold through environment variables.
#[rustfmt::skip]
fn main() -> Result<(), ParseVersionError> {
    let buf = fs::read_to_string(VERSION)?;
    let v: Version = toml::from_str(&buf)?;
    let version_fmt = format!("{}.{}.{}", v.kernel.version_major, v.kernel.version_minor, v.kernel.version_patch);
    let year = Local::now().year();

    if !(19..=1_193_180).contains(&v.config.pit_hz) {
        return Err(ParseVersionError::BadFrequency(v.config.pit_hz));
    }

    println!("cargo::rerun-if-changed={VERSION}");
    println!("cargo::rustc-env=MGK_VERSION={}", version_fmt);
    println!("cargo::rustc-env=MGK_VERSION_SHORT=MGK v{}.{}", v.kernel.version_major, v.kernel.version_minor);
    println!("cargo::rustc-env=MGK_PATCH_QUOTE={}", v.kernel.patch_quote);
    println!("cargo::rustc-env=MGK_BUILD_YEAR={}", year);
    println!("cargo::rustc-env=MGK_PIT_HZ={}", v.config.pit_hz);
    println!("cargo::rustc-env=MGK_ROOT_DEVICE={}", v.config.root_device);
    println!("cargo::rustc-env=MGK_ROOT_FS={}", v.config.root_fs);
    println!("cargo::rustc-env=MGK_KEYMAP={}", v.config.keymap);

    Ok(())
}

#[derive(Error, Debug)]
enum ParseVersionError {
      #[error("failed reading the VERSION file: {0}")]
      IOError(#[from] io::Error),

      #[error("failed parsing the VERSION file: {0}")]
      ParseError(#[from] de::Error),

      #[error("pit_hz must be between 19 and 1193180, got {0}")]
      BadFrequency(u32),
}
