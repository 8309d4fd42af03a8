/* ---------------------------------------------------------------------------
    libfs - marigold kernel filesystem library
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
    libfs/src/error.rs

    Errors returned by block devices and filesystems.
*/

use thiserror::Error;

/// Why a block device request failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("bad request parameters")]
    Params,
    #[error("device timed out")]
    Timeout,
    #[error("device reported an error")]
    DeviceError,
    #[error("device fault")]
    DeviceFault,
    #[error("no such device")]
    NoDevice,
    #[error("request is past the end of the device")]
    Bounds,
    #[error("operation not supported by the device")]
    Unsupported,
    #[error("device is locked")]
    Locked,
    #[error("internal driver error")]
    Internal,
    #[error("I/O error")]
    Io,
}

/// Why a filesystem operation failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    FileExists,
    #[error("is a directory")]
    IsADirectory,
    #[error("not a directory")]
    NotADirectory,
    #[error("permission denied")]
    PermissionDenied,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no space left on device")]
    OutOfSpace,
    #[error("filesystem is corrupt")]
    CorruptFilesystem,
    #[error("I/O error")]
    Io,
    #[error("device error: {0}")]
    Device(BlockError),
    #[error("operation not supported")]
    NotSupported,
    #[error("internal error")]
    Internal,
    #[error("short name already in use")]
    NameCollision,
    #[error("not initialised")]
    NotInitialised,
    #[error("resource busy")]
    Busy,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("too many open files")]
    TooManyOpenFiles,
}

impl FsError {
    /// The negative integer code of the error.
    pub const fn code(&self) -> i32 {
        match self {
            FsError::InvalidParam => -1,
            FsError::NotFound => -2,
            FsError::FileExists => -3,
            FsError::IsADirectory => -4,
            FsError::NotADirectory => -5,
            FsError::PermissionDenied => -6,
            FsError::OutOfMemory => -7,
            FsError::OutOfSpace => -8,
            FsError::CorruptFilesystem => -9,
            FsError::Io => -10,
            FsError::Device(_) => -11,
            FsError::NotSupported => -12,
            FsError::Internal => -13,
            FsError::NameCollision => -14,
            FsError::NotInitialised => -15,
            FsError::Busy => -16,
            FsError::ReadOnly => -17,
            FsError::BadDescriptor => -18,
            FsError::TooManyOpenFiles => -19,
        }
    }

    /// A short name for the error, printed by the prompt.
    pub const fn name(&self) -> &'static str {
        match self {
            FsError::InvalidParam => "InvalidParam",
            FsError::NotFound => "NotFound",
            FsError::FileExists => "FileExists",
            FsError::IsADirectory => "IsADirectory",
            FsError::NotADirectory => "NotADirectory",
            FsError::PermissionDenied => "PermissionDenied",
            FsError::OutOfMemory => "OutOfMemory",
            FsError::OutOfSpace => "OutOfSpace",
            FsError::CorruptFilesystem => "CorruptFilesystem",
            FsError::Io => "IOError",
            FsError::Device(e) => e.name(),
            FsError::NotSupported => "NotSupported",
            FsError::Internal => "Internal",
            FsError::NameCollision => "NameCollision",
            FsError::NotInitialised => "NotInitialised",
            FsError::Busy => "Busy",
            FsError::ReadOnly => "ReadOnly",
            FsError::BadDescriptor => "BadDescriptor",
            FsError::TooManyOpenFiles => "TooManyOpenFiles",
        }
    }
}

impl BlockError {
    /// A short name for the error.
    pub const fn name(&self) -> &'static str {
        match self {
            BlockError::Params => "PARAMS",
            BlockError::Timeout => "TIMEOUT",
            BlockError::DeviceError => "DEV_ERR",
            BlockError::DeviceFault => "DEV_FAULT",
            BlockError::NoDevice => "NO_DEV",
            BlockError::Bounds => "BOUNDS",
            BlockError::Unsupported => "UNSUPPORTED",
            BlockError::Locked => "LOCKED",
            BlockError::Internal => "INTERNAL",
            BlockError::Io => "IO",
        }
    }
}

/// Device errors callers may want to retry keep their identity, the rest become plain IO errors.
impl From<BlockError> for FsError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::Timeout | BlockError::DeviceError | BlockError::DeviceFault => FsError::Device(err),
            BlockError::Params | BlockError::Bounds => FsError::InvalidParam,
            BlockError::NoDevice => FsError::NotFound,
            BlockError::Unsupported => FsError::NotSupported,
            BlockError::Locked => FsError::Busy,
            BlockError::Internal | BlockError::Io => FsError::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that every error has a unique negative code.
    #[test]
    fn codes_are_unique() {
        let all = [
            FsError::InvalidParam,
            FsError::NotFound,
            FsError::FileExists,
            FsError::IsADirectory,
            FsError::NotADirectory,
            FsError::PermissionDenied,
            FsError::OutOfMemory,
            FsError::OutOfSpace,
            FsError::CorruptFilesystem,
            FsError::Io,
            FsError::Device(BlockError::Timeout),
            FsError::NotSupported,
            FsError::Internal,
            FsError::NameCollision,
            FsError::NotInitialised,
            FsError::Busy,
            FsError::ReadOnly,
            FsError::BadDescriptor,
            FsError::TooManyOpenFiles,
        ];

        let mut codes: Vec<_> = all.iter().map(FsError::code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(codes.iter().all(|&c| (-19..=-1).contains(&c)))
    }

    /// Tests that transient device errors keep their identity.
    #[test]
    fn block_errors_convert() {
        assert_eq!(FsError::from(BlockError::Timeout), FsError::Device(BlockError::Timeout));
        assert_eq!(FsError::from(BlockError::DeviceFault).name(), "DEV_FAULT");
        assert_eq!(FsError::from(BlockError::Io), FsError::Io);
        assert_eq!(FsError::from(BlockError::Bounds), FsError::InvalidParam)
    }
}
