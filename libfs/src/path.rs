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
    libfs/src/path.rs

    Helpers for absolute, '/' separated paths.
*/

use crate::FsError;
use alloc::{string::String, vec::Vec};

/// Returns whether `path` starts at the root.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Collapses `.`, `..` and repeated separators, returning an absolute path without a trailing `/`.
///
/// `..` at the root stays at the root.
pub fn normalize(path: &str) -> Result<String, FsError> {
    if !is_absolute(path) {
        return Err(FsError::InvalidParam);
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => (),
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }

    if parts.is_empty() {
        return Ok(String::from("/"));
    }

    let mut out = String::with_capacity(path.len());
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    Ok(out)
}

/// Splits a normalized path into its parent and final component.
///
/// The root has no parent and returns `None`.
pub fn split(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        return None;
    }

    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, name))
}

/// Appends `name` onto `dir`.
pub fn join(dir: &str, name: &str) -> String {
    let mut out = String::from(dir.trim_end_matches('/'));
    out.push('/');
    out.push_str(name.trim_start_matches('/'));
    out
}

/// Iterates over the components of `path`, skipping empty ones.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// If `path` lives below `prefix`, returns the rest of it as an absolute path.
pub fn strip_mount<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return Some(path);
    }

    let rest = path.strip_prefix(prefix)?;
    match rest {
        "" => Some("/"),
        rest if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[rustfmt::skip]
    fn normalizes() {
        assert_eq!( normalize("/").unwrap(),              "/"          );
        assert_eq!( normalize("//a///b/").unwrap(),       "/a/b"       );
        assert_eq!( normalize("/a/./b/../c").unwrap(),    "/a/c"       );
        assert_eq!( normalize("/../../x").unwrap(),       "/x"         );
        assert_eq!( normalize("/a/b/..").unwrap(),        "/a"         );
        assert_eq!( normalize("relative/path"),           Err(FsError::InvalidParam) );
    }

    #[test]
    #[rustfmt::skip]
    fn splits() {
        assert_eq!( split("/hello.txt"),   Some(("/", "hello.txt"))  );
        assert_eq!( split("/a/b/c"),       Some(("/a/b", "c"))       );
        assert_eq!( split("/"),            None                      );
        assert_eq!( join("/", "x"),        "/x"                      );
        assert_eq!( join("/a/", "/b"),     "/a/b"                    );
    }

    /// Tests that mount points only match whole components.
    #[test]
    #[rustfmt::skip]
    fn strips_mounts() {
        assert_eq!( strip_mount("/mnt/disk/a", "/mnt/disk"), Some("/a")  );
        assert_eq!( strip_mount("/mnt/disk", "/mnt/disk"),   Some("/")   );
        assert_eq!( strip_mount("/mnt/diskette", "/mnt/disk"), None      );
        assert_eq!( strip_mount("/etc", "/"),                Some("/etc"));
        assert_eq!( components("/a//b/").collect::<Vec<_>>(), ["a", "b"] );
    }
}
