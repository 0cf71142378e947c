//! Small filesystem helpers shared by the fetchers and staging.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Copy everything from `r` into a freshly created `name` with `mode`,
/// creating parent directories as needed.
///
/// # Errors
///
/// Any I/O failure along the way.
pub fn copy_file(name: &Path, mode: u32, mut r: impl Read) -> io::Result<()> {
    if let Some(parent) = name.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut w = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(name)?;
    io::copy(&mut r, &mut w)?;
    w.flush()?;
    fs::set_permissions(name, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

/// Create a symlink at `path` pointing to `target`, replacing any
/// existing link and creating parent directories.
///
/// # Errors
///
/// Any I/O failure along the way.
pub fn make_symlink(path: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path)?;
    }
    std::os::unix::fs::symlink(target, path)
}

/// Whether `path` exists (file or directory).
#[must_use]
pub fn is_exist(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Create an empty marker file at `path`.
///
/// # Errors
///
/// Any I/O failure along the way.
pub fn touch(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path).map(|_| ())
}
