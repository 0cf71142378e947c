//! Hard-link staging of built output trees.
//!
//! A dependency's packaged files are made visible to a consumer by
//! hard-linking them into the consumer's sysroot. Hard links cannot
//! cross filesystems and cannot link directories; directories are
//! recreated, regular files linked, symlinks copied.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::trace;
use walkdir::WalkDir;

/// Stage `from` into `to` recursively. A missing `from` is not an
/// error; there is simply nothing to stage.
///
/// # Errors
///
/// Any I/O failure while walking or linking.
pub fn stage(from: &Path, to: &Path) -> io::Result<()> {
    match fs::symlink_metadata(from) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
        Ok(_) => {}
    }
    trace!(from = %from.display(), to = %to.display(), "staging");

    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let dest = if rel.as_os_str().is_empty() {
            to.to_path_buf()
        } else {
            to.join(rel)
        };

        let ftype = entry.file_type();
        if ftype.is_dir() {
            fs::create_dir_all(&dest)?;
            let mode = entry.metadata().map_err(io::Error::other)?.permissions().mode();
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o7777))?;
        } else if ftype.is_symlink() {
            let target = fs::read_link(entry.path())?;
            crate::fsutil::make_symlink(&dest, &target)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            if crate::fsutil::is_exist(&dest) {
                fs::remove_file(&dest)?;
            }
            fs::hard_link(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Selective staging: stage the white list, then remove the black list
/// from the destination.
#[derive(Debug, Default)]
pub struct StageBox {
    white: Vec<PathBuf>,
    black: Vec<PathBuf>,
}

impl StageBox {
    /// An empty box.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relative file or directory to the white list.
    ///
    /// # Panics
    ///
    /// Panics on an absolute path; box entries are relative to the
    /// staging roots.
    pub fn push(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        let path = path.into();
        assert!(!path.is_absolute(), "StageBox rejects absolute paths");
        self.white.push(path);
        self
    }

    /// Add a relative file or directory to the black list.
    ///
    /// # Panics
    ///
    /// Panics on an absolute path.
    pub fn pop(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        let path = path.into();
        assert!(!path.is_absolute(), "StageBox rejects absolute paths");
        self.black.push(path);
        self
    }

    /// Stage white-listed entries from `from` into `to`, then delete
    /// black-listed entries under `to`.
    ///
    /// # Errors
    ///
    /// Any I/O failure while staging.
    pub fn stage(&self, from: &Path, to: &Path) -> io::Result<()> {
        for w in &self.white {
            stage(&from.join(w), &to.join(w))?;
        }
        for b in &self.black {
            let t = to.join(b);
            trace!(path = %t.display(), "removing black-listed entry");
            if t.is_dir() {
                fs::remove_dir_all(&t)?;
            } else if crate::fsutil::is_exist(&t) {
                fs::remove_file(&t)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(root: &Path) {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("bin/tool"), "#!/bin/sh\n").unwrap();
        fs::write(root.join("lib/libz.so.1"), "elf").unwrap();
        std::os::unix::fs::symlink("libz.so.1", root.join("lib/libz.so")).unwrap();
    }

    #[test]
    fn test_stage_links_files_and_recreates_symlinks() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("pkg");
        let to = tmp.path().join("sysroot");
        seed(&from);

        stage(&from, &to).unwrap();

        assert!(to.join("bin/tool").exists());
        assert_eq!(
            fs::read_link(to.join("lib/libz.so")).unwrap(),
            Path::new("libz.so.1")
        );
        // Hard link: same inode.
        use std::os::unix::fs::MetadataExt;
        assert_eq!(
            fs::metadata(from.join("lib/libz.so.1")).unwrap().ino(),
            fs::metadata(to.join("lib/libz.so.1")).unwrap().ino()
        );
    }

    #[test]
    fn test_stage_missing_source_is_noop() {
        let tmp = TempDir::new().unwrap();
        stage(&tmp.path().join("absent"), &tmp.path().join("out")).unwrap();
        assert!(!tmp.path().join("out").exists());
    }

    #[test]
    fn test_stagebox_white_and_black_lists() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("pkg");
        let to = tmp.path().join("sysroot");
        seed(&from);

        let mut sb = StageBox::new();
        sb.push("bin").push("lib").pop("lib/libz.so");
        sb.stage(&from, &to).unwrap();

        assert!(to.join("bin/tool").exists());
        assert!(to.join("lib/libz.so.1").exists());
        assert!(!crate::fsutil::is_exist(&to.join("lib/libz.so")));
    }
}
