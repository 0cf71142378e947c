//! Archive extraction strategies.
//!
//! Each supported suffix maps to an [`Unarchiver`]; the HTTP fetcher
//! dispatches on the downloaded file's name. Extraction recreates
//! directories with mode 0755, preserves regular-file modes, and
//! recreates symbolic links.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Extraction failure.
#[derive(Debug, thiserror::Error)]
pub enum UnarchiveError {
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Malformed zip archive.
    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An entry tried to escape the destination directory.
    #[error("archive entry escapes destination: {0}")]
    Escape(String),
}

/// Strategy interface for one archive format.
pub trait Unarchiver: Send + Sync {
    /// Extract `fpath` into the directory `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive is malformed or extraction
    /// fails.
    fn unarchive(&self, fpath: &Path, dest: &Path) -> Result<(), UnarchiveError>;
}

/// Pick the unarchiver matching `fpath`'s suffix, if any.
#[must_use]
pub fn for_path(fpath: &Path) -> Option<&'static dyn Unarchiver> {
    let name = fpath.file_name()?.to_str()?;
    let table: [(&str, &'static dyn Unarchiver); 6] = [
        (".tar.gz", &TGZ),
        (".tgz", &TGZ),
        (".tar.bz2", &TBZ2),
        (".tbz2", &TBZ2),
        (".tar", &TAR),
        (".zip", &ZIP),
    ];
    table
        .iter()
        .find(|(suffix, _)| name.ends_with(suffix))
        .map(|(_, u)| *u)
}

static TAR: TarFmt = TarFmt;
static TGZ: TgzFmt = TgzFmt;
static TBZ2: Tbz2Fmt = Tbz2Fmt;
static ZIP: ZipFmt = ZipFmt;

struct TarFmt;
struct TgzFmt;
struct Tbz2Fmt;
struct ZipFmt;

impl Unarchiver for TarFmt {
    fn unarchive(&self, fpath: &Path, dest: &Path) -> Result<(), UnarchiveError> {
        untar(File::open(fpath)?, dest)
    }
}

impl Unarchiver for TgzFmt {
    fn unarchive(&self, fpath: &Path, dest: &Path) -> Result<(), UnarchiveError> {
        untar(flate2::read::GzDecoder::new(File::open(fpath)?), dest)
    }
}

impl Unarchiver for Tbz2Fmt {
    fn unarchive(&self, fpath: &Path, dest: &Path) -> Result<(), UnarchiveError> {
        untar(bzip2::read::BzDecoder::new(File::open(fpath)?), dest)
    }
}

impl Unarchiver for ZipFmt {
    fn unarchive(&self, fpath: &Path, dest: &Path) -> Result<(), UnarchiveError> {
        let mut archive = zip::ZipArchive::new(File::open(fpath)?)?;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let Some(rel) = entry.enclosed_name() else {
                return Err(UnarchiveError::Escape(entry.name().to_string()));
            };
            let target = dest.join(rel);
            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
            } else {
                let mode = entry.unix_mode().unwrap_or(0o644);
                crate::fsutil::copy_file(&target, mode, &mut entry)?;
            }
        }
        Ok(())
    }
}

fn untar(reader: impl Read, dest: &Path) -> Result<(), UnarchiveError> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)?;
    Ok(())
}
