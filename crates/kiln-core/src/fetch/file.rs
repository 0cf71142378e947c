//! Local-file fetcher.
//!
//! `file://relative/path` is resolved against the carton's file-search
//! paths in order; the first existing match wins and is mirrored into
//! the work directory. Files only copy when missing or changed, so an
//! unchanged source does not flip the `updated` flag.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use md5::{Digest, Md5};
use walkdir::WalkDir;

use super::FetchError;
use crate::context::Context;
use crate::fsutil;

pub(super) async fn fetch(
    ctx: &Arc<Context>,
    url: &str,
    updated: &AtomicBool,
) -> Result<(), FetchError> {
    let rel = url.strip_prefix("file://").unwrap_or(url);

    for base in ctx.files_path() {
        let root = base.join(rel);
        if !fsutil::is_exist(&root) {
            continue;
        }

        let wd = PathBuf::from(ctx.get_str("WORKDIR")?);
        for entry in WalkDir::new(&root) {
            if ctx.token().is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let entry = entry.map_err(std::io::Error::other)?;
            let rel_path = entry
                .path()
                .strip_prefix(&base)
                .map_err(std::io::Error::other)?;
            let target = wd.join(rel_path);

            let ftype = entry.file_type();
            if ftype.is_dir() {
                fs::create_dir_all(&target)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
            } else if ftype.is_symlink() {
                let link = fs::read_link(entry.path())?;
                fsutil::make_symlink(&target, &link)?;
            } else {
                sync_file(ctx, entry.path(), &target, updated).await?;
            }
        }
        return Ok(());
    }

    Err(FetchError::NotFoundInPaths(url.to_string()))
}

/// Copy `from` over `to` when the destination is missing or its digest
/// differs. Digests of both sides are computed concurrently.
async fn sync_file(
    ctx: &Arc<Context>,
    from: &Path,
    to: &Path,
    updated: &AtomicBool,
) -> Result<(), FetchError> {
    let mode = fs::metadata(from)?.permissions().mode();

    if !fsutil::is_exist(to) {
        ctx.output()
            .write_line(&format!("Copy {} to {}", from.display(), to.display()));
        fsutil::copy_file(to, mode, fs::File::open(from)?)?;
        updated.store(true, Ordering::SeqCst);
        return Ok(());
    }

    let (sum_from, sum_to) = tokio::join!(md5_of(from.to_path_buf()), md5_of(to.to_path_buf()));
    if sum_from? != sum_to? {
        ctx.output()
            .write_line(&format!("Sync {} to {}", from.display(), to.display()));
        fsutil::copy_file(to, mode, fs::File::open(from)?)?;
        updated.store(true, Ordering::SeqCst);
    }
    Ok(())
}

async fn md5_of(path: PathBuf) -> Result<[u8; 16], FetchError> {
    let data = tokio::fs::read(path).await?;
    Ok(Md5::digest(&data).into())
}
