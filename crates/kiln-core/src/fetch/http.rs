//! HTTP(S) archive fetcher.
//!
//! URL form `scheme://host/path#sha256hex`; the checksum is mandatory.
//! Large downloads from servers that accept ranges are split into one
//! slice per host CPU and fetched concurrently, then concatenated.
//! A validated download leaves a `.done` marker next to the archive;
//! its presence bypasses re-fetching on later runs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{sha256_hex, unarchive, FetchError};
use crate::carton::Builder;
use crate::context::Context;
use crate::fsutil;

/// Below this size a ranged fetch is not worth the connections.
const RANGED_MIN_BYTES: u64 = 512 * 1024;

pub(super) async fn fetch(
    ctx: &Arc<Context>,
    dl_dir: &Path,
    url_and_sum: &str,
    updated: &AtomicBool,
) -> Result<(), FetchError> {
    let Some((url, want)) = url_and_sum.split_once('#') else {
        return Err(FetchError::MissingChecksum(format!(
            "{} - {url_and_sum}",
            ctx.owner()
        )));
    };

    let base = url.rsplit('/').next().unwrap_or(url);
    let dest = dl_dir.join(base);
    let done = PathBuf::from(format!("{}.done", dest.display()));

    let mut downloaded = false;
    if !fsutil::is_exist(&done) {
        download(ctx, url, want, &dest).await?;
        fsutil::touch(&done)?;
        updated.store(true, Ordering::SeqCst);
        downloaded = true;
    } else {
        trace!(file = %dest.display(), "download marker present, skipping fetch");
    }

    if let Some(unar) = unarchive::for_path(&dest) {
        let wd = PathBuf::from(ctx.get_str("WORKDIR")?);
        let extracted =
            !downloaded && ctx.carton().src_dir(&wd).is_some_and(|dir| dir.is_dir());
        if !extracted {
            ctx.output().write_line(&format!("unarchive {}", dest.display()));
            let dest2 = dest.clone();
            tokio::task::spawn_blocking(move || unar.unarchive(&dest2, &wd))
                .await
                .map_err(|_| FetchError::Cancelled)?
                .map_err(|source| FetchError::Unarchive {
                    file: dest.display().to_string(),
                    source,
                })?;
        }
    }
    Ok(())
}

async fn download(
    ctx: &Arc<Context>,
    url: &str,
    want: &str,
    dest: &Path,
) -> Result<(), FetchError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .build()?;
    let token = ctx.token();

    let head = client.head(url).send().await?;
    if !head.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: head.status().as_u16(),
        });
    }
    let ranges = head
        .headers()
        .get(reqwest::header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("bytes"));
    let length = head
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    match length {
        Some(length) if ranges && length > RANGED_MIN_BYTES => {
            debug!(url, length, "fetching in ranged slices");
            fetch_sliced(&client, url, length, dest, &token).await?;
        }
        _ => {
            let resp = client.get(url).send().await?;
            if !resp.status().is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: resp.status().as_u16(),
                });
            }
            stream_to_file(resp, dest, &token).await?;
        }
    }

    let actual = sha256_hex(dest)?;
    if actual != want {
        return Err(FetchError::CheckSum {
            file: dest.display().to_string(),
            actual,
            want: want.to_string(),
        });
    }
    Ok(())
}

async fn stream_to_file(
    resp: reqwest::Response,
    dest: &Path,
    token: &CancellationToken,
) -> Result<(), FetchError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(dest)?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        file.write_all(&chunk?)?;
    }
    file.flush()?;
    Ok(())
}

async fn fetch_sliced(
    client: &reqwest::Client,
    url: &str,
    length: u64,
    dest: &Path,
    token: &CancellationToken,
) -> Result<(), FetchError> {
    let slices = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get) as u64;
    let sub = length / slices;

    let mut group: JoinSet<Result<(), FetchError>> = JoinSet::new();
    let slice_paths: Vec<PathBuf> = (0..slices)
        .map(|i| PathBuf::from(format!("{}.{i}", dest.display())))
        .collect();

    for (i, slice_path) in slice_paths.iter().enumerate() {
        let start = sub * i as u64;
        let stop = if i as u64 == slices - 1 {
            length
        } else {
            start + sub
        };
        let client = client.clone();
        let url = url.to_string();
        let slice_path = slice_path.clone();
        let token = token.clone();
        group.spawn(async move {
            let resp = client
                .get(&url)
                .header(
                    reqwest::header::RANGE,
                    format!("bytes={start}-{}", stop - 1),
                )
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(FetchError::Status {
                    url,
                    status: resp.status().as_u16(),
                });
            }
            stream_to_file(resp, &slice_path, &token).await
        });
    }

    let mut first_err = None;
    while let Some(joined) = group.join_next().await {
        let result = joined.unwrap_or(Err(FetchError::Cancelled));
        if let Err(e) = result {
            if first_err.is_none() {
                first_err = Some(e);
                group.abort_all();
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    // Concatenate the slices, then drop them.
    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dest)?;
    for slice_path in &slice_paths {
        let mut part = File::open(slice_path)?;
        io::copy(&mut part, &mut out)?;
    }
    out.flush()?;
    for slice_path in &slice_paths {
        let _ = fs::remove_file(slice_path);
    }
    Ok(())
}
