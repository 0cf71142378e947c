//! Source acquisition.
//!
//! A carton's [`Resource`] maps version strings to [`SrcUrl`]s, each an
//! insertion-ordered list of fetch commands. Downloading fans the
//! commands of the selected version out concurrently; any fetcher that
//! detects new content flips the `updated` flag, and the caller's
//! notifier fires once after the group succeeds.

mod file;
mod http;
pub mod unarchive;
mod vcs;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::warn;

use crate::context::Context;
pub use unarchive::{UnarchiveError, Unarchiver};

/// Fetch failure.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// An HTTP source URL without the mandatory `#sha256` suffix.
    #[error("{0}: URL has no checksum")]
    MissingChecksum(String),

    /// Downloaded archive hashed to something else.
    #[error("checksum mismatch on {file}: got {actual}, expect {want}")]
    CheckSum {
        /// Offending file path.
        file: String,
        /// The sum actually computed.
        actual: String,
        /// The sum the recipe declared.
        want: String,
    },

    /// Remote answered with a non-success status.
    #[error("{url}: HTTP status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Status code received.
        status: u16,
    },

    /// Transport-level HTTP failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// A version-control command failed.
    #[error("failed to run {tool} {cmdline}")]
    Vcs {
        /// The VCS binary.
        tool: String,
        /// The command line that failed.
        cmdline: String,
    },

    /// `file://` source missing from every file-search path.
    #[error("{0} is not found in file-search paths")]
    NotFoundInPaths(String),

    /// Archive extraction failed.
    #[error("unarchive {file}: {source}")]
    Unarchive {
        /// Archive being extracted.
        file: String,
        /// Underlying extraction error.
        source: UnarchiveError,
    },

    /// The fetch was cancelled.
    #[error("fetch cancelled")]
    Cancelled,

    /// Context variable problem (unresolved expansion and friends).
    #[error(transparent)]
    Context(#[from] crate::context::ContextError),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One fetch command: a URL paired with its protocol.
#[derive(Debug, Clone)]
pub enum FetchCmd {
    /// `http://` / `https://` archive with trailing `#sha256`.
    Http(String),
    /// VCS repository, `repo[@revision]`.
    Vcs(String),
    /// `file://` path resolved against the carton's file-search paths.
    File(String),
}

/// The source URLs for one version of one carton.
#[derive(Debug, Clone, Default)]
pub struct SrcUrl {
    cmds: Vec<FetchCmd>,
}

impl SrcUrl {
    /// The fetch commands in insertion order.
    #[must_use]
    pub fn cmds(&self) -> &[FetchCmd] {
        &self.cmds
    }
}

#[derive(Debug, Default)]
struct Inner {
    resource: HashMap<String, SrcUrl>,
    prefer: Option<String>,
    selected: Option<String>,
}

/// Fetch state of one carton.
#[derive(Debug)]
pub struct Resource {
    dl_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl Resource {
    /// Create empty fetch state downloading into `dl_dir`.
    #[must_use]
    pub fn new(dl_dir: impl Into<PathBuf>) -> Self {
        Self {
            dl_dir: dl_dir.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register HTTP source URLs for `version`. `urls` may hold several
    /// whitespace-separated entries; each needs a `#sha256` suffix.
    pub fn push_http(&self, version: &str, urls: &str) -> &Self {
        let mut inner = self.inner.lock().expect("resource poisoned");
        let src = inner.resource.entry(version.to_string()).or_default();
        for u in urls.split_whitespace() {
            src.cmds.push(FetchCmd::Http(u.to_string()));
        }
        drop(inner);
        self
    }

    /// Register one VCS repository for `version`, `repo[@revision]`.
    pub fn push_vcs(&self, version: &str, url: &str) -> &Self {
        let url = url.trim();
        assert!(
            !url.contains(char::is_whitespace),
            "one repository per PushVcs call"
        );
        let mut inner = self.inner.lock().expect("resource poisoned");
        inner
            .resource
            .entry(version.to_string())
            .or_default()
            .cmds
            .push(FetchCmd::Vcs(url.to_string()));
        drop(inner);
        self
    }

    /// Register `file://` source URLs for `version`, whitespace-separated.
    pub fn push_file(&self, version: &str, urls: &str) -> &Self {
        let mut inner = self.inner.lock().expect("resource poisoned");
        let src = inner.resource.entry(version.to_string()).or_default();
        for u in urls.split_whitespace() {
            src.cmds.push(FetchCmd::File(u.to_string()));
        }
        drop(inner);
        self
    }

    /// All known versions, newest first.
    #[must_use]
    pub fn versions(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("resource poisoned");
        let mut versions: Vec<String> = inner.resource.keys().cloned().collect();
        drop(inner);
        versions.sort_by(|a, b| compare_versions(b, a));
        versions
    }

    /// Set the preferred version. The first call wins; later calls are
    /// warnings, not errors.
    pub fn prefer(&self, version: &str) {
        let mut inner = self.inner.lock().expect("resource poisoned");
        if inner.prefer.is_some() {
            warn!(version, "preferred version already set, ignoring");
            return;
        }
        inner.prefer = Some(version.to_string());
    }

    /// The selected source URLs and version: the preferred version if
    /// set, otherwise the newest.
    #[must_use]
    pub fn selected(&self) -> Option<(SrcUrl, String)> {
        let prefer = {
            let inner = self.inner.lock().expect("resource poisoned");
            if let Some(sel) = &inner.selected {
                return inner.resource.get(sel).map(|s| (s.clone(), sel.clone()));
            }
            inner.prefer.clone()
        };

        let version = prefer.or_else(|| self.versions().into_iter().next())?;

        let mut inner = self.inner.lock().expect("resource poisoned");
        inner.selected = Some(version.clone());
        inner.resource.get(&version).map(|s| (s.clone(), version))
    }

    /// The selected version string, empty if no sources are registered.
    #[must_use]
    pub fn version(&self) -> String {
        self.selected().map(|(_, v)| v).unwrap_or_default()
    }

    /// Download every source URL of the selected version. Fetchers run
    /// concurrently; the first failure cancels the rest. `notify(true)`
    /// fires once if any fetcher saw new content.
    ///
    /// # Errors
    ///
    /// The first fetcher error, or [`FetchError::Cancelled`].
    pub async fn download(
        &self,
        ctx: &Arc<Context>,
        notify: Option<&(dyn Fn(bool) + Send + Sync)>,
    ) -> Result<(), FetchError> {
        let Some((src, _)) = self.selected() else {
            warn!(owner = %ctx.owner(), "carton holds no source URL");
            return Ok(());
        };

        let updated = Arc::new(AtomicBool::new(false));
        let token = ctx.token().child_token();
        let mut group: JoinSet<Result<(), FetchError>> = JoinSet::new();

        for cmd in src.cmds {
            let ctx = Arc::clone(ctx);
            let updated = Arc::clone(&updated);
            let token = token.clone();
            let dl_dir = self.dl_dir.clone();
            group.spawn(async move {
                let run = async {
                    match &cmd {
                        FetchCmd::Http(url) => http::fetch(&ctx, &dl_dir, url, &updated).await,
                        FetchCmd::Vcs(url) => vcs::fetch(&ctx, url, &updated).await,
                        FetchCmd::File(url) => file::fetch(&ctx, url, &updated).await,
                    }
                };
                tokio::select! {
                    r = run => r,
                    () = token.cancelled() => Err(FetchError::Cancelled),
                }
            });
        }

        let mut first_err = None;
        while let Some(joined) = group.join_next().await {
            let result = joined.unwrap_or(Err(FetchError::Cancelled));
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                    token.cancel();
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        if updated.load(AtomicOrdering::SeqCst) {
            if let Some(notify) = notify {
                notify(true);
            }
        }
        Ok(())
    }
}

/// Order two version strings, newest greatest.
///
/// Versions are dot-split and compared segment-wise numerically; a
/// non-numeric segment compares equal at its level; on a prefix tie
/// the longer version wins. `2.0 > 1.0.1 > 1.0 > HEAD`.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let sa: Vec<&str> = a.split('.').collect();
    let sb: Vec<&str> = b.split('.').collect();
    for (x, y) in sa.iter().zip(sb.iter()) {
        if let (Ok(nx), Ok(ny)) = (x.parse::<i64>(), y.parse::<i64>()) {
            match nx.cmp(&ny) {
                Ordering::Equal => {}
                other => return other,
            }
        }
    }
    sa.len().cmp(&sb.len())
}

/// Hex-encoded SHA-256 of the file at `path`.
///
/// # Errors
///
/// Any I/O failure while reading.
pub fn sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let res = Resource::new("/dl");
        for v in ["1.0", "2.0", "1.0.1", "HEAD"] {
            res.push_http(v, &format!("http://example.com/pkg-{v}.tar.gz#00"));
        }
        assert_eq!(res.versions(), vec!["2.0", "1.0.1", "1.0", "HEAD"]);
    }

    #[test]
    fn test_selected_picks_newest_by_default() {
        let res = Resource::new("/dl");
        res.push_http("1.2.11", "http://example.com/a.tar.gz#00");
        res.push_http("1.2.8", "http://example.com/b.tar.gz#00");
        let (_, version) = res.selected().unwrap();
        assert_eq!(version, "1.2.11");
    }

    #[test]
    fn test_prefer_wins_and_sets_once() {
        let res = Resource::new("/dl");
        res.push_http("1.0", "http://example.com/a.tar.gz#00");
        res.push_http("2.0", "http://example.com/b.tar.gz#00");
        res.prefer("1.0");
        res.prefer("2.0"); // ignored
        let (_, version) = res.selected().unwrap();
        assert_eq!(version, "1.0");
    }

    #[test]
    fn test_push_http_splits_whitespace() {
        let res = Resource::new("/dl");
        res.push_http("1.0", "http://a/x.tar.gz#0 http://b/y.tar.gz#1");
        let (src, _) = res.selected().unwrap();
        assert_eq!(src.cmds().len(), 2);
    }
}
