//! Version-control fetcher.
//!
//! URL form `repo[@revision]`; the revision may be a tag, a branch, or
//! a commit-hash prefix. The tool's command lines are kept as data so
//! another VCS can slot in beside git.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, trace};

use super::FetchError;
use crate::context::Context;

struct VcsTool {
    cmd: &'static str,
    /// Directory entry whose presence marks a checkout, e.g. `.git`.
    index: &'static str,
    create_cmd: &'static [&'static str],
    /// `(command line, capture pattern)` pairs tried in order.
    tag_lookup: &'static [(&'static str, &'static str)],
    tag_sync: &'static [&'static str],
    tag_sync_default: &'static [&'static str],
    /// Creates a pseudo tag when the revision is a bare commit prefix.
    tag_new: &'static str,
    probe_cmd: &'static str,
}

static GIT: VcsTool = VcsTool {
    cmd: "git",
    index: ".git",
    create_cmd: &["clone $repo"],
    tag_lookup: &[("show-ref tags/$tag origin/$tag", r"((?:tags|origin)/\S+)$")],
    tag_sync: &["checkout $tag"],
    tag_sync_default: &["checkout master"],
    tag_new: "tag $tag $tag",
    probe_cmd: "rev-parse HEAD",
};

pub(super) async fn fetch(
    ctx: &Arc<Context>,
    url: &str,
    updated: &AtomicBool,
) -> Result<(), FetchError> {
    let (repo, tag) = split_revision(url);
    let run = VcsRun {
        tool: &GIT,
        repo: repo.to_string(),
        tag: tag.unwrap_or_default().to_string(),
    };

    let wd = PathBuf::from(ctx.get_str("WORKDIR")?);
    let dir = run.local_dir(&wd);

    let before = run.head(ctx, &dir).await;
    run.ensure_repo(ctx, &wd, &dir).await?;
    run.sync_tag(ctx, &dir).await?;
    let after = run.head(ctx, &dir).await;

    if before != after {
        debug!(repo, ?before, ?after, "repository HEAD moved");
        updated.store(true, Ordering::SeqCst);
    }
    Ok(())
}

/// Split `repo[@revision]`. A trailing `@segment` only counts as a
/// revision when it holds no path separator, so ssh-style
/// `git@host:path` URLs survive intact.
fn split_revision(url: &str) -> (&str, Option<&str>) {
    if let Some((repo, rev)) = url.rsplit_once('@') {
        if !rev.contains('/') && !rev.contains(':') && !repo.is_empty() {
            return (repo, Some(rev));
        }
    }
    (url, None)
}

struct VcsRun {
    tool: &'static VcsTool,
    repo: String,
    tag: String,
}

impl VcsRun {
    /// The checkout directory under `wd`: the repo basename with the
    /// index suffix stripped.
    fn local_dir(&self, wd: &Path) -> PathBuf {
        let mut path = self.repo.as_str();
        if let Some(i) = path.find("//") {
            path = &path[i + 2..];
        }
        if let Some(i) = path.find(self.tool.index) {
            path = &path[..i];
        }
        let base = path.rsplit('/').next().unwrap_or(path);
        wd.join(base)
    }

    /// Substitute `$repo`/`$tag` into `cmdline` and run it under `dir`.
    async fn run(
        &self,
        ctx: &Arc<Context>,
        dir: &Path,
        cmdline: &str,
    ) -> Result<String, FetchError> {
        let args: Vec<String> = cmdline
            .split_whitespace()
            .map(|arg| {
                arg.replace("$repo", &self.repo)
                    .replace("$tag", &self.tag)
            })
            .collect();
        trace!(tool = self.tool.cmd, ?args, dir = %dir.display(), "running vcs command");

        let child = tokio::process::Command::new(self.tool.cmd)
            .args(&args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let token = ctx.token();
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            () = token.cancelled() => return Err(FetchError::Cancelled),
        };

        let out = String::from_utf8_lossy(&output.stdout).into_owned();
        let err = String::from_utf8_lossy(&output.stderr).into_owned();
        let sink = ctx.output();
        if !out.is_empty() {
            sink.write(out.as_bytes());
        }
        if !err.is_empty() {
            sink.write(err.as_bytes());
        }

        if !output.status.success() {
            return Err(FetchError::Vcs {
                tool: self.tool.cmd.to_string(),
                cmdline: cmdline.to_string(),
            });
        }
        Ok(out + &err)
    }

    /// Current HEAD of the checkout, if it has one.
    async fn head(&self, ctx: &Arc<Context>, dir: &Path) -> Option<String> {
        if !dir.is_dir() {
            return None;
        }
        self.run(ctx, dir, self.tool.probe_cmd)
            .await
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Clone the repository if the checkout is missing or its index is
    /// corrupt (the probe command fails).
    async fn ensure_repo(
        &self,
        ctx: &Arc<Context>,
        wd: &Path,
        dir: &Path,
    ) -> Result<(), FetchError> {
        let index = dir.join(self.tool.index);
        let healthy =
            index.exists() && self.run(ctx, dir, self.tool.probe_cmd).await.is_ok();
        if healthy {
            return Ok(());
        }
        if dir.exists() {
            debug!(dir = %dir.display(), "checkout is corrupt, recloning");
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(wd)?;
        for cmd in self.tool.create_cmd {
            self.run(ctx, wd, cmd).await?;
        }
        Ok(())
    }

    /// Check out the requested revision, or the default branch when
    /// none was given.
    async fn sync_tag(&self, ctx: &Arc<Context>, dir: &Path) -> Result<(), FetchError> {
        if self.tag.is_empty() {
            for cmd in self.tool.tag_sync_default {
                self.run(ctx, dir, cmd).await?;
            }
            return Ok(());
        }

        let mut matched = false;
        for (cmdline, pattern) in self.tool.tag_lookup {
            let Ok(out) = self.run(ctx, dir, cmdline).await else {
                continue;
            };
            let re = Regex::new(&format!("(?m){pattern}")).expect("tag pattern");
            if re.captures(&out).and_then(|c| c.get(1)).is_some() {
                matched = true;
                break;
            }
        }

        // Neither tag nor branch: treat the revision as a commit
        // prefix and pin it behind a pseudo tag.
        if !matched {
            self.run(ctx, dir, self.tool.tag_new).await?;
        }
        for cmd in self.tool.tag_sync {
            self.run(ctx, dir, cmd).await?;
        }
        Ok(())
    }
}
