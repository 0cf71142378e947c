//! The built-in patch task.
//!
//! Every `*.patch` / `*.diff` directly under the work directory is
//! applied in lexicographic order. A source tree that is already a
//! git checkout takes patches with `git am`; anything else is turned
//! into a throwaway repository first so `git apply` lands cleanly and
//! each patch becomes a commit.

use std::process::Stdio;
use std::sync::Arc;

use tracing::trace;

use crate::context::Context;
use crate::runbook::RunbookError;

const PATCH_SCRIPT: &str = r#"
[ -d .git ] && {
    git am --committer-date-is-author-date $PATCHFILE
    exit $?
}

git init
git config user.email "robot@$(hostname)"
git config user.name "robot"
git add -A
git commit -m 'first commit'

git apply $PATCHFILE && {
    git add -A
    git commit -m "apply patch: $(basename $PATCHFILE)"
}
"#;

/// Apply every patch found under the carton's work directory.
///
/// # Errors
///
/// [`RunbookError::TaskFailed`] on the first patch that does not
/// apply, or cancellation.
pub(super) async fn patch(ctx: Arc<Context>) -> Result<(), RunbookError> {
    let wd = ctx.work_dir();
    let Ok(entries) = std::fs::read_dir(&wd) else {
        return Ok(());
    };

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.ends_with(".patch") || n.ends_with(".diff"))
        .collect();
    names.sort();

    let Some((src, _)) = ctx.dir()? else {
        if names.is_empty() {
            return Ok(());
        }
        return Err(RunbookError::TaskFailed(
            "patches present but no source directory to apply them in".to_string(),
        ));
    };

    for name in names {
        if ctx.token().is_cancelled() {
            return Err(RunbookError::Cancelled);
        }
        let file = wd.join(&name);
        trace!(owner = %ctx.owner(), patch = %name, "applying patch");

        let mut child = tokio::process::Command::new("/bin/bash")
            .arg("-c")
            .arg(PATCH_SCRIPT)
            .env("PATCHFILE", &file)
            .current_dir(&src)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let sink = ctx.output();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_pump = tokio::spawn(pump(stdout, sink.clone()));
        let err_pump = tokio::spawn(pump(stderr, sink));

        let token = ctx.token();
        let status = tokio::select! {
            status = child.wait() => status?,
            () = token.cancelled() => {
                let _ = child.kill().await;
                return Err(RunbookError::Cancelled);
            }
        };
        let _ = tokio::join!(out_pump, err_pump);

        if !status.success() {
            return Err(RunbookError::TaskFailed(format!(
                "patch {name} failed with exit code {}",
                status.code().unwrap_or(-1)
            )));
        }
    }
    Ok(())
}

async fn pump(
    reader: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    sink: crate::context::OutputSink,
) {
    use tokio::io::AsyncReadExt;
    let Some(mut reader) = reader else { return };
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.write(&buf[..n]),
        }
    }
}
