//! The standard notifier chain the loader installs on every runbook.
//!
//! ENTER opens the stage log, short-circuits cached stages, and drops
//! stale follower markers when a stage is about to run fresh; EXIT
//! closes the log and infers `S` after fetch. Marker persistence and
//! rendezvous release live on the stage-completion path itself, not
//! in a consumable chain. The runbook gets a task-force ENTER hook
//! guarding `clean`.

use std::sync::Arc;

use tracing::trace;

use crate::carton::{Builder, FETCH};
use crate::context::Context;
use crate::runbook::{Flow, Notifier, NotifyKind, Runbook, RunbookError};

/// Install the standard chain on every stage of `runbook`, plus the
/// runbook-level task-force guard.
pub(super) fn register(runbook: &Runbook) {
    for stage in runbook.stages() {
        let is_fetch = stage.name() == FETCH;

        // Always play fetch so it can detect source changes; every
        // other stage short-circuits on a marker from a prior run.
        if !is_fetch {
            stage.register_notifier_back(stage_cached(), NotifyKind::Enter);
            stage.register_notifier_back(invalidate_followers(), NotifyKind::Enter);
        }
        stage.register_notifier_back(logfile_enter(), NotifyKind::Enter);

        stage.register_notifier_back(logfile_exit(), NotifyKind::Exit);
        if is_fetch {
            stage.register_notifier_back(infer_src_dir(), NotifyKind::Exit);
        }
    }

    runbook.register_notifier(clean_guard(), NotifyKind::Enter);
}

/// ENTER: skip a stage whose marker survived from a prior run.
fn stage_cached() -> Notifier {
    Arc::new(|ctx: &Context, stage: &str| {
        if ctx.staged(stage) {
            trace!(owner = %ctx.owner(), stage, "was executed last time, skip it");
            return Ok(Flow::Handled);
        }
        Ok(Flow::Continue)
    })
}

/// ENTER, after a cache miss: the stage is about to run fresh, so
/// every later stage's marker describes output of stale input.
fn invalidate_followers() -> Notifier {
    Arc::new(|ctx: &Context, stage: &str| {
        for later in ctx.carton().runbook().stages_after(stage) {
            ctx.stage_reset(later.name());
        }
        Ok(Flow::Continue)
    })
}

/// ENTER: open `T/<stage>.log` and register it as the stage sink.
fn logfile_enter() -> Notifier {
    Arc::new(|ctx: &Context, stage: &str| {
        let temp = ctx.temp_dir();
        std::fs::create_dir_all(&temp)?;
        let logfile = temp.join(format!("{stage}.log"));
        let file = std::fs::File::create(&logfile).map_err(|_| {
            RunbookError::TaskFailed(format!("failed to create {}", logfile.display()))
        })?;
        if let Some(meta) = ctx.stage_meta(stage) {
            meta.set_sink(file);
        }
        Ok(Flow::Continue)
    })
}

/// EXIT: close the stage log.
fn logfile_exit() -> Notifier {
    Arc::new(|ctx: &Context, stage: &str| {
        if let Some(meta) = ctx.stage_meta(stage) {
            meta.take_sink();
        }
        Ok(Flow::Continue)
    })
}

/// EXIT on fetch: with `S` still unset, infer it from the work
/// directory now that sources are in place.
fn infer_src_dir() -> Notifier {
    Arc::new(|ctx: &Context, _stage: &str| {
        if ctx.get("S").is_some() {
            return Ok(Flow::Continue);
        }
        match ctx.dir()? {
            Some((src, _)) => {
                ctx.set("S", src.display().to_string());
                Ok(Flow::Continue)
            }
            None => Err(RunbookError::TaskFailed(
                "failed to find the source directory automatically; set it explicitly".to_string(),
            )),
        }
    })
}

/// Task-force ENTER: `clean` is pointless without a build directory.
fn clean_guard() -> Notifier {
    Arc::new(|ctx: &Context, task: &str| {
        if task != "clean" {
            return Ok(Flow::Continue);
        }
        match ctx.dir()? {
            Some((_, build)) if build.is_dir() => Ok(Flow::Continue),
            _ => {
                trace!(owner = %ctx.owner(), "no build directory, skipping clean");
                Ok(Flow::Handled)
            }
        }
    })
}
