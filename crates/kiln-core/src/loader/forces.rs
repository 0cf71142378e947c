//! The standard task forces installed on every runbook.
//!
//! `cleanall` removes the whole work directory, `printenv` dumps the
//! full context, `cleanstate` drops stage completion markers.

use std::sync::Arc;

use tracing::trace;

use crate::carton::Builder;
use crate::context::Context;
use crate::runbook::{Runbook, RunbookError, Task};

/// Names of the standard task forces.
pub const CLEANALL: &str = "cleanall";
/// See [`CLEANALL`].
pub const PRINTENV: &str = "printenv";
/// See [`CLEANALL`].
pub const CLEANSTATE: &str = "cleanstate";

pub(super) fn install(runbook: &Runbook) {
    if !runbook.has_task_force(CLEANALL) {
        let _ = runbook.add_task_force(CLEANALL, Task::native(cleanall));
    }
    if !runbook.has_task_force(PRINTENV) {
        let _ = runbook.add_task_force(PRINTENV, Task::native(printenv));
    }
    if !runbook.has_task_force(CLEANSTATE) {
        let _ = runbook.add_task_force(CLEANSTATE, Task::native(cleanstate));
    }
}

/// Remove the carton's entire work directory.
async fn cleanall(ctx: Arc<Context>) -> Result<(), RunbookError> {
    let wd = ctx.work_dir();
    if wd.as_os_str().is_empty() {
        return Ok(());
    }
    trace!(owner = %ctx.owner(), dir = %wd.display(), "removing work directory");
    match std::fs::remove_dir_all(&wd) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Emit one `KEY: value` line per context entry.
async fn printenv(ctx: Arc<Context>) -> Result<(), RunbookError> {
    let sink = ctx.output();
    let mut lines = Vec::new();
    ctx.range(|k, v| lines.push(format!("{k:>12}: {v}")));
    for line in lines {
        sink.write_line(&line);
    }
    Ok(())
}

/// Drop the completion markers of every stage in the runbook, or of a
/// single stage named by `target`.
pub(super) fn clean_state(ctx: &Arc<Context>, target: Option<&str>) {
    match target {
        Some(stage) => ctx.stage_reset(stage),
        None => {
            for stage in ctx.carton().runbook().stages() {
                ctx.stage_reset(stage.name());
            }
        }
    }
}

async fn cleanstate(ctx: Arc<Context>) -> Result<(), RunbookError> {
    clean_state(&ctx, None);
    Ok(())
}
