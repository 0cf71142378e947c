//! A named execution step within a runbook.
//!
//! A stage owns a task set, may declare dependencies on stages of
//! other runbooks, and carries the ENTER/EXIT/RESET notifier chains.
//! It plays at most once per (carton, native-flavor) pair per run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use super::notifier::{Flow, Notifier, NotifierChain, NotifyKind};
use super::task::{Task, TaskKey, TaskSet};
use super::{Runbook, RunbookError};
use crate::context::Context;

/// Default stage a bare dependency name waits on.
pub const DEFAULT_DEP_STAGE: &str = "package";

/// A cross-runbook dependency declaration.
#[derive(Clone)]
pub struct StageDep {
    /// `name` or `name@stage`.
    pub spec: String,
    /// Invoked when the dependency stage completes, fresh or cached.
    pub notifier: Option<Notifier>,
}

impl StageDep {
    /// Split into `(carton, stage)`, the stage defaulting to
    /// [`DEFAULT_DEP_STAGE`].
    #[must_use]
    pub fn parse(&self) -> (&str, &str) {
        match self.spec.rsplit_once('@') {
            Some((name, stage)) if !name.is_empty() => (name, stage),
            _ => (&self.spec, DEFAULT_DEP_STAGE),
        }
    }
}

impl std::fmt::Debug for StageDep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDep").field("spec", &self.spec).finish()
    }
}

/// One stage.
pub struct Stage {
    name: String,
    summary: Mutex<String>,
    tasks: TaskSet,
    runbook: Weak<Runbook>,
    disabled: AtomicBool,
    dir: Mutex<Option<PathBuf>>,
    deps: Mutex<Vec<StageDep>>,
    notifiers: NotifierChain,
    /// Played-once guard, indexed by native flavor.
    played: [AtomicBool; 2],
    play_lock: tokio::sync::Mutex<()>,
}

impl Stage {
    pub(super) fn new(name: &str, runbook: Weak<Runbook>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            summary: Mutex::new(String::new()),
            tasks: TaskSet::new(name),
            runbook,
            disabled: AtomicBool::new(false),
            dir: Mutex::new(None),
            deps: Mutex::new(Vec::new()),
            notifiers: NotifierChain::new(),
            played: [AtomicBool::new(false), AtomicBool::new(false)],
            play_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the one-line help text.
    pub fn set_summary(&self, summary: impl Into<String>) -> &Self {
        *self.summary.lock().expect("stage poisoned") = summary.into();
        self
    }

    /// The one-line help text.
    #[must_use]
    pub fn summary(&self) -> String {
        self.summary.lock().expect("stage poisoned").clone()
    }

    /// The enclosing runbook.
    ///
    /// # Panics
    ///
    /// Panics if the runbook was dropped; stages do not outlive their
    /// runbook.
    #[must_use]
    pub fn runbook(&self) -> Arc<Runbook> {
        self.runbook.upgrade().expect("stage outlived its runbook")
    }

    /// The stage's task set.
    #[must_use]
    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    /// Add a task; returns the stage for chaining.
    ///
    /// # Errors
    ///
    /// [`RunbookError::TaskAdded`] if the key is taken.
    pub fn add_task(
        self: &Arc<Self>,
        key: impl Into<TaskKey>,
        task: Task,
    ) -> Result<Arc<Self>, RunbookError> {
        self.tasks.add(key, task)?;
        Ok(Arc::clone(self))
    }

    /// Remove the task under `key`.
    pub fn del_task(&self, key: impl Into<TaskKey>) {
        self.tasks.del(key);
    }

    /// Insert a new stage right after this one.
    #[must_use]
    pub fn insert_after(self: &Arc<Self>, name: &str) -> Arc<Stage> {
        self.runbook().insert_near(self, name, true)
    }

    /// Insert a new stage right before this one.
    #[must_use]
    pub fn insert_before(self: &Arc<Self>, name: &str) -> Arc<Stage> {
        self.runbook().insert_near(self, name, false)
    }

    /// The stage after this one, if any.
    #[must_use]
    pub fn next(self: &Arc<Self>) -> Option<Arc<Stage>> {
        self.runbook().next_of(self)
    }

    /// Mark the stage disabled: it plays as a no-op.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    /// Whether the stage is disabled.
    #[must_use]
    pub fn disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Override the working directory script tasks run in.
    pub fn set_dir(&self, dir: impl Into<PathBuf>) {
        *self.dir.lock().expect("stage poisoned") = Some(dir.into());
    }

    /// The working-directory override, if set.
    #[must_use]
    pub fn dir(&self) -> Option<PathBuf> {
        self.dir.lock().expect("stage poisoned").clone()
    }

    /// Declare that this stage requires `spec` (`name[@stage]`) of
    /// another runbook, optionally with a completion notifier.
    pub fn depends_on(&self, spec: impl Into<String>, notifier: Option<Notifier>) -> &Self {
        self.deps.lock().expect("stage poisoned").push(StageDep {
            spec: spec.into(),
            notifier,
        });
        self
    }

    /// The declared cross-runbook dependencies.
    #[must_use]
    pub fn dependencies(&self) -> Vec<StageDep> {
        self.deps.lock().expect("stage poisoned").clone()
    }

    /// Register a notifier at the chain head.
    pub fn register_notifier(&self, n: Notifier, kind: NotifyKind) {
        self.notifiers.register(n, kind);
    }

    /// Register a notifier at the chain tail.
    pub fn register_notifier_back(&self, n: Notifier, kind: NotifyKind) {
        self.notifiers.register_back(n, kind);
    }

    /// Whether this flavor already played during this run.
    #[must_use]
    pub fn played(&self, is_native: bool) -> bool {
        self.played[usize::from(is_native)].load(Ordering::SeqCst)
    }

    /// Clear the played guard, drop the completion record, and fire
    /// the RESET chain.
    ///
    /// # Errors
    ///
    /// The first RESET notifier error.
    pub fn reset(&self, ctx: &Context) -> Result<(), RunbookError> {
        self.played[0].store(false, Ordering::SeqCst);
        self.played[1].store(false, Ordering::SeqCst);
        ctx.stage_reset(&self.name);
        self.notifiers.call(ctx, NotifyKind::Reset, &self.name)?;
        Ok(())
    }

    /// Play the stage: wait for declared dependencies, fire ENTER,
    /// run the task set under a pool slot, fire EXIT.
    ///
    /// A disabled stage and a replay are no-ops. An ENTER notifier
    /// answering [`Flow::Handled`] (the cached-marker short circuit)
    /// still transitions the stage to completion, so EXIT fires.
    ///
    /// # Errors
    ///
    /// Dependency, notifier, task, timeout, or cancellation errors.
    pub async fn play(self: &Arc<Self>, ctx: &Arc<Context>) -> Result<(), RunbookError> {
        if self.disabled() {
            trace!(stage = %self.name, "disabled, skipping");
            return Ok(());
        }
        let flavor = usize::from(ctx.is_native());
        if self.played[flavor].load(Ordering::SeqCst) {
            return Ok(());
        }

        let _guard = self.play_lock.lock().await;
        if self.played[flavor].load(Ordering::SeqCst) {
            return Ok(());
        }

        for dep in self.dependencies() {
            let (name, stage) = dep.parse();
            ctx.wait(name, stage, dep.notifier.clone()).await?;
        }

        trace!(owner = %ctx.owner(), stage = %self.name, "entering stage");
        ctx.set_stage(&self.name);
        if self.notifiers.call(ctx, NotifyKind::Enter, &self.name)? == Flow::Handled {
            self.played[flavor].store(true, Ordering::SeqCst);
            self.notifiers.call(ctx, NotifyKind::Exit, &self.name)?;
            ctx.stage_complete(&self.name);
            return Ok(());
        }

        ctx.acquire().await?;
        let played = tokio::time::timeout(ctx.timeout(), self.tasks.play(ctx)).await;
        let result = match played {
            Ok(inner) => inner,
            Err(_) => Err(RunbookError::Expired {
                owner: ctx.owner(),
                stage: self.name.clone(),
                secs: ctx.timeout().as_secs(),
            }),
        };
        if result.is_err() {
            ctx.capture_err_log();
        }
        ctx.release();
        result?;

        self.notifiers.call(ctx, NotifyKind::Exit, &self.name)?;
        self.played[flavor].store(true, Ordering::SeqCst);
        ctx.stage_complete(&self.name);
        Ok(())
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("tasks", &self.tasks.len())
            .field("disabled", &self.disabled())
            .finish()
    }
}
