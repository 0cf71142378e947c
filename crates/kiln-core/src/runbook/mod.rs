//! Runbooks: ordered stage sequences plus detachable task forces.
//!
//! Every carton owns one runbook. Recipes assemble it with the
//! insertion API (`push_front`, `push_back`, and `insert_before` /
//! `insert_after` on an existing stage); the loader then drives it
//! stage by stage. Task forces sit outside the stage sequence and run
//! on demand, skipping all stage machinery.

pub mod notifier;
pub mod stage;
pub mod task;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

pub use notifier::{Flow, Notifier, NotifierChain, NotifyKind};
pub use stage::{Stage, StageDep, DEFAULT_DEP_STAGE};
pub use task::{ScriptTask, Task, TaskKey, TaskSet};

use crate::context::{Context, ContextError};
use crate::fetch::FetchError;

/// Runbook-level failure.
#[derive(Debug, thiserror::Error)]
pub enum RunbookError {
    /// A task key was registered twice.
    #[error("task {0} already added")]
    TaskAdded(String),

    /// No task force or independent task under that name.
    #[error("unknown task {0}")]
    UnknownTask(String),

    /// No stage under that name.
    #[error("unknown stage {0}")]
    UnknownStage(String),

    /// A shell task exited non-zero.
    #[error("task {task} of {owner} failed with exit code {code}")]
    ScriptFailed {
        /// Owning carton.
        owner: String,
        /// Task routine name.
        task: String,
        /// Exit code.
        code: i32,
    },

    /// A stage overran the configured timeout.
    #[error("runbook expired on {owner}@{stage} over {secs} seconds")]
    Expired {
        /// Owning carton.
        owner: String,
        /// Stage that overran.
        stage: String,
        /// The timeout that was exceeded.
        secs: u64,
    },

    /// The run was cancelled.
    #[error("runbook cancelled")]
    Cancelled,

    /// A native task failed.
    #[error("{0}")]
    TaskFailed(String),

    /// Fetch-engine failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Carton lookup failure.
    #[error(transparent)]
    Carton(#[from] crate::carton::CartonError),

    /// Context failure.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A named single-task unit outside the stage sequence.
pub struct TaskForce {
    name: String,
    task: Task,
    deps: Mutex<Vec<StageDep>>,
}

impl TaskForce {
    /// The task force's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a cross-runbook dependency.
    pub fn depends_on(&self, spec: impl Into<String>, notifier: Option<Notifier>) -> &Self {
        self.deps.lock().expect("taskforce poisoned").push(StageDep {
            spec: spec.into(),
            notifier,
        });
        self
    }

    fn dependencies(&self) -> Vec<StageDep> {
        self.deps.lock().expect("taskforce poisoned").clone()
    }
}

impl std::fmt::Debug for TaskForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskForce").field("name", &self.name).finish()
    }
}

/// Stage and task-force inventory of a runbook, for display.
#[derive(Debug, Clone)]
pub struct RunbookInfo {
    /// `(stage name, task count)` in play order.
    pub stages: Vec<(String, usize)>,
    /// Task-force names.
    pub forces: Vec<String>,
}

/// The ordered stage sequence of one carton.
pub struct Runbook {
    stages: Mutex<Vec<Arc<Stage>>>,
    forces: Mutex<HashMap<String, Arc<TaskForce>>>,
    notifiers: NotifierChain,
}

impl Runbook {
    /// An empty runbook.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stages: Mutex::new(Vec::new()),
            forces: Mutex::new(HashMap::new()),
            notifiers: NotifierChain::new(),
        })
    }

    /// Append a new stage at the end.
    #[must_use]
    pub fn push_back(self: &Arc<Self>, name: &str) -> Arc<Stage> {
        let stage = Stage::new(name, Arc::downgrade(self));
        self.stages
            .lock()
            .expect("runbook poisoned")
            .push(Arc::clone(&stage));
        stage
    }

    /// Prepend a new stage at the front.
    #[must_use]
    pub fn push_front(self: &Arc<Self>, name: &str) -> Arc<Stage> {
        let stage = Stage::new(name, Arc::downgrade(self));
        self.stages
            .lock()
            .expect("runbook poisoned")
            .insert(0, Arc::clone(&stage));
        stage
    }

    pub(crate) fn insert_near(
        self: &Arc<Self>,
        anchor: &Arc<Stage>,
        name: &str,
        after: bool,
    ) -> Arc<Stage> {
        let stage = Stage::new(name, Arc::downgrade(self));
        let mut stages = self.stages.lock().expect("runbook poisoned");
        let pos = stages
            .iter()
            .position(|s| Arc::ptr_eq(s, anchor))
            .expect("anchor stage not in runbook");
        let at = if after { pos + 1 } else { pos };
        stages.insert(at, Arc::clone(&stage));
        stage
    }

    /// Find the stage named `name`.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<Arc<Stage>> {
        self.stages
            .lock()
            .expect("runbook poisoned")
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// The first stage.
    #[must_use]
    pub fn head(&self) -> Option<Arc<Stage>> {
        self.stages.lock().expect("runbook poisoned").first().cloned()
    }

    /// Snapshot of the stage sequence.
    #[must_use]
    pub fn stages(&self) -> Vec<Arc<Stage>> {
        self.stages.lock().expect("runbook poisoned").clone()
    }

    /// The stage after `stage`, if any.
    #[must_use]
    pub fn next_of(&self, stage: &Arc<Stage>) -> Option<Arc<Stage>> {
        let stages = self.stages.lock().expect("runbook poisoned");
        let pos = stages.iter().position(|s| Arc::ptr_eq(s, stage))?;
        stages.get(pos + 1).cloned()
    }

    /// Every stage strictly after the one named `name`.
    #[must_use]
    pub fn stages_after(&self, name: &str) -> Vec<Arc<Stage>> {
        let stages = self.stages.lock().expect("runbook poisoned");
        match stages.iter().position(|s| s.name() == name) {
            Some(pos) => stages[pos + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Install a task force under `name`.
    pub fn add_task_force(&self, name: &str, task: Task) -> Arc<TaskForce> {
        let force = Arc::new(TaskForce {
            name: name.to_string(),
            task,
            deps: Mutex::new(Vec::new()),
        });
        self.forces
            .lock()
            .expect("runbook poisoned")
            .insert(name.to_string(), Arc::clone(&force));
        force
    }

    /// The task force named `name`, if any.
    #[must_use]
    pub fn task_force(&self, name: &str) -> Option<Arc<TaskForce>> {
        self.forces.lock().expect("runbook poisoned").get(name).cloned()
    }

    /// Whether a task force named `name` exists.
    #[must_use]
    pub fn has_task_force(&self, name: &str) -> bool {
        self.forces.lock().expect("runbook poisoned").contains_key(name)
    }

    /// Register a runbook-level notifier (fired around task forces).
    pub fn register_notifier(&self, n: Notifier, kind: NotifyKind) {
        self.notifiers.register(n, kind);
    }

    /// Stage names with task counts plus task-force names.
    #[must_use]
    pub fn info(&self) -> RunbookInfo {
        let stages = self
            .stages
            .lock()
            .expect("runbook poisoned")
            .iter()
            .map(|s| (s.name().to_string(), s.tasks().len()))
            .collect();
        let forces = self
            .forces
            .lock()
            .expect("runbook poisoned")
            .keys()
            .cloned()
            .collect();
        RunbookInfo { stages, forces }
    }

    /// Play every stage in order, stopping after `until` when given.
    ///
    /// # Errors
    ///
    /// The first stage error aborts the iteration.
    pub async fn range(&self, ctx: &Arc<Context>, until: Option<&str>) -> Result<(), RunbookError> {
        for stage in self.stages() {
            stage.play(ctx).await?;
            if Some(stage.name()) == until {
                return Ok(());
            }
        }
        if let Some(name) = until {
            if self.stage(name).is_none() && !self.has_task_force(name) {
                return Err(RunbookError::UnknownStage(name.to_string()));
            }
        }
        Ok(())
    }

    /// Play a single stage, or run the task force of that name.
    ///
    /// # Errors
    ///
    /// [`RunbookError::UnknownTask`] when neither exists; otherwise
    /// whatever the stage or force returns.
    pub async fn play(&self, ctx: &Arc<Context>, name: &str) -> Result<(), RunbookError> {
        if let Some(stage) = self.stage(name) {
            return stage.play(ctx).await;
        }
        self.run_force(ctx, name).await
    }

    async fn run_force(&self, ctx: &Arc<Context>, name: &str) -> Result<(), RunbookError> {
        let Some(force) = self.task_force(name) else {
            return Err(RunbookError::UnknownTask(name.to_string()));
        };

        if self.notifiers.call(ctx, NotifyKind::Enter, name)? == Flow::Handled {
            return Ok(());
        }
        for dep in force.dependencies() {
            let (dep_name, dep_stage) = dep.parse();
            ctx.wait(dep_name, dep_stage, dep.notifier.clone()).await?;
        }
        ctx.set_stage(name);
        ctx.acquire().await?;
        let result = force_run(&force.task, ctx).await;
        ctx.release();
        result
    }
}

async fn force_run(task: &Task, ctx: &Arc<Context>) -> Result<(), RunbookError> {
    match task {
        Task::Native(f) => f(Arc::clone(ctx)).await,
        Task::Script(_) => {
            // Script forces reuse the task-set dispatch so routine
            // handling stays in one place.
            let set = TaskSet::new("force");
            set.add(TaskKey::Name(ctx.current_stage()), task.clone())?;
            set.play(ctx).await
        }
    }
}

impl std::fmt::Debug for Runbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info();
        f.debug_struct("Runbook")
            .field("stages", &info.stages)
            .field("forces", &info.forces)
            .finish()
    }
}
