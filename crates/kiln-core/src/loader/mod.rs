//! The loader: kiln's top-level scheduler.
//!
//! One loader executes one build request. It walks the dependency
//! graph by scheduling cartons onto a channel, spawns a worker per
//! scheduled carton, enforces cross-runbook rendezvous, throttles task
//! sets through the slot pool, and captures the first failure while
//! cancelling everything else. A lockfile keeps concurrent loaders
//! out of the same build directory.

mod forces;
mod notifiers;
pub mod paths;
mod patch;
pub mod state;
mod sysroot;

use std::collections::HashSet;
use std::fs::File;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub use forces::{CLEANALL, CLEANSTATE, PRINTENV};
use state::{StageMeta, States};

use crate::carton::{Builder, CartonError, Inventory, PATCH, SYSROOT};
use crate::context::{Context, ContextError};
use crate::pool::Pool;
use crate::runbook::{Notifier, Runbook, RunbookError, StageDep, Task};
use crate::settings::{keys, Settings};

/// Loader-level failure.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Another loader holds the build directory.
    #[error("another instance of {tool} is running")]
    Busy {
        /// The tool name on the lockfile.
        tool: String,
    },

    /// Inventory lookup failure.
    #[error(transparent)]
    Carton(#[from] CartonError),

    /// Context failure outside any carton run.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The first carton failure of the run, with its log transcript.
    #[error("\n❯❯❯❯❯❯❯❯❯❯❯❯  {carton}\n{source}{}", format_log(.log))]
    Failed {
        /// The carton that failed.
        carton: String,
        /// Captured stderr/stdout transcript.
        log: String,
        /// The underlying error.
        source: RunbookError,
    },

    /// The run was cancelled before any carton failed.
    #[error("load cancelled")]
    Cancelled,

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn format_log(log: &str) -> String {
    if log.is_empty() {
        String::new()
    } else {
        format!("\n\nError log: ↡\n{log}")
    }
}

/// One slot of the loader pool: an index plus the capture buffer that
/// collects task output for the failure banner.
pub struct LoadSlot {
    /// Slot index.
    pub index: usize,
    /// Shared capture buffer.
    pub buf: Arc<Mutex<Vec<u8>>>,
}

#[derive(Debug)]
struct Sched {
    name: String,
    target: Option<String>,
    is_native: bool,
    nodeps: bool,
    force: bool,
}

/// The scheduler.
pub struct Loader {
    settings: Arc<Settings>,
    inventory: Arc<Inventory>,
    pool: Pool<LoadSlot>,
    states: States,
    token: CancellationToken,
    configured: Mutex<HashSet<String>>,
    scheduled: Mutex<HashSet<(String, bool)>>,
    error: Mutex<Option<LoadError>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Sched>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Sched>>>,
    refs: AtomicI64,
    lockfile: PathBuf,
    _lock: File,
    signal_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Loader {
    /// Build a loader named `tool` over a frozen inventory.
    ///
    /// Acquires the lockfile `BUILDIR/<tool>.lockfile`, sizes the slot
    /// pool from `MAXLOADERS`, installs a SIGINT/SIGTERM handler that
    /// cancels the run, and makes sure the download and image
    /// directories exist.
    ///
    /// # Errors
    ///
    /// [`LoadError::Busy`] when another instance holds the build
    /// directory, or I/O failure while preparing it.
    pub fn new(
        settings: Arc<Settings>,
        inventory: Arc<Inventory>,
        tool: &str,
    ) -> Result<Arc<Self>, LoadError> {
        let buildir = settings.dir(keys::BUILDIR);
        std::fs::create_dir_all(&buildir)?;

        let lockfile = buildir.join(format!("{tool}.lockfile"));
        if lockfile.exists() {
            return Err(LoadError::Busy {
                tool: tool.to_string(),
            });
        }
        let lock = File::create(&lockfile)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(LoadError::Busy {
                tool: tool.to_string(),
            });
        }

        std::fs::create_dir_all(settings.dir(keys::DLDIR))?;
        std::fs::create_dir_all(settings.dir(keys::IMAGEDIR))?;

        let loaders = settings.max_loaders();
        let pool = Pool::new(loaders, |index| LoadSlot {
            index,
            buf: Arc::new(Mutex::new(Vec::new())),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let loader = Arc::new(Self {
            settings,
            inventory,
            pool,
            states: States::default(),
            token: token.clone(),
            configured: Mutex::new(HashSet::new()),
            scheduled: Mutex::new(HashSet::new()),
            error: Mutex::new(None),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            refs: AtomicI64::new(0),
            lockfile,
            _lock: lock,
            signal_task: Mutex::new(None),
        });

        let handle = tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let (Ok(mut int), Ok(mut term)) = (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) else {
                return;
            };
            tokio::select! {
                _ = int.recv() => {}
                _ = term.recv() => {}
            }
            trace!("cancelling loader on signal");
            token.cancel();
        });
        *loader.signal_task.lock().expect("loader poisoned") = Some(handle);

        Ok(loader)
    }

    /// The global settings.
    #[must_use]
    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// The frozen inventory.
    #[must_use]
    pub fn inventory(&self) -> Arc<Inventory> {
        Arc::clone(&self.inventory)
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The slot pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<LoadSlot> {
        &self.pool
    }

    /// Cancel the run.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether `(carton, stage, flavor)` completed during this run.
    #[must_use]
    pub fn is_stage_loaded(&self, carton: &str, stage: &str, is_native: bool) -> bool {
        self.states
            .get(carton, is_native)
            .and_then(|state| state.get_stage(stage))
            .is_some_and(|meta| meta.is_done())
    }

    /// The completion record of `(carton, stage, flavor)`.
    #[must_use]
    pub fn stage_meta(
        &self,
        carton: &str,
        stage: &str,
        is_native: bool,
    ) -> Option<Arc<StageMeta>> {
        self.states
            .get(carton, is_native)
            .map(|state| state.stage(stage))
    }

    /// Execute a build request: each entry is `carton[@target]`.
    ///
    /// With `nodeps` only the named cartons run; a task-force target
    /// implies `nodeps` for its entry. With `force` every stage marker
    /// of the named cartons is dropped first.
    ///
    /// Consumes the loader's schedule; call once per loader.
    ///
    /// # Errors
    ///
    /// The first failure of the run.
    ///
    /// # Panics
    ///
    /// Panics when called twice on one loader.
    pub async fn run(
        self: &Arc<Self>,
        cartons: &[String],
        nodeps: bool,
        force: bool,
    ) -> Result<(), LoadError> {
        for arg in cartons {
            let (name, target) = match arg.rsplit_once('@') {
                Some((name, target)) if !name.is_empty() => (name, Some(target.to_string())),
                _ => (arg.as_str(), None),
            };

            let found = match self.inventory.find(name) {
                Ok(found) => found,
                Err(e) => {
                    self.capture(name, String::new(), e.into());
                    continue;
                }
            };

            // Configure the runbook up front so a task-force target is
            // recognizable before scheduling decides on dependencies.
            match self.inventory.resolve(name) {
                Ok(real) => self.setup_runbook(real.provider(), &real.runbook()),
                Err(e) => {
                    self.capture(name, String::new(), e.into());
                    continue;
                }
            }
            let nodeps_entry = nodeps
                || target
                    .as_deref()
                    .is_some_and(|t| found.builder.runbook().has_task_force(t));

            self.schedule(
                found.builder.provider(),
                found.is_native,
                target,
                nodeps_entry,
                force,
            );
        }

        if self.refs.load(Ordering::SeqCst) == 0 {
            self.tx.lock().expect("loader poisoned").take();
        }

        let mut rx = self
            .rx
            .lock()
            .expect("loader poisoned")
            .take()
            .expect("Loader::run may only be called once");

        let mut workers = JoinSet::new();
        while let Some(sched) = rx.recv().await {
            let loader = Arc::clone(self);
            workers.spawn(async move { loader.carton_worker(sched).await });
        }
        while workers.join_next().await.is_some() {}

        match self.error.lock().expect("loader poisoned").take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Enqueue `(name, flavor)` unless it is already scheduled.
    fn schedule(
        &self,
        name: &str,
        is_native: bool,
        target: Option<String>,
        nodeps: bool,
        force: bool,
    ) -> bool {
        {
            let mut scheduled = self.scheduled.lock().expect("loader poisoned");
            if !scheduled.insert((name.to_string(), is_native)) {
                return false;
            }
        }
        debug!(carton = name, is_native, "scheduling");
        self.refs.fetch_add(1, Ordering::SeqCst);
        let tx = self.tx.lock().expect("loader poisoned");
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(Sched {
                name: name.to_string(),
                target,
                is_native,
                nodeps,
                force,
            });
        }
        true
    }

    /// One worker completed; the last one out closes the channel.
    fn ref_put(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tx.lock().expect("loader poisoned").take();
        }
    }

    async fn carton_worker(self: Arc<Self>, sched: Sched) {
        if let Err((ctx, err)) = self.run_one(&sched).await {
            let log = ctx.map(|c| c.err_log()).unwrap_or_default();
            self.capture(&sched.name, log, err);
        }
        self.ref_put();
    }

    /// Record the run's first error and cancel the rest; later errors
    /// are dropped.
    fn capture(&self, carton: &str, log: String, err: RunbookError) {
        let mut slot = self.error.lock().expect("loader poisoned");
        if slot.is_none() {
            *slot = Some(LoadError::Failed {
                carton: carton.to_string(),
                log,
                source: err,
            });
            self.token.cancel();
        } else {
            trace!(carton, error = %err, "suppressing follow-up error");
        }
    }

    #[allow(clippy::type_complexity)]
    async fn run_one(
        self: &Arc<Self>,
        sched: &Sched,
    ) -> Result<(), (Option<Arc<Context>>, RunbookError)> {
        let found = self
            .inventory
            .find(&sched.name)
            .map_err(|e| (None, e.into()))?;
        let is_native = sched.is_native || found.is_native;

        // Runbooks are configured on the real carton, never the link.
        let real = self
            .inventory
            .resolve(&sched.name)
            .map_err(|e| (None, e.into()))?;
        self.setup_runbook(real.provider(), &real.runbook());

        let (state, _) = self.states.load_or_store(found.builder.provider(), is_native);
        state.ensure_stages(&found.builder.runbook());

        let ctx = match state.ctx() {
            Some(ctx) => ctx,
            None => {
                let ctx = Context::new(
                    Arc::clone(self),
                    Arc::clone(&found.builder),
                    is_native,
                    sched.nodeps,
                )
                .map_err(|e| (None, e.into()))?;
                state.init_ctx(ctx)
            }
        };

        self.drive(&ctx, sched).await.map_err(|e| (Some(ctx), e))
    }

    async fn drive(
        self: &Arc<Self>,
        ctx: &Arc<Context>,
        sched: &Sched,
    ) -> Result<(), RunbookError> {
        ctx.mkdirs()?;
        if sched.force {
            forces::clean_state(ctx, None);
        }

        if !sched.nodeps {
            let carton = ctx.carton();
            let mut deps = carton.build_depends();
            deps.extend(carton.depends());
            let mut seen = HashSet::new();
            deps.retain(|d| seen.insert(d.clone()));

            // Schedule everything first so the graph fans out, then
            // block on each completion gate.
            let mut pending = Vec::with_capacity(deps.len());
            for dep in deps {
                let sd = StageDep {
                    spec: dep,
                    notifier: None,
                };
                let (name, stage) = sd.parse();
                pending.push(self.begin_wait(name, stage, ctx.is_native(), None)?);
            }
            for wait in pending {
                wait.await?;
            }
        }

        let runbook = ctx.carton().runbook();
        match &sched.target {
            Some(target) if sched.nodeps => runbook.play(ctx, target).await,
            other => runbook.range(ctx, other.as_deref()).await,
        }
    }

    /// Start waiting for `stage` of `name`: schedule the carton if
    /// nothing has yet, queue the rendezvous notifier, and hand back a
    /// future that resolves when the stage completes.
    ///
    /// # Errors
    ///
    /// Inventory miss.
    pub fn begin_wait(
        self: &Arc<Self>,
        name: &str,
        stage: &str,
        is_native: bool,
        notifier: Option<Notifier>,
    ) -> Result<impl Future<Output = Result<(), RunbookError>>, RunbookError> {
        let found = self.inventory.find(name)?;
        let native = is_native || found.is_native;
        let provider = found.builder.provider().to_string();

        let (state, _) = self.states.load_or_store(&provider, native);
        let meta = state.stage(stage);

        if let Some(notifier) = notifier {
            if !meta.add_waiter(Arc::clone(&notifier)) {
                // Completed before we got here; fire it now.
                if let Some(ctx) = state.ctx() {
                    if let Err(e) = notifier(&ctx, stage) {
                        warn!(stage, error = %e, "rendezvous notifier failed");
                    }
                }
            }
        }

        self.schedule(&provider, native, None, false, false);

        let token = self.token.clone();
        Ok(async move {
            tokio::select! {
                () = meta.wait() => Ok(()),
                () = token.cancelled() => Err(RunbookError::Cancelled),
            }
        })
    }

    /// Attach the loader's standard machinery to a runbook, once per
    /// carton: the patch task, the sysroot task where a `sysroot`
    /// stage exists, the standard task forces, and the notifier chain.
    fn setup_runbook(&self, name: &str, runbook: &Arc<Runbook>) {
        {
            let mut configured = self.configured.lock().expect("loader poisoned");
            if !configured.insert(name.to_string()) {
                return;
            }
        }

        if let Some(stage) = runbook.stage(PATCH) {
            let _ = stage.add_task(0, Task::native(patch::patch));
        }
        if let Some(stage) = runbook.stage(SYSROOT) {
            let _ = stage.add_task(0, Task::native(sysroot::prepare_sysroot));
        }
        forces::install(runbook);
        notifiers::register(runbook);
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        if let Some(handle) = self.signal_task.lock().expect("loader poisoned").take() {
            handle.abort();
        }
        let _ = fs2::FileExt::unlock(&self._lock);
        let _ = std::fs::remove_file(&self.lockfile);
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("lockfile", &self.lockfile)
            .field("slots", &self.pool.available())
            .finish()
    }
}
