//! In-memory run state.
//!
//! Two tables (cross and native flavor) map provider names to their
//! per-run state: the execution context, and per-stage completion
//! records with rendezvous gates and log sinks.

use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::context::Context;
use crate::runbook::{Flow, Notifier, Runbook};

/// A one-shot event: once opened it stays open, and every waiter past
/// or future proceeds.
#[derive(Debug, Default)]
pub struct Gate {
    open: AtomicBool,
    notify: Notify,
}

impl Gate {
    /// Open the gate, releasing all waiters.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether the gate is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Wait until the gate opens.
    pub async fn wait(&self) {
        loop {
            if self.is_open() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct MetaInner {
    done: bool,
    pending: Vec<Notifier>,
}

/// Completion record of one (carton, stage, flavor).
#[derive(Default)]
pub struct StageMeta {
    inner: Mutex<MetaInner>,
    gate: Gate,
    sink: Mutex<Option<Arc<Mutex<File>>>>,
}

impl StageMeta {
    /// Whether the stage completed during this run.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.lock().expect("meta poisoned").done
    }

    /// Mark completion: release waiters and fire the rendezvous
    /// notifiers queued by [`StageMeta::add_waiter`].
    pub fn set_done(&self, ctx: &Context, stage: &str) {
        let pending = {
            let mut inner = self.inner.lock().expect("meta poisoned");
            inner.done = true;
            std::mem::take(&mut inner.pending)
        };
        trace!(owner = %ctx.owner(), stage, "stage cached into run state");
        for notifier in pending {
            if let Err(e) = notifier(ctx, stage) {
                warn!(stage, error = %e, "rendezvous notifier failed");
            }
        }
        self.gate.open();
    }

    /// Forget completion (explicit reset).
    pub fn clear_done(&self) {
        self.inner.lock().expect("meta poisoned").done = false;
    }

    /// Queue `notifier` for completion. Returns `false` when the stage
    /// is already done, in which case the caller invokes it directly.
    #[must_use]
    pub fn add_waiter(&self, notifier: Notifier) -> bool {
        let mut inner = self.inner.lock().expect("meta poisoned");
        if inner.done {
            return false;
        }
        inner.pending.push(notifier);
        true
    }

    /// Wait for completion.
    pub async fn wait(&self) {
        self.gate.wait().await;
    }

    /// Install the stage's log sink.
    pub fn set_sink(&self, file: File) {
        *self.sink.lock().expect("meta poisoned") = Some(Arc::new(Mutex::new(file)));
    }

    /// The stage's log sink, if open.
    #[must_use]
    pub fn sink(&self) -> Option<Arc<Mutex<File>>> {
        self.sink.lock().expect("meta poisoned").clone()
    }

    /// Close the stage's log sink.
    pub fn take_sink(&self) {
        *self.sink.lock().expect("meta poisoned") = None;
    }
}

/// Per-(carton, flavor) run state.
#[derive(Default)]
pub struct CartonState {
    ctx: Mutex<Option<Arc<Context>>>,
    stages: Mutex<HashMap<String, Arc<StageMeta>>>,
}

impl CartonState {
    /// The carton's context, once built.
    #[must_use]
    pub fn ctx(&self) -> Option<Arc<Context>> {
        self.ctx.lock().expect("state poisoned").clone()
    }

    /// Install the context if none is set yet; returns the winner.
    pub fn init_ctx(&self, ctx: Arc<Context>) -> Arc<Context> {
        let mut slot = self.ctx.lock().expect("state poisoned");
        match slot.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => {
                *slot = Some(Arc::clone(&ctx));
                ctx
            }
        }
    }

    /// Make sure a meta exists for every stage of `runbook`.
    pub fn ensure_stages(&self, runbook: &Runbook) {
        let mut stages = self.stages.lock().expect("state poisoned");
        for stage in runbook.stages() {
            stages.entry(stage.name().to_string()).or_default();
        }
    }

    /// The meta of stage `name`, creating it on demand so waiters can
    /// queue before the runbook is configured.
    #[must_use]
    pub fn stage(&self, name: &str) -> Arc<StageMeta> {
        self.stages
            .lock()
            .expect("state poisoned")
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// The meta of stage `name`, if recorded.
    #[must_use]
    pub fn get_stage(&self, name: &str) -> Option<Arc<StageMeta>> {
        self.stages.lock().expect("state poisoned").get(name).cloned()
    }
}

/// The two per-flavor state tables.
#[derive(Default)]
pub struct States {
    runbooks: [Mutex<HashMap<String, Arc<CartonState>>>; 2],
}

impl States {
    /// The state for `(name, is_native)`, created on first touch.
    /// The boolean reports whether it already existed.
    pub fn load_or_store(&self, name: &str, is_native: bool) -> (Arc<CartonState>, bool) {
        let mut table = self.runbooks[usize::from(is_native)]
            .lock()
            .expect("states poisoned");
        if let Some(state) = table.get(name) {
            return (Arc::clone(state), true);
        }
        let state = Arc::new(CartonState::default());
        table.insert(name.to_string(), Arc::clone(&state));
        (state, false)
    }

    /// The state for `(name, is_native)`, if present.
    #[must_use]
    pub fn get(&self, name: &str, is_native: bool) -> Option<Arc<CartonState>> {
        self.runbooks[usize::from(is_native)]
            .lock()
            .expect("states poisoned")
            .get(name)
            .cloned()
    }

    /// Whether `name` was loaded in either flavor.
    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.get(name, false).is_some() || self.get(name, true).is_some()
    }
}

/// A helper notifier that does nothing; useful as a rendezvous probe.
#[must_use]
pub fn nop_notifier() -> Notifier {
    Arc::new(|_ctx, _name| Ok(Flow::Continue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_releases_past_and_future_waiters() {
        let gate = Arc::new(Gate::default());

        let early = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        gate.open();
        early.await.unwrap();

        // A waiter arriving after the fact returns immediately.
        gate.wait().await;
        assert!(gate.is_open());
    }

    #[test]
    fn test_states_load_or_store_per_flavor() {
        let states = States::default();
        let (_, existed) = states.load_or_store("zlib", false);
        assert!(!existed);
        let (_, existed) = states.load_or_store("zlib", false);
        assert!(existed);
        // The native flavor is a separate slot.
        let (_, existed) = states.load_or_store("zlib", true);
        assert!(!existed);
        assert!(states.is_loaded("zlib"));
    }

    #[test]
    fn test_add_waiter_after_done_reports_false() {
        let meta = StageMeta::default();
        assert!(meta.add_waiter(nop_notifier()));

        let mut inner = meta.inner.lock().unwrap();
        inner.done = true;
        drop(inner);
        assert!(!meta.add_waiter(nop_notifier()));
    }
}
