//! Stage lifecycle notifier chains.
//!
//! Each stage (and the runbook, for task forces) carries three ordered
//! callback chains: ENTER, EXIT, and RESET. Registration is LIFO at
//! the head or FIFO at the tail; dispatch consumes the chain, so each
//! callback fires at most once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::runbook::RunbookError;

/// A lifecycle callback: `(context, stage-or-task name)`.
pub type Notifier = Arc<dyn Fn(&Context, &str) -> Result<Flow, RunbookError> + Send + Sync>;

/// What a notifier tells the caller to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going.
    Continue,
    /// Stop here; the stage is already taken care of.
    Handled,
}

/// Chain kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// Fired before the task set runs.
    Enter = 0,
    /// Fired after a successful run, and on cache hits.
    Exit = 1,
    /// Fired by explicit reset requests.
    Reset = 2,
}

/// The three chains of one stage.
#[derive(Default)]
pub struct NotifierChain {
    chains: [Mutex<VecDeque<Notifier>>; 3],
}

impl NotifierChain {
    /// An empty chain set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register at the head: the latest registration runs first.
    pub fn register(&self, n: Notifier, kind: NotifyKind) {
        self.chains[kind as usize]
            .lock()
            .expect("notifier chain poisoned")
            .push_front(n);
    }

    /// Register at the tail: runs after everything already queued.
    pub fn register_back(&self, n: Notifier, kind: NotifyKind) {
        self.chains[kind as usize]
            .lock()
            .expect("notifier chain poisoned")
            .push_back(n);
    }

    /// Dispatch the chain of `kind`, removing each callback as it runs.
    /// Stops early on the first error or [`Flow::Handled`].
    ///
    /// # Errors
    ///
    /// The first callback error, with the remaining callbacks left
    /// queued.
    pub fn call(&self, ctx: &Context, kind: NotifyKind, name: &str) -> Result<Flow, RunbookError> {
        loop {
            let next = self.chains[kind as usize]
                .lock()
                .expect("notifier chain poisoned")
                .pop_front();
            let Some(n) = next else {
                return Ok(Flow::Continue);
            };
            if n(ctx, name)? == Flow::Handled {
                return Ok(Flow::Handled);
            }
        }
    }

    /// Number of callbacks queued for `kind`.
    #[must_use]
    pub fn len(&self, kind: NotifyKind) -> usize {
        self.chains[kind as usize]
            .lock()
            .expect("notifier chain poisoned")
            .len()
    }

    /// Whether no callbacks are queued for `kind`.
    #[must_use]
    pub fn is_empty(&self, kind: NotifyKind) -> bool {
        self.len(kind) == 0
    }
}

impl std::fmt::Debug for NotifierChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierChain")
            .field("enter", &self.len(NotifyKind::Enter))
            .field("exit", &self.len(NotifyKind::Exit))
            .field("reset", &self.len(NotifyKind::Reset))
            .finish()
    }
}
