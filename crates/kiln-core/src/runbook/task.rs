//! Tasks and task sets.
//!
//! A task is either a native async callable or a shell script. Task
//! sets key tasks by weight or by name; weighted tasks run first in
//! ascending order, named tasks afterwards with no mutual ordering.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::RunbookError;
use crate::context::Context;

/// A task-set key: integer weight or independent name.
///
/// The derived ordering puts every weight before every name, weights
/// ascending, which is exactly the execution order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskKey {
    /// Ordered slot; lower weights run earlier.
    Weight(i32),
    /// Independent task with no ordering requirement.
    Name(String),
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weight(w) => write!(f, "{w}"),
            Self::Name(n) => write!(f, "{n}"),
        }
    }
}

impl From<i32> for TaskKey {
    fn from(w: i32) -> Self {
        Self::Weight(w)
    }
}

impl From<&str> for TaskKey {
    fn from(n: &str) -> Self {
        Self::Name(n.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(n: String) -> Self {
        Self::Name(n)
    }
}

/// Future returned by a native task.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), RunbookError>> + Send>>;

/// A native task callable.
pub type TaskFn = Arc<dyn Fn(Arc<Context>) -> TaskFuture + Send + Sync>;

/// A shell-script task: inline text, or the name of a script file
/// found under the carton's file-search paths.
#[derive(Debug, Clone)]
pub struct ScriptTask {
    script: String,
    routine: String,
}

/// One task.
#[derive(Clone)]
pub enum Task {
    /// Shell script run in `/bin/bash`.
    Script(ScriptTask),
    /// Native async callable.
    Native(TaskFn),
}

impl Task {
    /// A script task from inline text or a script-file name.
    #[must_use]
    pub fn script(script: impl Into<String>) -> Self {
        Self::Script(ScriptTask {
            script: script.into(),
            routine: String::new(),
        })
    }

    /// A native task from an async closure.
    pub fn native<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RunbookError>> + Send + 'static,
    {
        Self::Native(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    async fn run(&self, ctx: &Arc<Context>) -> Result<(), RunbookError> {
        match self {
            Self::Script(script) => script.run(ctx).await,
            Self::Native(f) => f(Arc::clone(ctx)).await,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Script(s) => f.debug_tuple("Script").field(&s.routine).finish(),
            Self::Native(_) => f.write_str("Native"),
        }
    }
}

/// The tasks of one stage, or a runbook's independent tasks.
#[derive(Debug, Default)]
pub struct TaskSet {
    routine: String,
    set: Mutex<BTreeMap<TaskKey, Task>>,
}

impl TaskSet {
    /// An empty set whose scripts default their shell routine to
    /// `routine` (normally the owning stage's name).
    #[must_use]
    pub fn new(routine: impl Into<String>) -> Self {
        Self {
            routine: routine.into(),
            set: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.lock().expect("taskset poisoned").len()
    }

    /// Whether the set holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a task keyed `name` exists.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.set
            .lock()
            .expect("taskset poisoned")
            .contains_key(&TaskKey::Name(name.to_string()))
    }

    /// Add a task under `key`.
    ///
    /// A script task picks up its shell routine from the key when the
    /// key is a name, otherwise from the set's default routine.
    ///
    /// # Errors
    ///
    /// [`RunbookError::TaskAdded`] if the key is already taken.
    pub fn add(&self, key: impl Into<TaskKey>, task: Task) -> Result<(), RunbookError> {
        let key = key.into();
        let mut set = self.set.lock().expect("taskset poisoned");
        if set.contains_key(&key) {
            return Err(RunbookError::TaskAdded(key.to_string()));
        }

        let task = match task {
            Task::Script(mut script) => {
                script.routine = match &key {
                    TaskKey::Name(name) => name.clone(),
                    TaskKey::Weight(_) => self.routine.clone(),
                };
                Task::Script(script)
            }
            native => native,
        };
        set.insert(key, task);
        Ok(())
    }

    /// Remove the task under `key`, if any.
    pub fn del(&self, key: impl Into<TaskKey>) {
        self.set.lock().expect("taskset poisoned").remove(&key.into());
    }

    /// Run every task: weights ascending, then names.
    ///
    /// # Errors
    ///
    /// The first task error aborts the set.
    pub async fn play(&self, ctx: &Arc<Context>) -> Result<(), RunbookError> {
        let tasks: Vec<(TaskKey, Task)> = {
            let set = self.set.lock().expect("taskset poisoned");
            set.iter().map(|(k, t)| (k.clone(), t.clone())).collect()
        };
        for (key, task) in tasks {
            trace!(owner = %ctx.owner(), %key, "running task");
            task.run(ctx).await?;
        }
        Ok(())
    }

    /// Run the single task keyed `name`.
    ///
    /// # Errors
    ///
    /// [`RunbookError::UnknownTask`] if no such task exists.
    pub async fn run(&self, ctx: &Arc<Context>, name: &str) -> Result<(), RunbookError> {
        let task = {
            let set = self.set.lock().expect("taskset poisoned");
            set.get(&TaskKey::Name(name.to_string())).cloned()
        };
        match task {
            Some(task) => task.run(ctx).await,
            None => Err(RunbookError::UnknownTask(name.to_string())),
        }
    }
}

impl ScriptTask {
    /// Run the script in `/bin/bash`.
    ///
    /// The script name is first looked up under the carton's
    /// file-search paths; a hit means "script file", a miss means the
    /// text itself is the script. If the script defines a shell
    /// function named like the routine, the routine name is appended
    /// so the function actually runs.
    async fn run(&self, ctx: &Arc<Context>) -> Result<(), RunbookError> {
        let (body, routine) = self.resolve(&ctx.files_path());

        let mut cmd = tokio::process::Command::new("/bin/bash");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        if let Some(cwd) = ctx.task_dir() {
            cmd.current_dir(cwd);
        }

        cmd.envs(std::env::vars());
        let mut pairs = Vec::new();
        ctx.range(|k, v| pairs.push((k.to_string(), v.to_string())));
        for (k, v) in pairs {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            let mut input = body;
            if !routine.is_empty() {
                input.push('\n');
                input.push_str(&routine);
                input.push('\n');
            }
            stdin.write_all(input.as_bytes()).await?;
            drop(stdin);
        }

        let sink = ctx.output();
        let out_pump = tokio::spawn(pump(child.stdout.take(), sink.clone()));
        let err_pump = tokio::spawn(pump(child.stderr.take(), sink));

        let token = ctx.token();
        let status = tokio::select! {
            status = child.wait() => status?,
            () = token.cancelled() => {
                if let Some(pid) = pid {
                    // The script runs in its own process group; kill the
                    // whole group so its children do not outlive us.
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                let _ = child.wait().await;
                return Err(RunbookError::Cancelled);
            }
        };
        let _ = tokio::join!(out_pump, err_pump);

        if !status.success() {
            return Err(RunbookError::ScriptFailed {
                owner: ctx.owner(),
                task: self.routine.clone(),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    /// Resolve the script body and whether the routine applies.
    fn resolve(&self, files_path: &[PathBuf]) -> (String, String) {
        let pattern = format!(r" *{} *\( *\)", regex::escape(&self.routine));
        let exp = Regex::new(&pattern).expect("routine pattern");

        if !self.script.contains('\n') && !self.script.is_empty() {
            for dir in files_path {
                let path: PathBuf = dir.join(&self.script);
                if let Ok(body) = std::fs::read_to_string(&path) {
                    let routine = if exp.is_match(&body) {
                        self.routine.clone()
                    } else {
                        String::new()
                    };
                    return (body, routine);
                }
            }
        }

        let routine = if exp.is_match(&self.script) {
            self.routine.clone()
        } else {
            String::new()
        };
        (self.script.clone(), routine)
    }
}

async fn pump(
    reader: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    sink: crate::context::OutputSink,
) {
    let Some(mut reader) = reader else { return };
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.write(&buf[..n]),
        }
    }
}
