//! Per-execution context.
//!
//! One context exists per (carton, native-flavor) pair in a loader
//! run. It layers an execution-scoped KV over the carton's KV over the
//! global settings, resolves IO sinks from the acquired pool slot plus
//! any per-stage log sink, and brokers cross-runbook rendezvous
//! through the loader.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::carton::Builder;
use crate::kv::{Kv, Value};
use crate::loader::state::StageMeta;
use crate::loader::{paths, LoadSlot, Loader};
use crate::runbook::{Notifier, RunbookError};
use crate::settings::keys;

/// Expansion bound; a `${A}` → `${B}` → `${A}` loop trips this.
const MAX_EXPANSION_DEPTH: usize = 32;

/// Context-level failure.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// A `${KEY}` reference did not resolve.
    #[error("failed to expand key {key}")]
    Unresolved {
        /// The unresolved key.
        key: String,
    },

    /// `MACHINEARCH` is required for a cross build but unset.
    #[error("MACHINEARCH is not set")]
    MissingMachineArch,

    /// The operation was cancelled.
    #[error("context cancelled")]
    Cancelled,
}

/// The execution context handed to every task and notifier.
///
/// Holds its loader weakly; the loader's state table owns the
/// contexts, and a strong back-reference would keep the loader (and
/// its lockfile) alive past the end of the run.
pub struct Context {
    loader: Weak<Loader>,
    carton: Arc<dyn Builder>,
    kv: Kv,
    is_native: bool,
    echo: bool,
    stage: Mutex<String>,
    slot: Mutex<Option<LoadSlot>>,
    err_log: Mutex<Vec<u8>>,
}

impl Context {
    /// Build the context for `carton`, populating the well-known
    /// variables (`WORKDIR`, `PN`, `T`, `D`, `PKGD`, the target
    /// triple, `ISNATIVE`, and `S` when it can be inferred).
    ///
    /// # Errors
    ///
    /// [`ContextError::MissingMachineArch`] when a cross build has no
    /// machine architecture configured.
    pub fn new(
        loader: Arc<Loader>,
        carton: Arc<dyn Builder>,
        is_native: bool,
        echo: bool,
    ) -> Result<Arc<Self>, ContextError> {
        let settings = loader.settings();
        let wd = paths::work_dir(carton.as_ref(), &settings, is_native)?;

        let kv = Kv::new("context");
        kv.set("WORKDIR", wd.display().to_string());
        kv.set("ISNATIVE", is_native);
        kv.set("PN", carton.carton_name());
        kv.set("T", wd.join("temp").display().to_string());
        kv.set("D", wd.join("image").display().to_string());
        kv.set("PKGD", wd.join("packages").display().to_string());
        kv.set(
            "TARGETARCH",
            paths::target_arch(carton.as_ref(), &settings, is_native)?,
        );
        kv.set(
            "TARGETOS",
            paths::target_os(&settings, is_native),
        );
        kv.set(
            "TARGETVENDOR",
            paths::target_vendor(&settings, is_native),
        );
        if let Some(src) = carton.src_dir(&wd) {
            kv.set("S", src.display().to_string());
        }

        Ok(Arc::new(Self {
            loader: Arc::downgrade(&loader),
            carton,
            kv,
            is_native,
            echo,
            stage: Mutex::new(String::new()),
            slot: Mutex::new(None),
            err_log: Mutex::new(Vec::new()),
        }))
    }

    /// The owning carton's name (`PN`).
    #[must_use]
    pub fn owner(&self) -> String {
        self.carton.carton_name().to_string()
    }

    /// The carton under execution.
    #[must_use]
    pub fn carton(&self) -> &Arc<dyn Builder> {
        &self.carton
    }

    /// The loader driving this run.
    ///
    /// # Panics
    ///
    /// Panics if the loader is gone; contexts only run inside a
    /// loader's lifetime.
    #[must_use]
    pub fn loader(&self) -> Arc<Loader> {
        self.loader.upgrade().expect("context outlived its loader")
    }

    /// Whether this is the native flavor.
    #[must_use]
    pub const fn is_native(&self) -> bool {
        self.is_native
    }

    /// The loader's cancellation token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.loader().token().clone()
    }

    /// The carton's file-search paths.
    #[must_use]
    pub fn files_path(&self) -> Vec<PathBuf> {
        self.carton.files_path()
    }

    /// The per-stage timeout: carton-scoped `TIMEOUT` if set, global
    /// otherwise.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.carton
            .kv()
            .get(keys::TIMEOUT)
            .and_then(|v| v.as_int())
            .map_or_else(|| self.loader().settings().timeout(), |secs| {
                Duration::from_secs(secs.max(1) as u64)
            })
    }

    /// Set an execution-scoped variable.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.kv.set(key, value);
    }

    /// Raw lookup: execution scope, then carton, then global settings.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.kv
            .get(key)
            .or_else(|| self.carton.kv().get(key))
            .or_else(|| self.loader().settings().kv().get(key))
    }

    /// String lookup with recursive `${KEY}` expansion.
    ///
    /// # Errors
    ///
    /// [`ContextError::Unresolved`] when a referenced key is missing
    /// or expansion does not terminate.
    pub fn get_str(&self, key: &str) -> Result<String, ContextError> {
        let raw = match self.get(key) {
            Some(Value::Str(s)) => s,
            _ => return Ok(String::new()),
        };
        self.expand(&raw)
    }

    /// Expand every `${KEY}` reference in `text`.
    ///
    /// # Errors
    ///
    /// [`ContextError::Unresolved`] for an unknown key or runaway
    /// recursion.
    pub fn expand(&self, text: &str) -> Result<String, ContextError> {
        let pattern = Regex::new(r"\$\{([^${}]+)\}").expect("expansion pattern");
        let mut value = text.to_string();
        for _ in 0..MAX_EXPANSION_DEPTH {
            let Some(found) = pattern.captures(&value) else {
                return Ok(value);
            };
            let key = found.get(1).expect("capture group").as_str().to_string();
            let replacement = match self.get(&key) {
                Some(Value::Str(s)) => s,
                Some(other) => other.render(),
                None => return Err(ContextError::Unresolved { key }),
            };
            value = value.replacen(&format!("${{{key}}}"), &replacement, 1);
        }
        Err(ContextError::Unresolved {
            key: text.to_string(),
        })
    }

    /// Visit every variable, outermost layer first so inner layers
    /// override: global settings, then carton, then execution scope.
    pub fn range(&self, mut f: impl FnMut(&str, &str)) {
        let mut merged = std::collections::BTreeMap::new();
        let settings = self.loader().settings();
        settings.kv().range(|k, v| {
            merged.insert(k.to_string(), v.to_string());
        });
        self.carton.kv().range(|k, v| {
            merged.insert(k.to_string(), v.to_string());
        });
        self.kv.range(|k, v| {
            merged.insert(k.to_string(), v.to_string());
        });
        for (k, v) in merged {
            f(&k, &v);
        }
    }

    /// The carton's work directory.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(self.kv.get_str("WORKDIR"))
    }

    /// The carton's temp directory (`T`).
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        PathBuf::from(self.kv.get_str("T"))
    }

    /// Create the work, temp, image, and package directories.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    pub fn mkdirs(&self) -> std::io::Result<()> {
        for key in ["WORKDIR", "T", "D", "PKGD"] {
            let dir = self.kv.get_str(key);
            if !dir.is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// The source and build directories: build is `S` unless `B` is
    /// set (absolute, or joined under `S`). Returns `None` while the
    /// source directory cannot be resolved yet.
    ///
    /// # Errors
    ///
    /// Expansion failure on `B`.
    pub fn dir(&self) -> Result<Option<(PathBuf, PathBuf)>, ContextError> {
        let src = match self.get("S") {
            Some(Value::Str(s)) if !s.is_empty() => PathBuf::from(self.expand(&s)?),
            _ => match self.carton.src_dir(&self.work_dir()) {
                Some(dir) => dir,
                None => return Ok(None),
            },
        };

        let b = self.get_str("B")?;
        let build = if b.is_empty() {
            src.clone()
        } else {
            let b = PathBuf::from(b);
            let build = if b.is_absolute() { b } else { src.join(b) };
            if src.is_dir() && !build.is_dir() {
                let _ = std::fs::create_dir_all(&build);
            }
            build
        };
        Ok(Some((src, build)))
    }

    /// Where a script task should run: the current stage's override,
    /// else the build directory, else the work directory.
    #[must_use]
    pub fn task_dir(&self) -> Option<PathBuf> {
        let stage = self.current_stage();
        if !stage.is_empty() {
            if let Some(dir) = self.carton.runbook().stage(&stage).and_then(|s| s.dir()) {
                return Some(dir);
            }
        }
        if let Ok(Some((_, build))) = self.dir() {
            if build.is_dir() {
                return Some(build);
            }
        }
        let wd = self.work_dir();
        wd.is_dir().then_some(wd)
    }

    /// Whether the stage `name` already completed, in memory or on
    /// disk (`T/<name>.done`).
    #[must_use]
    pub fn staged(&self, name: &str) -> bool {
        if self
            .loader()
            .is_stage_loaded(self.carton.provider(), name, self.is_native)
        {
            return true;
        }
        paths::is_stage_played(&self.temp_dir(), name)
    }

    /// Record which stage is currently running.
    pub fn set_stage(&self, name: &str) {
        *self.stage.lock().expect("context poisoned") = name.to_string();
    }

    /// Record that stage `name` completed for this flavor: persist the
    /// on-disk marker and release rendezvous waiters. Runs on every
    /// transition to completion, cached or fresh.
    pub fn stage_complete(&self, name: &str) {
        paths::mark_stage_played(&self.temp_dir(), name, true);
        if let Some(meta) = self.stage_meta(name) {
            meta.set_done(self, name);
        }
    }

    /// Forget stage `name`'s completion: drop the marker and the
    /// in-memory record, so the stage replays.
    pub fn stage_reset(&self, name: &str) {
        paths::mark_stage_played(&self.temp_dir(), name, false);
        if let Some(meta) = self.stage_meta(name) {
            meta.clear_done();
        }
    }

    /// The currently running stage name, empty between stages.
    #[must_use]
    pub fn current_stage(&self) -> String {
        self.stage.lock().expect("context poisoned").clone()
    }

    /// The state table entry of the current carton's stage `name`.
    #[must_use]
    pub fn stage_meta(&self, name: &str) -> Option<Arc<StageMeta>> {
        self.loader()
            .stage_meta(self.carton.provider(), name, self.is_native)
    }

    /// Acquire a pool slot for the task set about to run.
    ///
    /// # Errors
    ///
    /// [`ContextError::Cancelled`] when the loader shuts down first.
    pub async fn acquire(&self) -> Result<(), ContextError> {
        let loader = self.loader();
        let token = self.token();
        let slot = loader
            .pool()
            .get(&token)
            .await
            .map_err(|_| ContextError::Cancelled)?;
        slot.buf.lock().expect("slot poisoned").clear();
        *self.slot.lock().expect("context poisoned") = Some(slot);
        Ok(())
    }

    /// Release the held pool slot, if any.
    pub fn release(&self) {
        if let Some(slot) = self.slot.lock().expect("context poisoned").take() {
            self.loader().pool().put(slot);
        }
    }

    /// Snapshot the held slot's capture buffer into the context's
    /// error log, for the loader's failure banner.
    pub fn capture_err_log(&self) {
        let slot = self.slot.lock().expect("context poisoned");
        if let Some(slot) = slot.as_ref() {
            let buf = slot.buf.lock().expect("slot poisoned");
            self.err_log
                .lock()
                .expect("context poisoned")
                .extend_from_slice(&buf);
        }
    }

    /// The captured error transcript.
    #[must_use]
    pub fn err_log(&self) -> String {
        String::from_utf8_lossy(&self.err_log.lock().expect("context poisoned")).into_owned()
    }

    /// The IO sink for the current stage: the pool slot's capture
    /// buffer, the stage's log file, and the terminal when echoing.
    #[must_use]
    pub fn output(&self) -> OutputSink {
        let mut sink = OutputSink::default();
        if let Some(slot) = self.slot.lock().expect("context poisoned").as_ref() {
            sink.push_buffer(Arc::clone(&slot.buf));
        }
        let stage = self.current_stage();
        if !stage.is_empty() {
            if let Some(meta) = self.stage_meta(&stage) {
                if let Some(file) = meta.sink() {
                    sink.push_file(file);
                }
            }
        }
        if self.echo {
            sink.push_stderr();
        }
        sink
    }

    /// Wait for `stage` of carton `name` to complete, scheduling that
    /// carton if nothing has yet. The notifier, when given, fires on
    /// completion whether the stage runs fresh or was already done.
    ///
    /// # Errors
    ///
    /// Lookup failure or cancellation.
    pub async fn wait(
        &self,
        name: &str,
        stage: &str,
        notifier: Option<Notifier>,
    ) -> Result<(), RunbookError> {
        let loader = self.loader();
        let pending = loader.begin_wait(name, stage, self.is_native, notifier)?;
        pending.await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("owner", &self.owner())
            .field("is_native", &self.is_native)
            .field("stage", &self.current_stage())
            .finish()
    }
}

/// A fan-out writer over capture buffers, log files, and the terminal.
#[derive(Clone, Default)]
pub struct OutputSink {
    buffers: Vec<Arc<Mutex<Vec<u8>>>>,
    files: Vec<Arc<Mutex<File>>>,
    stderr: bool,
}

impl OutputSink {
    /// Add a capture buffer target.
    pub fn push_buffer(&mut self, buf: Arc<Mutex<Vec<u8>>>) {
        self.buffers.push(buf);
    }

    /// Add a log-file target.
    pub fn push_file(&mut self, file: Arc<Mutex<File>>) {
        self.files.push(file);
    }

    /// Echo to the process's stderr as well.
    pub fn push_stderr(&mut self) {
        self.stderr = true;
    }

    /// Write `bytes` to every target. Sink failures are reported as
    /// warnings, not errors: losing a log line must not fail a build.
    pub fn write(&self, bytes: &[u8]) {
        for buf in &self.buffers {
            buf.lock().expect("sink poisoned").extend_from_slice(bytes);
        }
        for file in &self.files {
            let mut file = file.lock().expect("sink poisoned");
            if let Err(e) = file.write_all(bytes) {
                warn!(error = %e, "log sink write failed");
            }
        }
        if self.stderr {
            let _ = std::io::stderr().write_all(bytes);
        }
    }

    /// Write a line.
    pub fn write_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.write(&bytes);
    }
}
