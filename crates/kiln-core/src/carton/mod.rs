//! Cartons: build recipes and the `Builder` seam.
//!
//! A carton describes how one software component or image is built:
//! where its sources come from, what it depends on, and the runbook
//! that drives it. Recipes construct cartons through the engine; the
//! loader only ever sees the [`Builder`] trait, which virtual cartons
//! ([`Link`]) also implement.

pub mod inventory;
mod link;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

pub use inventory::{Inventory, InventoryBuilder};
pub use link::Link;

use crate::fetch::Resource;
use crate::kv::Kv;
use crate::runbook::{Runbook, Task};

/// The fetch stage.
pub const FETCH: &str = "fetch";
/// The patch stage.
pub const PATCH: &str = "patch";
/// The prepare stage.
pub const PREPARE: &str = "prepare";
/// The build stage.
pub const BUILD: &str = "build";
/// The install stage.
pub const INSTALL: &str = "install";
/// The package stage.
pub const PACKAGE: &str = "package";
/// The sysroot stage.
pub const SYSROOT: &str = "sysroot";

/// Suffix selecting the native flavor of a carton.
pub const NATIVE_SUFFIX: &str = "-native";

/// Carton-layer failure.
#[derive(Debug, thiserror::Error)]
pub enum CartonError {
    /// Carton registered with an empty provider name.
    #[error("illegal provider name")]
    NoName,

    /// Inventory miss.
    #[error("carton {0} not found")]
    NotFound(String),

    /// A relative path was required.
    #[error("absolute path rejected: {0}")]
    AbsPath(String),

    /// A path that must exist on disk does not.
    #[error("no such directory: {0}")]
    NoDir(String),

    /// The dependency graph has a cycle.
    #[error("detected loop: {path:?}")]
    CycleDetected {
        /// The offending path; its last element revisits an earlier one.
        path: Vec<String>,
    },
}

/// What kind of thing a carton builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartonKind {
    /// A software component; full fetch-to-package runbook.
    Software,
    /// An image; prepare/build/install only.
    Image,
}

/// The interface the loader builds against.
pub trait Builder: Send + Sync {
    /// The provider name this carton is registered under.
    fn provider(&self) -> &str;

    /// The name exported as `PN`; a link answers with its alias.
    fn carton_name(&self) -> &str;

    /// The recipe files that registered or amended this carton.
    fn from_files(&self) -> Vec<String>;

    /// Dependencies needed only when building from scratch.
    fn build_depends(&self) -> Vec<String>;

    /// Dependencies needed for building and running.
    fn depends(&self) -> Vec<String>;

    /// The carton's runbook.
    fn runbook(&self) -> Arc<Runbook>;

    /// The carton's fetch state.
    fn resource(&self) -> Arc<Resource>;

    /// Directories consulted for `file://` URLs and script files.
    fn files_path(&self) -> Vec<PathBuf>;

    /// The carton-local key-value store.
    fn kv(&self) -> &Kv;

    /// Resolve the source directory under the work directory `wd`.
    fn src_dir(&self, wd: &Path) -> Option<PathBuf>;

    /// Human-readable summary.
    fn summary(&self) -> String;
}

/// One build recipe.
#[derive(Debug)]
pub struct Carton {
    /// One-line description.
    pub desc: String,
    /// Home page.
    pub homepage: String,

    name: String,
    kind: CartonKind,
    providers: Vec<String>,
    from: Vec<String>,
    src_path: Option<String>,
    file_paths: Vec<PathBuf>,
    depends: Vec<String>,
    build_depends: Vec<String>,
    fetch: Arc<Resource>,
    runbook: Arc<Runbook>,
    kv: Kv,
}

impl Carton {
    /// A software carton with the default runbook
    /// `fetch → patch → prepare → build → install → package`.
    /// Downloads land under `dl_dir`.
    #[must_use]
    pub fn new_software(name: &str, dl_dir: impl Into<PathBuf>) -> Self {
        let fetch = Arc::new(Resource::new(dl_dir));
        let runbook = Runbook::new();

        let stage = runbook.push_front(FETCH);
        stage
            .add_task(0, fetch_task(&fetch, &runbook))
            .expect("fresh stage accepts the fetch task");
        let _ = stage
            .insert_after(PATCH)
            .insert_after(PREPARE)
            .insert_after(BUILD)
            .insert_after(INSTALL)
            .insert_after(PACKAGE);

        Self::with_runbook(name, CartonKind::Software, fetch, runbook)
    }

    /// An image carton with the default runbook
    /// `prepare → build → install`.
    #[must_use]
    pub fn new_image(name: &str, dl_dir: impl Into<PathBuf>) -> Self {
        let fetch = Arc::new(Resource::new(dl_dir));
        let runbook = Runbook::new();
        let _ = runbook
            .push_front(PREPARE)
            .insert_after(BUILD)
            .insert_after(INSTALL);
        Self::with_runbook(name, CartonKind::Image, fetch, runbook)
    }

    fn with_runbook(
        name: &str,
        kind: CartonKind,
        fetch: Arc<Resource>,
        runbook: Arc<Runbook>,
    ) -> Self {
        let kv = Kv::new(name);
        Self {
            desc: String::new(),
            homepage: String::new(),
            name: name.to_string(),
            kind,
            providers: vec![name.to_string()],
            from: Vec::new(),
            src_path: None,
            file_paths: Vec::new(),
            depends: Vec::new(),
            build_depends: Vec::new(),
            fetch,
            runbook,
            kv,
        }
    }

    /// The carton kind.
    #[must_use]
    pub const fn kind(&self) -> CartonKind {
        self.kind
    }

    /// Record a recipe file as a source of this carton. Duplicates are
    /// suppressed; insertion order is kept.
    pub fn add_from(&mut self, file: &str) {
        if file.is_empty() || self.from.iter().any(|f| f == file) {
            return;
        }
        self.from.push(file.to_string());
    }

    /// Add whitespace-separated runtime+build dependencies.
    pub fn depends_on(&mut self, deps: &str) -> &mut Self {
        self.depends
            .extend(deps.split_whitespace().map(str::to_string));
        self
    }

    /// Add whitespace-separated build-only dependencies.
    pub fn build_depends_on(&mut self, deps: &str) -> &mut Self {
        self.build_depends
            .extend(deps.split_whitespace().map(str::to_string));
        self
    }

    /// Register an extra provider name; it becomes a virtual carton in
    /// the inventory.
    pub fn provide(&mut self, alias: &str) -> &mut Self {
        if !alias.is_empty() && !self.providers.iter().any(|p| p == alias) {
            self.providers.push(alias.to_string());
        }
        self
    }

    /// All provider names, the registered one first.
    #[must_use]
    pub fn providers(&self) -> &[String] {
        &self.providers
    }

    /// Add a file-search path. The directory must be absolute and
    /// exist on disk.
    ///
    /// # Errors
    ///
    /// [`CartonError::AbsPath`] for a relative path,
    /// [`CartonError::NoDir`] when the directory is missing.
    pub fn add_file_path(&mut self, dir: impl Into<PathBuf>) -> Result<(), CartonError> {
        let dir = dir.into();
        if !dir.is_absolute() {
            return Err(CartonError::AbsPath(dir.display().to_string()));
        }
        if !dir.is_dir() {
            return Err(CartonError::NoDir(dir.display().to_string()));
        }
        self.file_paths.push(dir);
        Ok(())
    }

    /// Set the source directory explicitly: absolute, or relative to
    /// the work directory.
    pub fn set_src_path(&mut self, dir: impl Into<String>) {
        self.src_path = Some(dir.into());
    }

    /// Set a carton-local variable.
    pub fn set(&self, key: &str, value: impl Into<crate::kv::Value>) {
        self.kv.set(key, value);
    }

    /// The fetch state, for registering source URLs.
    #[must_use]
    pub fn resource(&self) -> &Arc<Resource> {
        &self.fetch
    }

    /// The runbook, for stage surgery.
    #[must_use]
    pub fn runbook(&self) -> &Arc<Runbook> {
        &self.runbook
    }

    /// The selected source version.
    #[must_use]
    pub fn version(&self) -> String {
        self.fetch.version()
    }
}

impl Builder for Carton {
    fn provider(&self) -> &str {
        &self.name
    }

    fn carton_name(&self) -> &str {
        &self.name
    }

    fn from_files(&self) -> Vec<String> {
        self.from.clone()
    }

    fn build_depends(&self) -> Vec<String> {
        self.build_depends.clone()
    }

    fn depends(&self) -> Vec<String> {
        self.depends.clone()
    }

    fn runbook(&self) -> Arc<Runbook> {
        Arc::clone(&self.runbook)
    }

    fn resource(&self) -> Arc<Resource> {
        Arc::clone(&self.fetch)
    }

    fn files_path(&self) -> Vec<PathBuf> {
        self.file_paths.clone()
    }

    fn kv(&self) -> &Kv {
        &self.kv
    }

    fn src_dir(&self, wd: &Path) -> Option<PathBuf> {
        if let Some(explicit) = &self.src_path {
            let p = Path::new(explicit);
            return Some(if p.is_absolute() {
                p.to_path_buf()
            } else {
                wd.join(p)
            });
        }

        let plain = wd.join(&self.name);
        if plain.is_dir() {
            return Some(plain);
        }
        let versioned = wd.join(format!("{}-{}", self.name, self.version()));
        if versioned.is_dir() {
            return Some(versioned);
        }
        None
    }

    fn summary(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for Carton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.desc.is_empty() {
            writeln!(f, "{}", self.desc)?;
        }
        if !self.homepage.is_empty() {
            writeln!(f, "{}", self.homepage)?;
        }
        writeln!(f, "Provider: {}", self.providers.join(" "))?;
        for (i, file) in self.from.iter().enumerate() {
            if i == 0 {
                writeln!(f, "From: {file}")?;
            } else {
                writeln!(f, "      {file}")?;
            }
        }
        Ok(())
    }
}

/// The built-in fetch task: download the selected sources, and on any
/// source change reset every stage after `fetch` so stale markers do
/// not mask the new content.
fn fetch_task(fetch: &Arc<Resource>, runbook: &Arc<Runbook>) -> Task {
    let fetch = Arc::clone(fetch);
    let runbook = Arc::downgrade(runbook);
    Task::native(move |ctx| {
        let fetch = Arc::clone(&fetch);
        let runbook: Weak<Runbook> = Weak::clone(&runbook);
        async move {
            let ctx2 = Arc::clone(&ctx);
            let notify = move |_updated: bool| {
                let Some(rb) = runbook.upgrade() else { return };
                for stage in rb.stages_after(FETCH) {
                    if let Err(e) = stage.reset(&ctx2) {
                        tracing::warn!(stage = stage.name(), error = %e, "reset failed");
                    }
                }
            };
            fetch.download(&ctx, Some(&notify)).await?;
            Ok(())
        }
    })
}
