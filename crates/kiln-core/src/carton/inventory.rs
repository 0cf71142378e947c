//! The carton registry.
//!
//! Population is two-phase: registration closures run first (in
//! parallel, one lane per carton), then update closures let later
//! recipe files amend earlier cartons. Only when both phases drain
//! does graph validation run: a parallel three-color DFS that reports
//! the first dependency cycle found.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::{Builder, Carton, CartonError, Link, NATIVE_SUFFIX};

type ModFn = Box<dyn FnOnce(&mut Carton) + Send>;

/// Result of an inventory lookup.
pub struct FindResult {
    /// The carton, real or virtual.
    pub builder: Arc<dyn Builder>,
    /// Whether the hit was a link.
    pub is_virtual: bool,
    /// Whether the queried name carried the `-native` suffix.
    pub is_native: bool,
}

/// Collects recipe registrations before the inventory freezes.
pub struct InventoryBuilder {
    dl_dir: PathBuf,
    slots: HashMap<String, Carton>,
    inits: Vec<(String, ModFn)>,
    updates: Vec<(String, ModFn)>,
    links: Vec<(String, String, String)>,
}

impl InventoryBuilder {
    /// An empty builder; new cartons download into `dl_dir`.
    #[must_use]
    pub fn new(dl_dir: impl Into<PathBuf>) -> Self {
        Self {
            dl_dir: dl_dir.into(),
            slots: HashMap::new(),
            inits: Vec::new(),
            updates: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Register a software carton. The provider name is reserved
    /// immediately; the modifier runs during the registration drain.
    ///
    /// # Panics
    ///
    /// Panics on an empty or duplicate provider name; recipes that
    /// collide are a packaging bug, not a runtime condition.
    pub fn new_carton(
        &mut self,
        name: &str,
        file: &str,
        modify: impl FnOnce(&mut Carton) + Send + 'static,
    ) {
        let carton = Carton::new_software(name, &self.dl_dir);
        self.reserve(name, file, carton, modify);
    }

    /// Register an image carton.
    ///
    /// # Panics
    ///
    /// Panics on an empty or duplicate provider name.
    pub fn new_image(
        &mut self,
        name: &str,
        file: &str,
        modify: impl FnOnce(&mut Carton) + Send + 'static,
    ) {
        let carton = Carton::new_image(name, &self.dl_dir);
        self.reserve(name, file, carton, modify);
    }

    fn reserve(
        &mut self,
        name: &str,
        file: &str,
        carton: Carton,
        modify: impl FnOnce(&mut Carton) + Send + 'static,
    ) {
        assert!(!name.is_empty(), "carton: {}", CartonError::NoName);
        assert!(
            !self.slots.contains_key(name),
            "carton {name} had been added!"
        );
        self.slots.insert(name.to_string(), carton);

        let file = file.to_string();
        self.inits.push((
            name.to_string(),
            Box::new(move |c| {
                modify(c);
                c.add_from(&file);
            }),
        ));
    }

    /// Queue an amendment to an already registered carton. Runs after
    /// every registration closure, so it sees a fully constructed
    /// carton. An unknown name is a warning, not an error.
    pub fn update(
        &mut self,
        name: &str,
        file: &str,
        modify: impl FnOnce(&mut Carton) + Send + 'static,
    ) {
        if !self.slots.contains_key(name) {
            warn!(carton = name, "carton is not found for updating");
            return;
        }
        let file = file.to_string();
        self.updates.push((
            name.to_string(),
            Box::new(move |c| {
                c.add_from(&file);
                modify(c);
            }),
        ));
    }

    /// Explicitly link `alias` to the carton `target`.
    pub fn link(&mut self, alias: &str, target: &str, file: &str) {
        self.links
            .push((alias.to_string(), target.to_string(), file.to_string()));
    }

    /// Drain both phases, freeze the cartons, and validate the graph.
    ///
    /// # Errors
    ///
    /// [`CartonError::CycleDetected`] if the dependency digraph has a
    /// loop, or [`CartonError::NotFound`] when a dependency or link
    /// target is unknown.
    pub async fn build(self, cancel: &CancellationToken) -> Result<Inventory, CartonError> {
        let Self {
            slots,
            inits,
            updates,
            links,
            ..
        } = self;

        let slots = drain_phase(slots, inits).await;
        let slots = drain_phase(slots, updates).await;

        let real: HashMap<String, Arc<Carton>> = slots
            .into_iter()
            .map(|(name, carton)| (name, Arc::new(carton)))
            .collect();

        let mut virt: HashMap<String, Arc<Link>> = HashMap::new();
        for carton in real.values() {
            for alias in carton.providers().iter().skip(1) {
                virt.insert(
                    alias.clone(),
                    Arc::new(Link::new(alias, Arc::clone(carton), Vec::new())),
                );
            }
        }
        for (alias, target, file) in links {
            let carton = real
                .get(&target)
                .ok_or_else(|| CartonError::NotFound(target.clone()))?;
            virt.insert(
                alias.clone(),
                Arc::new(Link::new(&alias, Arc::clone(carton), vec![file])),
            );
        }

        let inventory = Inventory { real, virt };
        inventory.detect_loops(cancel)?;
        Ok(inventory)
    }
}

/// Run one phase's closures: lanes per carton run in parallel, the
/// closures of one carton in queue order.
async fn drain_phase(
    mut slots: HashMap<String, Carton>,
    queue: Vec<(String, ModFn)>,
) -> HashMap<String, Carton> {
    let mut lanes: HashMap<String, Vec<ModFn>> = HashMap::new();
    for (name, f) in queue {
        lanes.entry(name).or_default().push(f);
    }

    let mut group: JoinSet<(String, Carton)> = JoinSet::new();
    for (name, fns) in lanes {
        let Some(mut carton) = slots.remove(&name) else {
            continue;
        };
        group.spawn_blocking(move || {
            for f in fns {
                f(&mut carton);
            }
            (name, carton)
        });
    }
    while let Some(done) = group.join_next().await {
        // A panicking recipe closure is a packaging bug; surface it.
        let (name, carton) = done.expect("recipe modifier panicked");
        slots.insert(name, carton);
    }
    slots
}

/// The frozen registry: real cartons plus virtual links.
#[derive(Debug)]
pub struct Inventory {
    real: HashMap<String, Arc<Carton>>,
    virt: HashMap<String, Arc<Link>>,
}

impl Inventory {
    /// Look `name` up, stripping an optional `-native` suffix first.
    /// Real cartons shadow links.
    ///
    /// # Errors
    ///
    /// [`CartonError::NotFound`] on a miss.
    pub fn find(&self, name: &str) -> Result<FindResult, CartonError> {
        let (name, is_native) = match name.strip_suffix(NATIVE_SUFFIX) {
            Some(stripped) => (stripped, true),
            None => (name, false),
        };

        if let Some(carton) = self.real.get(name) {
            return Ok(FindResult {
                builder: Arc::clone(carton) as Arc<dyn Builder>,
                is_virtual: false,
                is_native,
            });
        }
        if let Some(link) = self.virt.get(name) {
            return Ok(FindResult {
                builder: Arc::clone(link) as Arc<dyn Builder>,
                is_virtual: true,
                is_native,
            });
        }
        Err(CartonError::NotFound(name.to_string()))
    }

    /// The real carton behind `name`, resolving through links.
    ///
    /// # Errors
    ///
    /// [`CartonError::NotFound`] on a miss.
    pub fn resolve(&self, name: &str) -> Result<Arc<Carton>, CartonError> {
        let (name, _) = match name.strip_suffix(NATIVE_SUFFIX) {
            Some(stripped) => (stripped, true),
            None => (name, false),
        };
        if let Some(carton) = self.real.get(name) {
            return Ok(Arc::clone(carton));
        }
        if let Some(link) = self.virt.get(name) {
            return Ok(Arc::clone(link.target()));
        }
        Err(CartonError::NotFound(name.to_string()))
    }

    /// Provider names of all real cartons.
    #[must_use]
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.real.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of real cartons.
    #[must_use]
    pub fn len(&self) -> usize {
        self.real.len()
    }

    /// Whether the inventory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.real.is_empty()
    }

    /// Dependency edges of `name`: build-time then runtime, with any
    /// `@stage` suffix left attached, duplicates dropped.
    fn adjacent(&self, name: &str) -> Result<Vec<String>, CartonError> {
        let vertex = name.split('@').next().unwrap_or(name);
        let result = self.find(vertex)?;

        let mut edges = result.builder.build_depends();
        edges.extend(result.builder.depends());
        let mut seen = std::collections::HashSet::new();
        edges.retain(|e| seen.insert(e.clone()));
        Ok(edges)
    }

    /// Detect dependency loops from every provider, in parallel. The
    /// first cycle found cancels the remaining workers.
    fn detect_loops(&self, cancel: &CancellationToken) -> Result<(), CartonError> {
        let roots: Arc<Mutex<VecDeque<String>>> =
            Arc::new(Mutex::new(self.real.keys().cloned().collect()));
        let token = cancel.child_token();
        let found: Arc<Mutex<Option<CartonError>>> = Arc::new(Mutex::new(None));

        let workers = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let roots = Arc::clone(&roots);
                let token = token.clone();
                let found = Arc::clone(&found);
                scope.spawn(move || loop {
                    if token.is_cancelled() {
                        return;
                    }
                    let Some(root) = roots.lock().expect("roots poisoned").pop_front() else {
                        return;
                    };
                    trace!(carton = %root, "checking dependency hierarchy");
                    if let Err(e) = self.has_loop(&root, &token) {
                        *found.lock().expect("found poisoned") = Some(e);
                        token.cancel();
                        return;
                    }
                });
            }
        });

        let found = found.lock().expect("found poisoned").take();
        match found {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn has_loop(&self, root: &str, cancel: &CancellationToken) -> Result<(), CartonError> {
        let mut dfs = Dfs {
            inventory: self,
            colors: HashMap::new(),
            path: Vec::new(),
        };
        dfs.visit(root, cancel)
    }
}

/// Three-color DFS state. White vertices are unvisited, gray ones sit
/// on the current path, black ones are fully explored; revisiting a
/// gray vertex closes a cycle.
struct Dfs<'a> {
    inventory: &'a Inventory,
    colors: HashMap<String, Color>,
    path: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl Dfs<'_> {
    fn color(&self, vertex: &str) -> Color {
        self.colors.get(vertex).copied().unwrap_or(Color::White)
    }

    fn visit(&mut self, vertex: &str, cancel: &CancellationToken) -> Result<(), CartonError> {
        self.colors.insert(vertex.to_string(), Color::Gray);
        self.path.push(vertex.to_string());

        let edges = self.inventory.adjacent(vertex)?;
        for edge in edges {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.color(&edge) {
                Color::White => self.visit(&edge, cancel)?,
                Color::Gray => {
                    // Truncate the path to the cycle: everything from
                    // the first appearance of the revisited vertex.
                    let mut path = match self.path.iter().position(|v| *v == edge) {
                        Some(pos) => self.path[pos..].to_vec(),
                        None => self.path.clone(),
                    };
                    path.push(edge);
                    return Err(CartonError::CycleDetected { path });
                }
                Color::Black => {}
            }
        }

        self.colors.insert(vertex.to_string(), Color::Black);
        self.path.pop();
        Ok(())
    }
}
