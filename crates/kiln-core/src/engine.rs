//! The engine: explicit construction of what the heritage code kept
//! in process-wide globals.
//!
//! An [`Engine`] owns the global settings and the inventory under
//! construction. Recipes register cartons against it, the inventory
//! is built (and graph-validated) exactly once, and loaders are
//! spawned from the result. A front-end boils down to
//! `Engine::new(settings)` followed by registration, build, and
//! `new_loader(...).run(...)`.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::carton::{Carton, CartonError, Inventory, InventoryBuilder};
use crate::loader::{LoadError, Loader};
use crate::settings::{keys, Settings};

/// One build universe: settings, recipes, inventory, loaders.
pub struct Engine {
    settings: Arc<Settings>,
    builder: Mutex<Option<InventoryBuilder>>,
    inventory: Mutex<Option<Arc<Inventory>>>,
}

impl Engine {
    /// An engine over `settings`.
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        let builder = InventoryBuilder::new(settings.dir(keys::DLDIR));
        Self {
            settings: Arc::new(settings),
            builder: Mutex::new(Some(builder)),
            inventory: Mutex::new(None),
        }
    }

    /// The global settings.
    #[must_use]
    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// Register a software carton; `file` names the registering recipe.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate or empty provider name, or when the
    /// inventory was already built.
    pub fn new_carton(
        &self,
        name: &str,
        file: &str,
        modify: impl FnOnce(&mut Carton) + Send + 'static,
    ) {
        self.with_builder(|b| b.new_carton(name, file, modify));
    }

    /// Register an image carton.
    ///
    /// # Panics
    ///
    /// Same conditions as [`Engine::new_carton`].
    pub fn new_image(
        &self,
        name: &str,
        file: &str,
        modify: impl FnOnce(&mut Carton) + Send + 'static,
    ) {
        self.with_builder(|b| b.new_image(name, file, modify));
    }

    /// Queue an amendment to an already registered carton.
    ///
    /// # Panics
    ///
    /// Panics when the inventory was already built.
    pub fn update_carton(
        &self,
        name: &str,
        file: &str,
        modify: impl FnOnce(&mut Carton) + Send + 'static,
    ) {
        self.with_builder(|b| b.update(name, file, modify));
    }

    /// Link `alias` to the carton `target`.
    ///
    /// # Panics
    ///
    /// Panics when the inventory was already built.
    pub fn link_carton(&self, alias: &str, target: &str, file: &str) {
        self.with_builder(|b| b.link(alias, target, file));
    }

    fn with_builder(&self, f: impl FnOnce(&mut InventoryBuilder)) {
        let mut builder = self.builder.lock().expect("engine poisoned");
        let builder = builder
            .as_mut()
            .expect("recipes must register before the inventory is built");
        f(builder);
    }

    /// Drain registrations and updates, then validate the dependency
    /// graph. Idempotent: later calls return the frozen inventory.
    ///
    /// # Errors
    ///
    /// [`CartonError::CycleDetected`] or a missing dependency.
    pub async fn build_inventory(&self) -> Result<Arc<Inventory>, CartonError> {
        if let Some(inventory) = self.inventory.lock().expect("engine poisoned").clone() {
            return Ok(inventory);
        }
        let builder = self
            .builder
            .lock()
            .expect("engine poisoned")
            .take()
            .expect("inventory building already in progress");

        let inventory = Arc::new(builder.build(&CancellationToken::new()).await?);
        *self.inventory.lock().expect("engine poisoned") = Some(Arc::clone(&inventory));
        Ok(inventory)
    }

    /// The frozen inventory, if built.
    #[must_use]
    pub fn inventory(&self) -> Option<Arc<Inventory>> {
        self.inventory.lock().expect("engine poisoned").clone()
    }

    /// Build a loader named `tool`, building the inventory first if
    /// nothing has.
    ///
    /// # Errors
    ///
    /// Inventory validation failure, a held lockfile, or I/O failure
    /// preparing the build directory.
    pub async fn new_loader(&self, tool: &str) -> Result<Arc<Loader>, LoadError> {
        let inventory = self
            .build_inventory()
            .await
            .map_err(LoadError::Carton)?;
        Loader::new(self.settings(), inventory, tool)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("built", &self.inventory.lock().expect("engine poisoned").is_some())
            .finish()
    }
}
