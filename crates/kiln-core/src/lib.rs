//! # kiln-core
//!
//! Core engine for kiln, a parallel source-build orchestrator: given a
//! named *carton* (a build recipe), it resolves the carton's
//! dependency graph, fetches sources from upstream (HTTP archives,
//! VCS repositories, local files), applies patches, and drives each
//! carton through an ordered *runbook* of stages (fetch → patch →
//! prepare → build → install → package), producing staged output
//! directories later cartons consume.
//!
//! ## Shape of a build
//!
//! - **Carton**: one build recipe, registered into the [`carton::Inventory`].
//! - **Runbook**: the carton's ordered stage sequence plus detachable
//!   task forces ([`runbook::Runbook`]).
//! - **Loader**: the bounded-parallel scheduler that walks the
//!   dependency graph and drives runbooks ([`loader::Loader`]).
//! - **Engine**: explicit construction of the whole universe
//!   ([`engine::Engine`]).
//!
//! ## Example
//!
//! ```rust,no_run
//! use kiln_core::{Engine, Settings};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(Settings::new());
//! engine.new_carton("zlib", file!(), |c| {
//!     c.desc = "compression library".to_string();
//!     c.resource().push_http(
//!         "1.2.11",
//!         "https://zlib.net/zlib-1.2.11.tar.gz#c3e5e9fdd5004dcb542feda5ee4f0ff0744628baf8ed2dd5d66f8ca1197cb1a1",
//!     );
//! });
//!
//! let loader = engine.new_loader("kiln").await?;
//! loader.run(&["zlib".to_string()], false, false).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]

pub mod carton;
pub mod context;
pub mod engine;
pub mod fetch;
pub mod fsutil;
pub mod kv;
pub mod loader;
pub mod pool;
pub mod runbook;
pub mod settings;
pub mod staging;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::carton::{Builder, Carton, CartonError, Inventory};
    pub use crate::context::Context;
    pub use crate::engine::Engine;
    pub use crate::loader::{LoadError, Loader};
    pub use crate::runbook::{Runbook, Stage, Task, TaskKey};
    pub use crate::settings::Settings;
}

/// Re-export commonly used types at the crate root.
pub use carton::{Builder, Carton, CartonError, Inventory};
pub use context::Context;
pub use engine::Engine;
pub use loader::{LoadError, Loader};
pub use runbook::{Runbook, RunbookError, Stage, Task, TaskKey};
pub use settings::Settings;
