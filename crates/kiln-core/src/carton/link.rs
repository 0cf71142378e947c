//! Virtual cartons.
//!
//! A link is a named alias over a real carton: one recipe providing
//! several names, or an explicit re-link. Every query forwards to the
//! underlying carton except the carton name, which answers with the
//! alias.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Builder, Carton};
use crate::fetch::Resource;
use crate::kv::Kv;
use crate::runbook::Runbook;

/// A named alias delegating to a real carton.
#[derive(Debug)]
pub struct Link {
    alias: String,
    carton: Arc<Carton>,
    from: Vec<String>,
}

impl Link {
    /// Create a link named `alias` over `carton`.
    #[must_use]
    pub fn new(alias: &str, carton: Arc<Carton>, from: Vec<String>) -> Self {
        Self {
            alias: alias.to_string(),
            carton,
            from,
        }
    }

    /// The real carton behind this alias.
    #[must_use]
    pub fn target(&self) -> &Arc<Carton> {
        &self.carton
    }
}

impl Builder for Link {
    fn provider(&self) -> &str {
        self.carton.provider()
    }

    fn carton_name(&self) -> &str {
        &self.alias
    }

    fn from_files(&self) -> Vec<String> {
        if self.from.is_empty() {
            self.carton.from_files()
        } else {
            self.from.clone()
        }
    }

    fn build_depends(&self) -> Vec<String> {
        self.carton.build_depends()
    }

    fn depends(&self) -> Vec<String> {
        self.carton.depends()
    }

    fn runbook(&self) -> Arc<Runbook> {
        self.carton.runbook().clone()
    }

    fn resource(&self) -> Arc<Resource> {
        self.carton.resource().clone()
    }

    fn files_path(&self) -> Vec<PathBuf> {
        Builder::files_path(self.carton.as_ref())
    }

    fn kv(&self) -> &Kv {
        Builder::kv(self.carton.as_ref())
    }

    fn src_dir(&self, wd: &Path) -> Option<PathBuf> {
        self.carton.src_dir(wd)
    }

    fn summary(&self) -> String {
        self.carton.summary()
    }
}
