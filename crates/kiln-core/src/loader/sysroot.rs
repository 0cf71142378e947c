//! The built-in sysroot task.
//!
//! Hard-links the packaged output of every build dependency (direct
//! and transitive) into the consuming carton's `sysroot/` tree, or
//! `sysroot-native/` for native dependencies. Cross dependencies
//! contribute their `-dev` package.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::carton::{Builder, Carton, Inventory};
use crate::context::Context;
use crate::loader::paths;
use crate::runbook::RunbookError;
use crate::settings::Settings;

struct Required {
    carton: Arc<Carton>,
    is_native: bool,
}

/// Collect the transitive build-dependency tree. Native-ness is
/// inherited downwards: everything under a native dependency stages
/// natively too.
fn dep_tree(inventory: &Inventory, root: &Arc<Carton>, is_native: bool) -> HashMap<String, Required> {
    let mut tree = HashMap::new();
    walk(inventory, root, is_native, &mut tree);
    tree
}

fn walk(
    inventory: &Inventory,
    carton: &Arc<Carton>,
    is_native: bool,
    tree: &mut HashMap<String, Required>,
) {
    for dep in carton.build_depends() {
        let name = dep.split('@').next().unwrap_or(&dep);
        let Ok(found) = inventory.find(name) else {
            continue;
        };
        let native = is_native || found.is_native;
        let Ok(target) = inventory.resolve(name) else {
            continue;
        };
        if tree
            .insert(
                dep.clone(),
                Required {
                    carton: Arc::clone(&target),
                    is_native: native,
                },
            )
            .is_none()
        {
            walk(inventory, &target, native, tree);
        }
    }
}

/// Stage every build dependency's packages into this carton's sysroot.
///
/// # Errors
///
/// The first staging failure.
pub(super) async fn prepare_sysroot(ctx: Arc<Context>) -> Result<(), RunbookError> {
    let loader = ctx.loader();
    let inventory = loader.inventory();
    let settings: Arc<Settings> = loader.settings();

    let root = inventory.resolve(ctx.carton().provider())?;
    let dest = ctx.work_dir().join("sysroot");

    let mut group: JoinSet<Result<(), RunbookError>> = JoinSet::new();
    for (_, req) in dep_tree(&inventory, &root, ctx.is_native()) {
        let wd = paths::work_dir(req.carton.as_ref(), &settings, req.is_native)?;
        let mut from: PathBuf = wd.join("packages");
        let sysroot = if req.is_native {
            PathBuf::from(format!("{}-native", dest.display()))
        } else {
            dest.clone()
        };
        let name = if req.is_native {
            req.carton.provider().to_string()
        } else {
            format!("{}-dev", req.carton.provider())
        };
        from.push(name);

        group.spawn_blocking(move || {
            crate::staging::stage(&from, &sysroot)?;
            Ok(())
        });
    }

    while let Some(joined) = group.join_next().await {
        joined.map_err(|_| RunbookError::Cancelled)??;
    }
    Ok(())
}
