//! Compiled-in recipes.
//!
//! Recipes are ordinary code registering cartons against the engine;
//! a deployment links its own recipe crate here. These two ship as a
//! working starting point.

use kiln_core::Engine;

/// Register the built-in recipes.
pub fn register(engine: &Engine) {
    engine.new_carton("busybox", file!(), |c| {
        c.desc = "The Swiss Army Knife of Embedded Linux".to_string();
        c.homepage = "https://busybox.net".to_string();
        c.resource().push_http(
            "1.32.0",
            "https://busybox.net/downloads/busybox-1.32.0.tar.bz2#c35d87f1d04b2b153d33c275c2632e40d388a88f19a9e71727e0bbbff51fe689",
        );
        let rb = c.runbook().clone();
        if let Some(build) = rb.stage(kiln_core::carton::BUILD) {
            let _ = build.add_task(
                0,
                kiln_core::Task::script("make defconfig && make -j$(nproc)"),
            );
        }
        if let Some(install) = rb.stage(kiln_core::carton::INSTALL) {
            let _ = install.add_task(
                0,
                kiln_core::Task::script("make CONFIG_PREFIX=$D install"),
            );
        }
    });

    engine.new_carton("zlib", file!(), |c| {
        c.desc = "A massively spiffy yet delicately unobtrusive compression library".to_string();
        c.homepage = "https://zlib.net".to_string();
        c.depends_on("busybox");
        c.resource().push_http(
            "1.2.11",
            "https://zlib.net/fossils/zlib-1.2.11.tar.gz#c3e5e9fdd5004dcb542feda5ee4f0ff0744628baf8ed2dd5d66f8ca1197cb1a1",
        );
        let rb = c.runbook().clone();
        if let Some(build) = rb.stage(kiln_core::carton::BUILD) {
            let _ = build.add_task(
                0,
                kiln_core::Task::script("./configure --prefix=/usr && make -j$(nproc)"),
            );
        }
        if let Some(install) = rb.stage(kiln_core::carton::INSTALL) {
            let _ = install.add_task(0, kiln_core::Task::script("make DESTDIR=$D install"));
        }
    });
}
