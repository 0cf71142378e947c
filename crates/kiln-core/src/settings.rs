//! Global build settings.
//!
//! The process-wide configuration the Go heritage kept in package-level
//! variables, grouped into one explicitly constructed object. All keys
//! live in a [`Kv`] so recipes and the CLI can override them uniformly.
//!
//! Directory defaults, all under `TOPDIR`:
//!
//! ```text
//! BUILDIR    = TOPDIR/build
//! DLDIR      = BUILDIR/downloads
//! TMPDIR     = BUILDIR/tmp
//! BASEWKDIR  = TMPDIR/work
//! IMAGEDIR   = TMPDIR/deploy/image
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::kv::{Kv, Value};

/// Well-known setting names.
pub mod keys {
    /// Directory kiln was invoked from.
    pub const TOPDIR: &str = "TOPDIR";
    /// Top build directory.
    pub const BUILDIR: &str = "BUILDIR";
    /// Where source archives are downloaded.
    pub const DLDIR: &str = "DLDIR";
    /// Scratch space under the build directory.
    pub const TMPDIR: &str = "TMPDIR";
    /// Base of all per-carton work directories.
    pub const BASEWKDIR: &str = "BASEWKDIR";
    /// Where final images are deployed.
    pub const IMAGEDIR: &str = "IMAGEDIR";

    /// Build host architecture.
    pub const NATIVEARCH: &str = "NATIVEARCH";
    /// Build host operating system.
    pub const NATIVEOS: &str = "NATIVEOS";
    /// Build host vendor, empty by default.
    pub const NATIVEVENDOR: &str = "NATIVEVENDOR";

    /// Carton-scoped target architecture override.
    pub const TARGETARCH: &str = "TARGETARCH";

    /// Target machine name.
    pub const MACHINE: &str = "MACHINE";
    /// Target machine architecture; must be configured for cross builds.
    pub const MACHINEARCH: &str = "MACHINEARCH";
    /// Target machine OS.
    pub const MACHINEOS: &str = "MACHINEOS";
    /// Target machine vendor.
    pub const MACHINEVENDOR: &str = "MACHINEVENDOR";

    /// Per-stage timeout in seconds.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// Number of loader slots.
    pub const MAXLOADERS: &str = "MAXLOADERS";
}

/// Default per-stage timeout, seconds.
const DEFAULT_TIMEOUT_SECS: i64 = 600;

/// Global settings for one engine instance.
#[derive(Debug)]
pub struct Settings {
    kv: Kv,
}

impl Settings {
    /// Settings rooted at the current working directory.
    #[must_use]
    pub fn new() -> Self {
        let top = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_top_dir(&top)
    }

    /// Settings rooted at `top`, with every directory default derived
    /// from it. Tests use this to point a whole engine at a tempdir.
    #[must_use]
    pub fn with_top_dir(top: &Path) -> Self {
        let kv = Kv::new("settings");
        let build = top.join("build");
        let tmp = build.join("tmp");

        kv.set(keys::TOPDIR, path_str(top));
        kv.set(keys::BUILDIR, path_str(&build));
        kv.set(keys::DLDIR, path_str(&build.join("downloads")));
        kv.set(keys::TMPDIR, path_str(&tmp));
        kv.set(keys::BASEWKDIR, path_str(&tmp.join("work")));
        kv.set(keys::IMAGEDIR, path_str(&tmp.join("deploy").join("image")));

        kv.set(keys::NATIVEARCH, std::env::consts::ARCH);
        kv.set(keys::NATIVEOS, std::env::consts::OS);
        kv.set(keys::NATIVEVENDOR, "");

        kv.set(keys::MACHINEOS, "linux");
        kv.set(keys::MACHINEARCH, "");
        kv.set(keys::MACHINEVENDOR, "");

        kv.set(keys::TIMEOUT, DEFAULT_TIMEOUT_SECS);
        kv.set(keys::MAXLOADERS, default_loaders());

        Self { kv }
    }

    /// The underlying key-value store.
    #[must_use]
    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    /// Set a setting, overriding the default.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.kv.set(key, value);
    }

    /// String value of `key`, empty when unset.
    #[must_use]
    pub fn get_str(&self, key: &str) -> String {
        self.kv.get_str(key)
    }

    /// Directory value of `key` as a path.
    #[must_use]
    pub fn dir(&self, key: &str) -> PathBuf {
        PathBuf::from(self.kv.get_str(key))
    }

    /// The per-stage timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        let secs = self
            .kv
            .get(keys::TIMEOUT)
            .and_then(|v| v.as_int())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Duration::from_secs(secs.max(1) as u64)
    }

    /// Number of loader slots.
    #[must_use]
    pub fn max_loaders(&self) -> usize {
        self.kv
            .get(keys::MAXLOADERS)
            .and_then(|v| v.as_int())
            .map_or_else(|| default_loaders() as usize, |n| n.max(1) as usize)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

fn default_loaders() -> i64 {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    (2 * cpus) as i64
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_defaults_hang_off_top_dir() {
        let s = Settings::with_top_dir(Path::new("/work/project"));
        assert_eq!(s.get_str(keys::BUILDIR), "/work/project/build");
        assert_eq!(s.get_str(keys::DLDIR), "/work/project/build/downloads");
        assert_eq!(s.get_str(keys::BASEWKDIR), "/work/project/build/tmp/work");
        assert_eq!(
            s.get_str(keys::IMAGEDIR),
            "/work/project/build/tmp/deploy/image"
        );
    }

    #[test]
    fn test_machine_arch_unset_by_default() {
        let s = Settings::with_top_dir(Path::new("/x"));
        assert_eq!(s.get_str(keys::MACHINEARCH), "");
        assert_eq!(s.get_str(keys::MACHINEOS), "linux");
        assert!(!s.get_str(keys::NATIVEARCH).is_empty());
    }

    #[test]
    fn test_timeout_override() {
        let s = Settings::with_top_dir(Path::new("/x"));
        assert_eq!(s.timeout(), Duration::from_secs(600));
        s.set(keys::TIMEOUT, 5);
        assert_eq!(s.timeout(), Duration::from_secs(5));
    }
}
