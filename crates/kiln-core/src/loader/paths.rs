//! Work-directory derivation and stage markers.
//!
//! A carton's work directory is
//! `BASEWKDIR/<arch>[-<vendor>][-<os>]/<provider>[-native]/<version>`.
//! Native builds take the host's fixed attributes; cross builds take
//! the carton-scoped `TARGETARCH` if set, else the global machine
//! configuration.

use std::path::{Path, PathBuf};

use tracing::trace;

use crate::carton::{Builder, NATIVE_SUFFIX};
use crate::context::ContextError;
use crate::settings::{keys, Settings};

/// The target architecture for `carton`.
///
/// # Errors
///
/// [`ContextError::MissingMachineArch`] when a cross build has
/// neither a carton-scoped `TARGETARCH` nor a global `MACHINEARCH`.
pub fn target_arch(
    carton: &dyn Builder,
    settings: &Settings,
    is_native: bool,
) -> Result<String, ContextError> {
    if is_native {
        return Ok(settings.get_str(keys::NATIVEARCH));
    }
    let arch = carton.kv().get_str(keys::TARGETARCH);
    if !arch.is_empty() {
        return Ok(arch);
    }
    let arch = settings.get_str(keys::MACHINEARCH);
    if arch.is_empty() {
        return Err(ContextError::MissingMachineArch);
    }
    Ok(arch)
}

/// The target operating system.
#[must_use]
pub fn target_os(settings: &Settings, is_native: bool) -> String {
    if is_native {
        settings.get_str(keys::NATIVEOS)
    } else {
        settings.get_str(keys::MACHINEOS)
    }
}

/// The target vendor, possibly empty.
#[must_use]
pub fn target_vendor(settings: &Settings, is_native: bool) -> String {
    if is_native {
        settings.get_str(keys::NATIVEVENDOR)
    } else {
        settings.get_str(keys::MACHINEVENDOR)
    }
}

/// The work directory for `(carton, is_native)`.
///
/// # Errors
///
/// Target-architecture resolution failure.
pub fn work_dir(
    carton: &dyn Builder,
    settings: &Settings,
    is_native: bool,
) -> Result<PathBuf, ContextError> {
    let mut triple = target_arch(carton, settings, is_native)?;
    let vendor = target_vendor(settings, is_native);
    if !vendor.is_empty() {
        triple.push('-');
        triple.push_str(&vendor);
    }
    let os = target_os(settings, is_native);
    if !os.is_empty() {
        triple.push('-');
        triple.push_str(&os);
    }

    let mut pn = carton.provider().to_string();
    if is_native {
        pn.push_str(NATIVE_SUFFIX);
    }

    Ok(settings
        .dir(keys::BASEWKDIR)
        .join(triple)
        .join(pn)
        .join(carton.resource().version()))
}

/// Path of the completion marker for `stage` under the temp dir.
#[must_use]
pub fn stage_marker(temp_dir: &Path, stage: &str) -> PathBuf {
    temp_dir.join(format!("{stage}.done"))
}

/// Whether `stage` left a completion marker in a prior run.
#[must_use]
pub fn is_stage_played(temp_dir: &Path, stage: &str) -> bool {
    let done = stage_marker(temp_dir, stage);
    if done.exists() {
        trace!(stage, "had been played, skip it");
        return true;
    }
    false
}

/// Create (`played`) or delete (`!played`) the stage marker.
pub fn mark_stage_played(temp_dir: &Path, stage: &str, played: bool) {
    let done = stage_marker(temp_dir, stage);
    if played {
        if crate::fsutil::touch(&done).is_ok() {
            trace!(stage, "marked as played");
        }
    } else {
        let _ = std::fs::remove_file(&done);
    }
}
