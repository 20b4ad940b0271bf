//! Host requirement checks.

use std::env;
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::geteuid;
use tracing::debug;

use crate::error::{Result, SystemRequirementsError};

/// FUSE character device the filesystem daemon opens.
pub const FUSE_DEVICE: &str = "/dev/fuse";

/// Utility used to probe mount points.
pub const MOUNTPOINT_BINARY: &str = "mountpoint";

/// Results of all host checks.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Effective user ID
    pub euid: u32,
    /// Path of the FUSE device
    pub fuse_device: PathBuf,
    /// Resolved `mountpoint` utility
    pub mountpoint: PathBuf,
    /// Resolved filesystem daemon
    pub fs_binary: PathBuf,
}

/// Runs every check, failing on the first unmet requirement.
///
/// `fs_binary` is the filesystem daemon that will serve bundles; a name
/// without `/` is looked up on `PATH`.
pub fn check_all(fs_binary: &str) -> Result<SystemRequirements> {
    let euid = check_root()?;
    let fuse_device = check_fuse()?;
    let mountpoint = check_binary(MOUNTPOINT_BINARY)?;
    let fs_binary = check_binary(fs_binary)?;

    let reqs = SystemRequirements {
        euid,
        fuse_device,
        mountpoint,
        fs_binary,
    };
    debug!(?reqs, "Host requirements satisfied");
    Ok(reqs)
}

/// Checks that the process runs with an effective UID of 0.
///
/// # Errors
///
/// Returns `SystemRequirementsError::NotRoot` otherwise.
pub fn check_root() -> Result<u32> {
    let euid = geteuid();
    if !euid.is_root() {
        return Err(SystemRequirementsError::NotRoot {
            uid: euid.as_raw(),
        }
        .into());
    }
    Ok(euid.as_raw())
}

/// Checks that the FUSE device exists.
///
/// # Errors
///
/// Returns `SystemRequirementsError::FuseUnavailable` if it does not.
pub fn check_fuse() -> Result<PathBuf> {
    let path = PathBuf::from(FUSE_DEVICE);
    if !path.exists() {
        return Err(SystemRequirementsError::FuseUnavailable { path }.into());
    }
    Ok(path)
}

/// Resolves `name` to an executable.
///
/// # Errors
///
/// Returns `SystemRequirementsError::BinaryNotFound` if it cannot be found.
pub fn check_binary(name: &str) -> Result<PathBuf> {
    let path_var = env::var_os("PATH").unwrap_or_default();
    find_executable(name, &path_var).ok_or_else(|| {
        SystemRequirementsError::BinaryNotFound {
            name: name.to_string(),
        }
        .into()
    })
}

/// Looks `name` up in the `PATH`-style list `path_var`.
///
/// Names containing `/` are checked as given.
fn find_executable(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
