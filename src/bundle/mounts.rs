//! Host integration mounts for a bundle root.
//!
//! After the bundle filesystem is mounted, the host's kernel filesystems are
//! bind-mounted into it so the chrooted entry point sees a usable `/proc`,
//! `/dev` and `/sys`, and the host resolver configuration is copied in.
//!
//! # Failure policy
//!
//! - Bind mounts are hard requirements; the first failure is returned.
//! - Resolver copy and bind teardown are best-effort: failures are logged and
//!   swallowed since the bundle works (or is discarded) either way.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, instrument, trace, warn};

use crate::error::MountError;

/// Host directories bind-mounted into every bundle root, in mount order.
pub const HOST_BINDS: &[&str] = &["proc", "dev", "sys"];

/// Host resolver configuration copied into the bundle.
pub const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Answers whether a path is currently a mount point.
///
/// Probes are advisory: two bundles racing on the same ID can both observe
/// "not mounted".
pub trait MountProbe: Send + Sync {
    /// Returns true if `path` is an active mount point.
    fn is_mounted(&self, path: &Path) -> bool;
}

/// Probe backed by the `mountpoint -q` utility.
#[derive(Debug, Clone, Default)]
pub struct MountpointCommand;

impl MountProbe for MountpointCommand {
    fn is_mounted(&self, path: &Path) -> bool {
        Command::new("mountpoint")
            .arg("-q")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Creates a read-write bind mount of `source` on `target`.
///
/// # Errors
///
/// Returns `MountError::BindMount` if the mount operation fails.
#[instrument(skip_all, fields(source = %source.display(), target = %target.display()))]
pub fn bind_mount(source: &Path, target: &Path) -> Result<(), MountError> {
    trace!("Creating bind mount");

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| MountError::BindMount {
        source_path: source.to_path_buf(),
        target: target.to_path_buf(),
        source: e,
    })?;

    trace!("Bind mount created");
    Ok(())
}

/// Force-unmounts `target`, detaching it lazily if it is busy.
///
/// # Errors
///
/// Returns `MountError::Unmount` if the unmount fails.
#[instrument(skip_all, fields(target = %target.display()))]
pub fn unmount_detached(target: &Path) -> Result<(), MountError> {
    umount2(target, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH).map_err(|e| {
        MountError::Unmount {
            target: target.to_path_buf(),
            source: e,
        }
    })?;

    debug!("Filesystem detached");
    Ok(())
}

/// Bind-mounts each host directory in `binds` (relative to `/`) into `root`.
///
/// Stops at the first failure; remaining binds are not attempted.
///
/// # Errors
///
/// Returns `MountError::Io` if a mount point cannot be created, or
/// `MountError::BindMount` if a bind fails.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn bind_host_filesystems<S: AsRef<str>>(root: &Path, binds: &[S]) -> Result<(), MountError> {
    for name in binds {
        let name = name.as_ref();
        let target = root.join(name);
        fs::create_dir_all(&target).map_err(|e| MountError::Io {
            context: format!("failed to create mount point {}", target.display()),
            source: e,
        })?;

        bind_mount(&Path::new("/").join(name), &target)?;
    }

    debug!("Host filesystems bound");
    Ok(())
}

/// Detaches each of `binds` under `root`, in reverse mount order.
///
/// Best-effort: failures are logged and ignored.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn unbind_host_filesystems<S: AsRef<str>>(root: &Path, binds: &[S]) {
    for name in binds.iter().rev() {
        let target = root.join(name.as_ref());
        if let Err(e) = unmount_detached(&target) {
            debug!(error = %e, "Ignoring bind teardown failure");
        }
    }
}

/// Copies the host resolver configuration `host` into `<root>/etc/resolv.conf`.
///
/// Best-effort: a missing or unreadable host file, or a failed write, is logged
/// and ignored. Returns the written path when the copy happened.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn copy_resolver_config_best_effort(host: &Path, root: &Path) -> Option<PathBuf> {
    let etc = root.join("etc");
    if let Err(e) = fs::create_dir_all(&etc) {
        warn!(error = %e, "Could not create etc in bundle, skipping resolver copy");
        return None;
    }

    let content = match fs::read(host) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(host = %host.display(), "Host has no resolver configuration");
            return None;
        }
        Err(e) => {
            warn!(host = %host.display(), error = %e, "Could not read host resolver configuration");
            return None;
        }
    };

    let target = etc.join("resolv.conf");
    match fs::write(&target, content) {
        Ok(()) => {
            trace!(target = %target.display(), "Copied resolver configuration");
            Some(target)
        }
        Err(e) => {
            warn!(target = %target.display(), error = %e, "Could not write resolver configuration");
            None
        }
    }
}
