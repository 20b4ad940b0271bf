//! Filesystem engine seam.
//!
//! The bundle tree is served by an external FUSE filesystem that reads
//! metadata from the materialized store and file contents from a
//! content-addressed storage backend. This module defines what the bundle
//! controller needs from such an engine ([`Filesystem`], [`MountHandle`]) and
//! ships [`FuseDaemon`], which drives an engine running as a separate daemon
//! process.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace, warn};
use url::Url;

use super::mounts::{MountProbe, MountpointCommand};
use crate::error::EngineError;

/// Default filesystem daemon binary.
pub const DEFAULT_DAEMON: &str = "g8ufs";

/// Default time to wait for the daemon to expose the mount, and to exit after
/// the mount is detached.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to a materialized metadata store directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    /// Opens the metadata store at `path`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::MetaStore` if `path` is not a directory.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if !path.is_dir() {
            return Err(EngineError::MetaStore {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Directory of the store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Handle to a content-addressed storage backend.
///
/// The locator is opaque to this crate beyond being a URL with a scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    url: Url,
}

impl Storage {
    /// Opens the storage backend at `locator` (e.g. `zdb://hub.grid.tf:9900`).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Storage` if the locator is not a URL.
    pub fn open(locator: &str) -> Result<Self, EngineError> {
        let url = Url::parse(locator).map_err(|e| EngineError::Storage {
            locator: locator.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { url })
    }

    /// Locator of the backend.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Everything the engine needs to mount a bundle.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Backend (work) directory the engine writes file contents to.
    pub backend: PathBuf,
    /// Mount point.
    pub target: PathBuf,
    /// Metadata store describing the tree.
    pub meta: MetaStore,
    /// Storage backend supplying file contents.
    pub storage: Storage,
    /// Content cache shared across bundles.
    pub cache: PathBuf,
}

/// A filesystem engine able to mount bundles.
pub trait Filesystem: Send + Sync {
    /// Mounts a bundle and returns a handle to the live mount.
    fn mount(&self, options: MountOptions) -> Result<Box<dyn MountHandle>, EngineError>;
}

/// A live mount produced by a [`Filesystem`].
pub trait MountHandle: Send {
    /// Unmounts the bundle.
    fn unmount(&mut self) -> Result<(), EngineError>;

    /// Blocks until the mount terminates.
    fn wait(&mut self) -> Result<(), EngineError>;
}

/// Engine that runs a FUSE daemon as a child process.
///
/// The daemon is invoked as
/// `<binary> --backend <dir> --meta <dir> --storage-url <url> --cache <dir> <target>`
/// and is considered mounted once the target becomes a mount point. The same
/// timeout bounds how long [`MountHandle::unmount`] waits for the daemon to
/// exit before killing it.
pub struct FuseDaemon {
    binary: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    probe: Box<dyn MountProbe>,
}

impl FuseDaemon {
    /// Creates an engine running `binary`.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_MOUNT_TIMEOUT,
            poll_interval: Duration::from_millis(50),
            probe: Box::new(MountpointCommand),
        }
    }

    /// Sets how long to wait for the mount to appear or the daemon to exit.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the readiness poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replaces the mountpoint probe used for readiness.
    #[must_use]
    pub fn with_probe(mut self, probe: impl MountProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    fn command(&self, options: &MountOptions) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--backend")
            .arg(&options.backend)
            .arg("--meta")
            .arg(options.meta.path())
            .arg("--storage-url")
            .arg(options.storage.url().as_str())
            .arg("--cache")
            .arg(&options.cache)
            .arg(&options.target)
            .stdin(Stdio::null());
        cmd
    }
}

impl Default for FuseDaemon {
    fn default() -> Self {
        Self::new(DEFAULT_DAEMON)
    }
}

impl fmt::Debug for FuseDaemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuseDaemon")
            .field("binary", &self.binary)
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Filesystem for FuseDaemon {
    #[instrument(skip_all, fields(binary = %self.binary.display(), target = %options.target.display()))]
    fn mount(&self, options: MountOptions) -> Result<Box<dyn MountHandle>, EngineError> {
        let mut child = self
            .command(&options)
            .spawn()
            .map_err(|e| EngineError::Spawn {
                binary: self.binary.display().to_string(),
                source: e,
            })?;
        debug!(pid = child.id(), "Spawned filesystem daemon");

        // Wait until the target is mounted, the daemon dies, or we time out.
        let start = Instant::now();
        loop {
            if self.probe.is_mounted(&options.target) {
                debug!(elapsed_ms = %start.elapsed().as_millis(), "Bundle filesystem mounted");
                return Ok(Box::new(FuseDaemonHandle {
                    target: options.target,
                    child,
                    exit: None,
                    timeout: self.timeout,
                    poll_interval: self.poll_interval,
                }));
            }

            match child.try_wait() {
                Ok(Some(status)) => return Err(EngineError::Exited { status }),
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineError::Io {
                        context: "failed to poll filesystem daemon".to_string(),
                        source: e,
                    });
                }
            }

            if start.elapsed() > self.timeout {
                warn!("Filesystem daemon did not mount in time, killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::Timeout {
                    target: options.target,
                    timeout_ms: self.timeout.as_millis(),
                });
            }

            std::thread::sleep(self.poll_interval);
        }
    }
}

/// Live mount served by a [`FuseDaemon`] child.
///
/// Dropping a handle that was neither unmounted nor waited on detaches the
/// target and kills the daemon.
#[derive(Debug)]
pub struct FuseDaemonHandle {
    target: PathBuf,
    child: Child,
    exit: Option<ExitStatus>,
    timeout: Duration,
    poll_interval: Duration,
}

impl FuseDaemonHandle {
    /// Waits up to `timeout` for the daemon to exit, then kills it.
    fn reap_within(&mut self, timeout: Duration) -> Result<ExitStatus, EngineError> {
        if let Some(status) = self.exit {
            return Ok(status);
        }

        let start = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    trace!(%status, "Filesystem daemon exited");
                    self.exit = Some(status);
                    return Ok(status);
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(EngineError::Io {
                        context: "failed to poll filesystem daemon".to_string(),
                        source: e,
                    });
                }
            }

            if start.elapsed() > timeout {
                warn!(pid = self.child.id(), "Filesystem daemon did not exit in time, killing it");
                let _ = self.child.kill();
                return self.reap();
            }

            std::thread::sleep(self.poll_interval);
        }
    }

    fn reap(&mut self) -> Result<ExitStatus, EngineError> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().map_err(|e| EngineError::Io {
            context: "failed to wait for filesystem daemon".to_string(),
            source: e,
        })?;
        trace!(%status, "Filesystem daemon exited");
        self.exit = Some(status);
        Ok(status)
    }
}

impl MountHandle for FuseDaemonHandle {
    #[instrument(skip_all, fields(target = %self.target.display()))]
    fn unmount(&mut self) -> Result<(), EngineError> {
        // Already gone, e.g. detached externally and reaped by wait().
        if self.exit.is_some() {
            return Ok(());
        }

        nix::mount::umount2(&self.target, nix::mount::MntFlags::MNT_DETACH).map_err(|e| {
            EngineError::Unmount {
                target: self.target.clone(),
                source: e,
            }
        })?;

        // The daemon exits on its own once the kernel drops the FUSE connection.
        self.reap_within(self.timeout)?;
        debug!("Bundle filesystem unmounted");
        Ok(())
    }

    fn wait(&mut self) -> Result<(), EngineError> {
        let status = self.reap()?;
        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Exited { status })
        }
    }
}

impl Drop for FuseDaemonHandle {
    fn drop(&mut self) {
        if self.exit.is_some() {
            return;
        }

        warn!(mount = %self.target.display(), "Dropping live bundle mount, killing filesystem daemon");
        if let Err(e) = nix::mount::umount2(&self.target, nix::mount::MntFlags::MNT_DETACH) {
            debug!(error = %e, "Could not detach bundle mount");
        }
        let _ = self.child.kill();
        if let Err(e) = self.reap() {
            warn!(error = %e, "Could not reap filesystem daemon");
        }
    }
}
