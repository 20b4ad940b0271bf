//! Bundle lifecycle controller.
//!
//! A [`Chroot`] owns one bundle: it fetches and materializes the metadata,
//! asks the filesystem engine to mount it, and integrates the mounted tree
//! with the host so it can serve as a chroot.
//!
//! # Lifecycle
//!
//! ```text
//! Unmounted --start--> Mounted --prepare--> Integrated
//!     ^                                         |
//!     +-------- unmount <-- unprepare <--stop---+
//! ```
//!
//! Calls on one instance must be serialized by the caller. Two controllers
//! sharing an ID race; the mountpoint probe in [`Chroot::start`] only catches
//! the common case.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::BundleSpec;
use super::engine::{Filesystem, FuseDaemon, MetaStore, MountHandle, MountOptions, Storage};
use super::mounts::{
    self, HOST_BINDS, HOST_RESOLV_CONF, MountProbe, MountpointCommand, bind_host_filesystems,
    unbind_host_filesystems,
};
use super::paths::MountPaths;
use crate::error::BundleError;
use crate::{fetch, materialize};

/// Controller for a single bundle.
///
/// # Example
///
/// ```no_run
/// use zbundle::bundle::{BundleSpec, Chroot};
///
/// let spec = BundleSpec::new(
///     "web",
///     "https://hub.grid.tf/tf-official-apps/ubuntu.flist",
///     "zdb://hub.grid.tf:9900",
/// )
/// .unwrap();
///
/// let mut bundle = Chroot::new(spec, "/root");
/// bundle.start().unwrap();
/// // ... run something under bundle.mount_root() ...
/// bundle.stop().unwrap();
/// ```
pub struct Chroot {
    spec: BundleSpec,
    paths: MountPaths,
    resolv_conf: PathBuf,
    host_binds: Vec<String>,
    filesystem: Box<dyn Filesystem>,
    probe: Box<dyn MountProbe>,
    handle: Option<Box<dyn MountHandle>>,
}

impl Chroot {
    /// Creates a controller for `spec`, deriving every path under `home`.
    ///
    /// The default engine is a [`FuseDaemon`] and the default probe is
    /// [`MountpointCommand`].
    #[must_use]
    pub fn new(spec: BundleSpec, home: impl AsRef<Path>) -> Self {
        let paths = MountPaths::new(home.as_ref(), spec.id());
        Self {
            spec,
            paths,
            resolv_conf: PathBuf::from(HOST_RESOLV_CONF),
            host_binds: HOST_BINDS.iter().map(|s| (*s).to_string()).collect(),
            filesystem: Box::new(FuseDaemon::default()),
            probe: Box::new(MountpointCommand),
            handle: None,
        }
    }

    /// Replaces the filesystem engine.
    #[must_use]
    pub fn with_filesystem(mut self, filesystem: impl Filesystem + 'static) -> Self {
        self.filesystem = Box::new(filesystem);
        self
    }

    /// Replaces the mountpoint probe used to detect a running bundle.
    #[must_use]
    pub fn with_probe(mut self, probe: impl MountProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Sets the host resolver file copied into the bundle.
    #[must_use]
    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    /// Sets the host directories (relative to `/`) bind-mounted into the
    /// bundle, replacing [`HOST_BINDS`].
    #[must_use]
    pub fn with_host_binds(mut self, binds: &[&str]) -> Self {
        self.host_binds = binds.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// The bundle this controller manages.
    #[must_use]
    pub fn spec(&self) -> &BundleSpec {
        &self.spec
    }

    /// Mount point of the bundle, `~/.zbundle/{id}`.
    #[must_use]
    pub fn mount_root(&self) -> &Path {
        &self.paths.mount_root
    }

    /// Backend directory of the filesystem engine, `~/.zbundle.wd/{id}`.
    #[must_use]
    pub fn work_root(&self) -> &Path {
        &self.paths.work_root
    }

    /// Content cache shared across bundles, `~/.zbundle.cache`.
    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.paths.cache_root
    }

    /// Returns true while this controller holds a live mount.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Fetches, mounts and integrates the bundle.
    ///
    /// If integration fails after the mount succeeded, the mount is kept and
    /// the caller must still call [`stop`](Self::stop). Directories created
    /// before a failure are left in place.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `BundleError::AlreadyRunning` if the mount root is already mounted
    /// - `BundleError::Fetch` / `BundleError::Materialize` if the metadata cannot be obtained
    /// - `BundleError::MountFailed` if the engine cannot mount the bundle
    /// - `BundleError::Prepare` if a host bind mount fails
    #[instrument(skip(self), fields(id = %self.spec.id()))]
    pub fn start(&mut self) -> Result<(), BundleError> {
        if self.handle.is_some() || self.probe.is_mounted(&self.paths.mount_root) {
            return Err(BundleError::AlreadyRunning {
                id: self.spec.id().to_string(),
                mount_root: self.paths.mount_root.clone(),
            });
        }

        fs::create_dir_all(&self.paths.mount_root).map_err(|e| BundleError::Io {
            context: format!(
                "failed to create mount root {}",
                self.paths.mount_root.display()
            ),
            source: e,
        })?;

        if materialize::discard(&self.paths.work_root)? {
            warn!(meta = %self.paths.meta_dir.display(), "Removed stale metadata store");
        }

        let stream = fetch::fetch(self.spec.archive())?;
        let meta_dir = materialize::materialize(&self.paths.work_root, stream)?;

        let options = MountOptions {
            backend: self.paths.work_root.clone(),
            target: self.paths.mount_root.clone(),
            meta: MetaStore::open(&meta_dir)?,
            storage: Storage::open(self.spec.storage())?,
            cache: self.paths.cache_root.clone(),
        };

        let handle = self.filesystem.mount(options)?;
        self.handle = Some(handle);
        debug!(mount_root = %self.paths.mount_root.display(), "Bundle mounted");

        self.prepare()?;
        info!(mount_root = %self.paths.mount_root.display(), "Bundle started");
        Ok(())
    }

    /// Tears the bundle down.
    ///
    /// The metadata store is removed on every path out of this method, even if
    /// unmounting fails. Bind teardown errors are ignored. If the engine fails
    /// to unmount, the mount is kept and `stop` may be called again.
    ///
    /// # Errors
    ///
    /// Returns `BundleError::NotRunning` if the bundle was never mounted, or
    /// `BundleError::MountFailed` if the engine fails to unmount.
    #[instrument(skip(self), fields(id = %self.spec.id()))]
    pub fn stop(&mut self) -> Result<(), BundleError> {
        if self.handle.is_none() {
            return Err(BundleError::NotRunning {
                id: self.spec.id().to_string(),
            });
        }

        let _meta = DiscardMeta(&self.paths.work_root);

        self.unprepare();
        if let Some(handle) = self.handle.as_mut() {
            handle.unmount()?;
        }
        self.handle = None;

        info!("Bundle stopped");
        Ok(())
    }

    /// Blocks until the bundle filesystem terminates.
    ///
    /// # Errors
    ///
    /// Returns `BundleError::NotRunning` if the bundle was never mounted, or
    /// `BundleError::MountFailed` with the engine's termination error.
    #[instrument(skip(self), fields(id = %self.spec.id()))]
    pub fn wait(&mut self) -> Result<(), BundleError> {
        let handle = self.handle.as_mut().ok_or_else(|| BundleError::NotRunning {
            id: self.spec.id().to_string(),
        })?;
        handle.wait()?;
        debug!("Bundle filesystem terminated");
        Ok(())
    }

    fn prepare(&self) -> Result<(), BundleError> {
        let root = &self.paths.mount_root;
        bind_host_filesystems(root, &self.host_binds)?;
        mounts::copy_resolver_config_best_effort(&self.resolv_conf, root);
        Ok(())
    }

    fn unprepare(&self) {
        unbind_host_filesystems(&self.paths.mount_root, &self.host_binds);
    }
}

impl std::fmt::Debug for Chroot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chroot")
            .field("spec", &self.spec)
            .field("paths", &self.paths)
            .field("host_binds", &self.host_binds)
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

/// Removes the metadata store of a work root when dropped.
struct DiscardMeta<'a>(&'a Path);

impl Drop for DiscardMeta<'_> {
    fn drop(&mut self) {
        match materialize::discard(self.0) {
            Ok(true) => debug!("Removed metadata store"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to remove metadata store"),
        }
    }
}
