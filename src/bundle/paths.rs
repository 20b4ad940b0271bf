//! Filesystem layout for a bundle.
//!
//! Every path is a pure function of the bundle ID and the invoking user's home
//! directory:
//!
//! ```text
//! {home}/
//! ├── .zbundle/{id}/        # Mount root (the chroot)
//! ├── .zbundle.wd/{id}/     # Work directory, backend of the filesystem engine
//! ├── .zbundle.wd/{id}.db/  # Transient metadata store, removed on stop
//! └── .zbundle.cache/       # Content cache shared by all bundles
//! ```

use std::path::{Path, PathBuf};

use crate::materialize;

/// Directory under home holding mount roots.
pub const MOUNT_DIR: &str = ".zbundle";

/// Directory under home holding work directories.
pub const WORK_DIR: &str = ".zbundle.wd";

/// Directory under home holding the shared content cache.
pub const CACHE_DIR: &str = ".zbundle.cache";

/// Paths for one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPaths {
    /// Mount point of the bundle (`~/.zbundle/{id}`).
    pub mount_root: PathBuf,
    /// Backend directory for the filesystem engine (`~/.zbundle.wd/{id}`).
    pub work_root: PathBuf,
    /// Shared content cache (`~/.zbundle.cache`).
    pub cache_root: PathBuf,
    /// Metadata store directory (`~/.zbundle.wd/{id}.db`).
    pub meta_dir: PathBuf,
}

impl MountPaths {
    /// Computes the paths for `id` under `home`.
    ///
    /// This only computes the paths; it does not create any directories.
    #[must_use]
    pub fn new(home: &Path, id: &str) -> Self {
        let work_root = home.join(WORK_DIR).join(id);
        Self {
            mount_root: home.join(MOUNT_DIR).join(id),
            cache_root: home.join(CACHE_DIR),
            meta_dir: materialize::meta_dir(&work_root),
            work_root,
        }
    }
}
