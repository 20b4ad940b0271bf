//! Bundle lifecycle: fetch, mount, integrate, tear down.
//!
//! A bundle is a read-only filesystem tree described by a metadata archive
//! and served from a content-addressed storage backend. [`Chroot`] mounts it
//! under the invoking user's home directory and bind-mounts the host's
//! kernel filesystems into it, leaving a root the sandbox can chroot into.

mod chroot;
pub mod engine;
pub mod mounts;
mod paths;

pub use chroot::Chroot;
pub use engine::{Filesystem, FuseDaemon, MetaStore, MountHandle, MountOptions, Storage};
pub use mounts::{MountProbe, MountpointCommand};
pub use paths::{CACHE_DIR, MOUNT_DIR, MountPaths, WORK_DIR};

use serde::{Deserialize, Serialize};

use crate::error::BundleError;

/// Default storage backend for bundles.
pub const DEFAULT_STORAGE: &str = "zdb://hub.grid.tf:9900";

/// Identity and sources of one bundle.
///
/// The ID becomes a path component under the home directory, so it is
/// validated on construction. Deserialized specs are not validated; pass them
/// through [`BundleSpec::validate`] before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSpec {
    id: String,
    archive: String,
    storage: String,
}

impl BundleSpec {
    /// Creates a spec.
    ///
    /// # Errors
    ///
    /// Returns `BundleError::InvalidId` if `id` is not a single safe path
    /// component.
    pub fn new(
        id: impl Into<String>,
        archive: impl Into<String>,
        storage: impl Into<String>,
    ) -> Result<Self, BundleError> {
        let spec = Self {
            id: id.into(),
            archive: archive.into(),
            storage: storage.into(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Checks that the ID is usable as a path component.
    ///
    /// # Errors
    ///
    /// Returns `BundleError::InvalidId` describing the problem.
    pub fn validate(&self) -> Result<(), BundleError> {
        let reason = if self.id.is_empty() {
            "must not be empty"
        } else if self.id == "." || self.id == ".." {
            "must not be a relative directory name"
        } else if self.id.contains('/') {
            "must not contain '/'"
        } else if self.id.contains('\0') {
            "must not contain NUL"
        } else {
            return Ok(());
        };

        Err(BundleError::InvalidId {
            id: self.id.clone(),
            reason: reason.to_string(),
        })
    }

    /// Bundle ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Metadata archive locator.
    #[must_use]
    pub fn archive(&self) -> &str {
        &self.archive
    }

    /// Storage backend locator.
    #[must_use]
    pub fn storage(&self) -> &str {
        &self.storage
    }
}
