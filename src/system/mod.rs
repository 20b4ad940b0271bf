//! Host requirement validation.
//!
//! Bundles need root (bind mounts and chroot), the FUSE device, and the
//! helper binaries that mount and probe the bundle filesystem.

mod requirements;

pub use requirements::{
    FUSE_DEVICE, MOUNTPOINT_BINARY, SystemRequirements, check_all, check_binary, check_fuse,
    check_root,
};
