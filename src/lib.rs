//! zbundle - Mount filesystem bundles and run their entry point in a chroot.
//!
//! A bundle is a read-only tree described by a compressed metadata archive
//! (an "flist") and served from a content-addressed storage backend by a FUSE
//! filesystem daemon. This crate:
//!
//! - fetches the archive from disk or HTTP and decompresses it ([`fetch`])
//! - extracts the metadata store it contains ([`materialize`])
//! - mounts the bundle and bind-mounts `/proc`, `/dev` and `/sys` into it ([`bundle`])
//! - runs the bundle's `/etc/start` under `chroot(2)`, keeping output tails ([`sandbox`])
//!
//! # Platform Requirements
//!
//! - Linux, running as root
//! - `/dev/fuse` and a filesystem daemon (default `g8ufs`) on `PATH`
//! - the `mountpoint` utility
//!
//! # Example
//!
//! ```no_run
//! use zbundle::bundle::{BundleSpec, Chroot};
//! use zbundle::sandbox::{Sandbox, SandboxConfig};
//!
//! fn main() -> miette::Result<()> {
//!     let spec = BundleSpec::new(
//!         "web",
//!         "https://hub.grid.tf/tf-official-apps/ubuntu.flist",
//!         "zdb://hub.grid.tf:9900",
//!     )?;
//!
//!     let mut bundle = Chroot::new(spec, "/root");
//!     bundle.start()?;
//!
//!     let sandbox = Sandbox::new(SandboxConfig::default());
//!     let result = sandbox.run(bundle.mount_root(), &["GREETING=hi"]);
//!
//!     bundle.stop()?;
//!     result?;
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod error;
pub mod fetch;
pub mod materialize;
pub mod report;
pub mod sandbox;
pub mod system;

// Re-export commonly used types
pub use bundle::{BundleSpec, Chroot};
pub use error::{Error, Result};
pub use sandbox::{CommandOutput, Sandbox, SandboxConfig};
