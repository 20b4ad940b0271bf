//! Sandboxed execution of a bundle's entry point.
//!
//! The entry point runs under `chroot(2)` at the bundle root with an
//! environment assembled from the root's environment file and caller
//! overrides. Output is forwarded live and its tail kept for reporting.
//!
//! # Example
//!
//! ```no_run
//! use zbundle::sandbox::{Sandbox, SandboxConfig};
//!
//! let sandbox = Sandbox::new(SandboxConfig::default());
//! match sandbox.run("/root/.zbundle/web", &["DEBUG=1"]) {
//!     Ok(output) => println!("{}", String::from_utf8_lossy(&output.stdout)),
//!     Err(e) => eprintln!("entry point failed: {e}"),
//! }
//! ```

mod config;
mod env;
mod executor;
mod tail;

pub use config::{BUFFER_SIZE, SandboxConfig};
pub use env::{environ, merge_env, parse_env};
pub use executor::{CommandOutput, Sandbox};
pub use tail::TailBuffer;
