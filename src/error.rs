//! Error types for zbundle.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Each component owns an error enum; [`Error`] wraps them for the binary.

use std::path::PathBuf;
use std::process::ExitStatus;

use miette::Diagnostic;
use thiserror::Error;

use crate::sandbox::CommandOutput;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// System requirements not met
    #[error("System requirements check failed")]
    #[diagnostic(code(zbundle::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// Bundle lifecycle error
    #[error("Bundle error")]
    #[diagnostic(code(zbundle::bundle))]
    Bundle(#[from] BundleError),

    /// Sandbox execution error
    #[error("Sandbox error")]
    #[diagnostic(code(zbundle::sandbox))]
    Sandbox(#[from] SandboxError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(zbundle::io))]
    Io(#[from] std::io::Error),
}

/// Errors related to host requirements validation.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// Not running with an effective UID of 0
    #[error("zbundle must run as root (effective uid {uid})")]
    #[diagnostic(
        code(zbundle::system::not_root),
        help("Bind mounts and chroot need CAP_SYS_ADMIN and CAP_SYS_CHROOT; run with sudo")
    )]
    NotRoot { uid: u32 },

    /// FUSE device missing
    #[error("FUSE device {path} is not available")]
    #[diagnostic(
        code(zbundle::system::fuse),
        help("Load the fuse kernel module with: modprobe fuse")
    )]
    FuseUnavailable { path: PathBuf },

    /// Required helper binary not on PATH
    #[error("Required binary '{name}' was not found in PATH")]
    #[diagnostic(code(zbundle::system::binary))]
    BinaryNotFound { name: String },
}

/// Errors produced while resolving and decoding an archive locator.
#[derive(Error, Debug, Diagnostic)]
pub enum FetchError {
    /// The locator is not a valid URL or path.
    #[error("invalid archive locator '{locator}': {reason}")]
    #[diagnostic(code(zbundle::fetch::locator_invalid))]
    LocatorInvalid { locator: String, reason: String },

    /// The locator scheme is neither local nor HTTP(S).
    #[error("unsupported archive locator scheme '{scheme}' in '{locator}'")]
    #[diagnostic(
        code(zbundle::fetch::unsupported_locator),
        help("Use a local path, a file:// URL, or an http(s):// URL")
    )]
    UnsupportedLocator { locator: String, scheme: String },

    /// Local archive does not exist.
    #[error("archive not found: {}", path.display())]
    #[diagnostic(code(zbundle::fetch::not_found))]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Remote fetch answered with a non-200 status.
    #[error("failed to download '{locator}': HTTP {status}")]
    #[diagnostic(code(zbundle::fetch::failed))]
    FetchFailed { locator: String, status: u16 },

    /// The HTTP request itself failed.
    #[error("failed to download '{locator}'")]
    #[diagnostic(code(zbundle::fetch::http))]
    Http {
        locator: String,
        #[source]
        source: reqwest::Error,
    },

    /// The final path segment carries no supported extension.
    #[error("unknown archive format '{ext}'")]
    #[diagnostic(
        code(zbundle::fetch::unknown_format),
        help("Supported extensions: .tgz .flist .gz .tbz2 .bz2 .tar")
    )]
    UnknownFormat { ext: String },

    /// A decompression layer could not be constructed.
    #[error("failed to open {format} decoder")]
    #[diagnostic(code(zbundle::fetch::decoder))]
    Decoder {
        format: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while opening a local archive.
    #[error("{context}")]
    #[diagnostic(code(zbundle::fetch::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced while extracting archive entries into the meta directory.
///
/// Any of these leaves the meta directory in an indeterminate state; it must be
/// removed before retrying.
#[derive(Error, Debug, Diagnostic)]
pub enum MaterializeError {
    /// Reading the archive stream failed.
    #[error("failed to read archive: {context}")]
    #[diagnostic(code(zbundle::materialize::archive))]
    Archive {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing into the meta directory failed.
    #[error("{context}")]
    #[diagnostic(code(zbundle::materialize::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// An entry would land outside the meta directory.
    #[error("archive entry escapes the meta directory: {path}")]
    #[diagnostic(code(zbundle::materialize::unsafe_path))]
    UnsafePath { path: String },
}

/// Errors reported by the filesystem engine seam.
#[derive(Error, Debug, Diagnostic)]
pub enum EngineError {
    /// The meta directory cannot back a metadata store.
    #[error("invalid metadata store at {}: {reason}", path.display())]
    #[diagnostic(code(zbundle::engine::meta_store))]
    MetaStore { path: PathBuf, reason: String },

    /// The storage locator could not be parsed.
    #[error("invalid storage locator '{locator}': {reason}")]
    #[diagnostic(code(zbundle::engine::storage))]
    Storage { locator: String, reason: String },

    /// The filesystem daemon could not be spawned.
    #[error("failed to spawn filesystem daemon '{binary}'")]
    #[diagnostic(code(zbundle::engine::spawn))]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The filesystem daemon exited.
    #[error("filesystem daemon exited with {status}")]
    #[diagnostic(code(zbundle::engine::exited))]
    Exited { status: ExitStatus },

    /// The mount did not appear in time.
    #[error("mount at {} not ready after {timeout_ms}ms", target.display())]
    #[diagnostic(code(zbundle::engine::timeout))]
    Timeout { target: PathBuf, timeout_ms: u128 },

    /// Unmounting the bundle failed.
    #[error("failed to unmount {}", target.display())]
    #[diagnostic(code(zbundle::engine::unmount))]
    Unmount {
        target: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    /// Waiting on the daemon failed.
    #[error("{context}")]
    #[diagnostic(code(zbundle::engine::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to bind mounts performed around the bundle.
#[derive(Error, Debug, Diagnostic)]
pub enum MountError {
    /// Bind mount failed
    #[error("failed to bind mount {} on {}", source_path.display(), target.display())]
    #[diagnostic(code(zbundle::mount::bind))]
    BindMount {
        source_path: PathBuf,
        target: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    /// Unmount failed
    #[error("failed to unmount {}", target.display())]
    #[diagnostic(code(zbundle::mount::unmount))]
    Unmount {
        target: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    /// Mount point could not be created
    #[error("{context}")]
    #[diagnostic(code(zbundle::mount::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to the bundle lifecycle.
#[derive(Error, Debug, Diagnostic)]
pub enum BundleError {
    /// The bundle ID cannot be used as a path component.
    #[error("invalid bundle id '{id}': {reason}")]
    #[diagnostic(code(zbundle::bundle::invalid_id))]
    InvalidId { id: String, reason: String },

    /// Mount root is already an active mount point.
    #[error("a bundle is already running with id '{id}' at {}", mount_root.display())]
    #[diagnostic(
        code(zbundle::bundle::already_running),
        help("Stop the running bundle or pick another id")
    )]
    AlreadyRunning { id: String, mount_root: PathBuf },

    /// Operation requires a mounted bundle.
    #[error("bundle '{id}' is not running")]
    #[diagnostic(code(zbundle::bundle::not_running))]
    NotRunning { id: String },

    /// Fetching the archive failed.
    #[error("failed to fetch bundle archive")]
    #[diagnostic(code(zbundle::bundle::fetch))]
    Fetch(#[from] FetchError),

    /// Materializing the metadata failed.
    #[error("failed to materialize bundle metadata")]
    #[diagnostic(code(zbundle::bundle::materialize))]
    Materialize(#[from] MaterializeError),

    /// The filesystem engine failed to mount or unmount.
    #[error("bundle filesystem mount failed")]
    #[diagnostic(code(zbundle::bundle::mount_failed))]
    MountFailed(#[from] EngineError),

    /// OS integration (bind mounts) failed.
    #[error("failed to prepare bundle root")]
    #[diagnostic(code(zbundle::bundle::prepare))]
    Prepare(#[from] MountError),

    /// Filesystem operation failed.
    #[error("{context}")]
    #[diagnostic(code(zbundle::bundle::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to sandboxed execution.
#[derive(Error, Debug, Diagnostic)]
pub enum SandboxError {
    /// No sandboxed process is live.
    #[error("sandbox is not started")]
    #[diagnostic(code(zbundle::sandbox::not_started))]
    NotStarted,

    /// The in-root environment file could not be read.
    #[error("failed to read environment file {}", path.display())]
    #[diagnostic(code(zbundle::sandbox::environment))]
    Environment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The entry point could not be started.
    #[error("failed to start entry point {}", entry_point.display())]
    #[diagnostic(code(zbundle::sandbox::spawn))]
    Spawn {
        entry_point: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The entry point ran and did not exit successfully.
    #[error("entry point exited with {}", output.status)]
    #[diagnostic(code(zbundle::sandbox::exited))]
    Exited { output: CommandOutput },

    /// Waiting on the entry point failed.
    #[error("failed to wait for entry point")]
    #[diagnostic(code(zbundle::sandbox::wait))]
    Wait(#[source] std::io::Error),

    /// Signal delivery failed.
    #[error("failed to send {signal} to pid {pid}")]
    #[diagnostic(code(zbundle::sandbox::signal))]
    Signal {
        signal: nix::sys::signal::Signal,
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },
}

impl SandboxError {
    /// Returns the captured output tails, if the entry point ran.
    #[must_use]
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            Self::Exited { output } => Some(output),
            _ => None,
        }
    }
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
