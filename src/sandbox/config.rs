//! Configuration for the sandbox executor.

use std::path::PathBuf;

/// Bytes of each output stream retained by the tail buffers.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Configuration for a [`Sandbox`](super::Sandbox).
///
/// Paths are interpreted inside the chroot.
///
/// # Example
///
/// ```
/// use zbundle::sandbox::SandboxConfig;
///
/// let config = SandboxConfig::default()
///     .with_entry_point("/usr/local/bin/serve")
///     .with_buffer_size(4096)
///     .with_forward(false);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Executable run inside the root, without arguments.
    pub entry_point: PathBuf,

    /// Environment file read from the root before the entry point starts.
    pub env_file: PathBuf,

    /// Working directory of the entry point.
    pub working_dir: PathBuf,

    /// Capacity of the stdout and stderr tail buffers.
    pub buffer_size: usize,

    /// Copy output to this process's stdout/stderr while it is produced.
    pub forward: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            entry_point: PathBuf::from("/etc/start"),
            env_file: PathBuf::from("/etc/env"),
            working_dir: PathBuf::from("/"),
            buffer_size: BUFFER_SIZE,
            forward: true,
        }
    }
}

impl SandboxConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the entry point.
    #[must_use]
    pub fn with_entry_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.entry_point = path.into();
        self
    }

    /// Sets the environment file.
    #[must_use]
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = path.into();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_dir = path.into();
        self
    }

    /// Sets the tail buffer capacity.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Enables or disables live forwarding of output.
    #[must_use]
    pub fn with_forward(mut self, forward: bool) -> Self {
        self.forward = forward;
        self
    }
}
