//! Chrooted execution of a bundle's entry point.
//!
//! # Notes on output capture
//!
//! stdout and stderr are pumped on two threads while the caller blocks in
//! `wait`. Each pump forwards what it reads to this process's matching stream
//! and keeps a bounded tail, so a chatty workload never blocks on a full pipe
//! and never grows our memory.

use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{Id, WaitPidFlag, waitid};
use nix::unistd::Pid;
use tracing::{debug, instrument, trace, warn};

use super::SandboxConfig;
use super::env::{environ, merge_env};
use super::tail::TailBuffer;
use crate::error::SandboxError;

const PUMP_CHUNK: usize = 8 * 1024;

/// Output tails of a finished entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Last bytes written to standard output.
    pub stdout: Vec<u8>,
    /// Last bytes written to standard error.
    pub stderr: Vec<u8>,
    /// Exit status of the entry point.
    pub status: ExitStatus,
}

impl CommandOutput {
    /// Returns `true` if the entry point exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Runs a root's entry point under `chroot(2)`.
///
/// One process at a time: [`signal`](Self::signal) targets the process started
/// by the [`run`](Self::run) call currently blocked, typically from another
/// thread.
///
/// # Example
///
/// ```no_run
/// use zbundle::sandbox::{Sandbox, SandboxConfig};
///
/// let sandbox = Sandbox::new(SandboxConfig::default());
/// let output = sandbox.run("/root/.zbundle/web", &["GREETING=hello"]).unwrap();
/// assert!(output.success());
/// ```
#[derive(Debug, Default)]
pub struct Sandbox {
    config: SandboxConfig,
    pid: Mutex<Option<Pid>>,
}

impl Sandbox {
    /// Creates an executor with the given configuration.
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            pid: Mutex::new(None),
        }
    }

    /// Returns a reference to the sandbox configuration.
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Runs the entry point inside `root` and blocks until it exits.
    ///
    /// The environment is the root's environment file followed by `overrides`.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `SandboxError::Environment` if the environment file exists but cannot be read
    /// - `SandboxError::Spawn` if the entry point cannot be started (including chroot failure)
    /// - `SandboxError::Exited` with the output tails if it exits unsuccessfully
    /// - `SandboxError::Wait` if waiting on the process fails
    #[instrument(skip_all, fields(root = %root.as_ref().display(), entry_point = %self.config.entry_point.display()))]
    pub fn run<S: AsRef<str>>(
        &self,
        root: impl AsRef<Path>,
        overrides: &[S],
    ) -> Result<CommandOutput, SandboxError> {
        let root = root.as_ref();
        let env = merge_env(environ(root, &self.config.env_file)?, overrides);
        trace!(count = env.len(), "Prepared environment");

        let mut cmd = self.command(root, &env)?;

        let (mut child, pid) = {
            let mut slot = self.lock_pid();
            let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
            let pid = Pid::from_raw(child.id() as i32);
            *slot = Some(pid);
            (child, pid)
        };
        debug!(pid = child.id(), "Entry point started");

        let capacity = self.config.buffer_size;
        let forward = self.config.forward;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_join = thread::spawn(move || {
            stdout.map_or_else(
                || TailBuffer::new(capacity),
                |r| pump(r, forward.then(io::stdout), capacity),
            )
        });
        let stderr_join = thread::spawn(move || {
            stderr.map_or_else(
                || TailBuffer::new(capacity),
                |r| pump(r, forward.then(io::stderr), capacity),
            )
        });

        // The PID stays valid until reaped, so forget it before reaping.
        await_exit(pid);
        self.lock_pid().take();
        let waited = child.wait();

        let stdout = stdout_join
            .join()
            .unwrap_or_else(|_| TailBuffer::new(capacity));
        let stderr = stderr_join
            .join()
            .unwrap_or_else(|_| TailBuffer::new(capacity));

        let status = waited.map_err(SandboxError::Wait)?;
        let output = CommandOutput {
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            status,
        };

        debug!(%status, "Entry point exited");
        if output.success() {
            Ok(output)
        } else {
            Err(SandboxError::Exited { output })
        }
    }

    /// Sends `sig` to the running entry point.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::NotStarted` if no entry point is running, or
    /// `SandboxError::Signal` if delivery fails.
    pub fn signal(&self, sig: Signal) -> Result<(), SandboxError> {
        let slot = self.lock_pid();
        let pid = (*slot).ok_or(SandboxError::NotStarted)?;
        debug!(%pid, signal = %sig, "Forwarding signal");
        signal::kill(pid, sig).map_err(|e| SandboxError::Signal {
            signal: sig,
            pid: pid.as_raw(),
            source: e,
        })
    }

    /// Returns true while an entry point is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock_pid().is_some()
    }

    #[allow(unsafe_code)]
    fn command(&self, root: &Path, env: &[String]) -> Result<Command, SandboxError> {
        let root_c = cstring(root.as_os_str().as_bytes()).map_err(|e| self.spawn_error(e))?;
        let cwd_c = cstring(self.config.working_dir.as_os_str().as_bytes())
            .map_err(|e| self.spawn_error(e))?;

        let mut cmd = Command::new(&self.config.entry_point);
        cmd.env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for entry in env {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    cmd.env(key, value);
                }
                _ => warn!(%entry, "Skipping malformed environment entry"),
            }
        }

        // Runs in the forked child: only async-signal-safe calls, no allocation.
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::chroot(root_c.as_c_str())?;
                nix::unistd::chdir(cwd_c.as_c_str())?;
                Ok(())
            });
        }

        Ok(cmd)
    }

    fn spawn_error(&self, source: io::Error) -> SandboxError {
        SandboxError::Spawn {
            entry_point: self.config.entry_point.clone(),
            source,
        }
    }

    fn lock_pid(&self) -> MutexGuard<'_, Option<Pid>> {
        self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Blocks until `pid` has exited, leaving it unreaped.
fn await_exit(pid: Pid) {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => return,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                trace!(error = %e, "waitid failed, reaping directly");
                return;
            }
        }
    }
}

fn cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Copies `reader` into a tail buffer of `capacity`, forwarding to `sink`.
///
/// Forwarding errors (e.g. a closed terminal) stop forwarding but not capture.
pub(crate) fn pump<R: Read, W: Write>(
    mut reader: R,
    mut sink: Option<W>,
    capacity: usize,
) -> TailBuffer {
    let mut tail = TailBuffer::new(capacity);
    let mut buf = [0u8; PUMP_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                trace!(error = %e, "Output stream closed");
                break;
            }
        };

        let chunk = &buf[..n];
        let _ = tail.write_all(chunk);
        if let Some(w) = sink.as_mut() {
            if w.write_all(chunk).and_then(|()| w.flush()).is_err() {
                sink = None;
            }
        }
    }
    tail
}
