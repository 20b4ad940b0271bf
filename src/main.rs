//! zbundle - Entry Point
//!
//! Mounts a bundle, runs its entry point inside it, and tears it down.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result, miette};
use nix::sys::signal::{SigSet, Signal};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use zbundle::bundle::{self, BundleSpec, Chroot, FuseDaemon};
use zbundle::error::{Error, SandboxError};
use zbundle::report::RunReport;
use zbundle::sandbox::{CommandOutput, Sandbox, SandboxConfig};
use zbundle::system;

/// zbundle - Run a filesystem bundle's entry point in a chroot.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bundle ID, used to name the mount and work directories
    id: String,

    /// Metadata archive: local path, file://, http:// or https:// URL
    flist: String,

    /// Storage backend serving file contents
    #[arg(short, long, default_value = bundle::DEFAULT_STORAGE)]
    storage: String,

    /// Extra environment for the entry point (KEY=VALUE, repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Entry point executed inside the bundle
    #[arg(long, default_value = "/etc/start")]
    entry_point: PathBuf,

    /// Keep the bundle mounted after the entry point exits, until it is unmounted or interrupted
    #[arg(long, default_value = "false")]
    no_exit: bool,

    /// Filesystem daemon that serves the bundle
    #[arg(long, default_value = bundle::engine::DEFAULT_DAEMON)]
    fs_binary: String,

    /// Write a JSON run report to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Skip host requirement checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

/// What a signal should do at the current stage of the run.
#[derive(Debug, Default)]
struct Control {
    /// Set once a signal arrived; the entry point is not started afterwards.
    interrupted: AtomicBool,
    /// Set while blocked waiting for the bundle after the entry point exited.
    holding: AtomicBool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout belongs to the entry point.
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    debug!("zbundle v{}", env!("CARGO_PKG_VERSION"));

    if args.skip_checks {
        warn!("Skipping host requirement checks (--skip-checks)");
    } else {
        match system::check_all(&args.fs_binary) {
            Ok(reqs) => debug!(fs_binary = %reqs.fs_binary.display(), "Host requirements satisfied"),
            Err(e) => {
                error!("Host requirement check failed");
                return Err(e.into());
            }
        }
    }

    let home = dirs::home_dir().ok_or_else(|| miette!("could not determine the home directory"))?;
    let spec = BundleSpec::new(&args.id, &args.flist, &args.storage)?;
    let mut chroot =
        Chroot::new(spec, &home).with_filesystem(FuseDaemon::new(&args.fs_binary));

    let sandbox = Arc::new(Sandbox::new(
        SandboxConfig::default().with_entry_point(&args.entry_point),
    ));
    let control = Arc::new(Control::default());
    install_signal_handler(
        Arc::clone(&sandbox),
        Arc::clone(&control),
        chroot.mount_root().to_path_buf(),
    )?;

    let started_at = Utc::now();
    let (output, result) = run(&mut chroot, &sandbox, &control, &args);

    if let Some(path) = &args.report {
        let message = result.as_ref().err().map(error_chain);
        let report = RunReport::new(&args.id, started_at, output.as_ref(), message);
        report.write(path).into_diagnostic()?;
        debug!(path = %path.display(), "Wrote run report");
    }

    result.map_err(Into::into)
}

/// Starts the bundle, runs the entry point, and always stops the bundle if it
/// was mounted. Returns the output tails and the first error.
fn run(
    chroot: &mut Chroot,
    sandbox: &Sandbox,
    control: &Control,
    args: &Args,
) -> (Option<CommandOutput>, Result<(), Error>) {
    let mut output = None;
    let mut result = chroot.start().map_err(Error::from);

    if result.is_ok() && !control.interrupted.load(Ordering::SeqCst) {
        info!(root = %chroot.mount_root().display(), "Running entry point");
        result = match sandbox.run(chroot.mount_root(), &args.env) {
            Ok(out) => {
                output = Some(out);
                Ok(())
            }
            Err(e) => {
                output = e.output().cloned();
                Err(e.into())
            }
        };

        if args.no_exit && !control.interrupted.load(Ordering::SeqCst) {
            control.holding.store(true, Ordering::SeqCst);
            info!("Entry point exited, holding bundle until it is unmounted");
            if let Err(e) = chroot.wait() {
                warn!(error = %e, "Bundle filesystem terminated with an error");
            }
            control.holding.store(false, Ordering::SeqCst);
        }
    }

    if chroot.is_running() {
        if let Err(e) = chroot.stop() {
            error!(error = %e, "Failed to stop bundle");
            if result.is_ok() {
                result = Err(e.into());
            }
        }
    }

    (output, result)
}

/// Routes SIGINT and SIGTERM to a dedicated thread.
///
/// While the entry point runs the signal is forwarded to it. While holding a
/// bundle with `--no-exit` the mount root is detached so the wait returns.
///
/// The entry point shares our process group, so a Ctrl-C typed in a terminal
/// already reaches it; SIGINT is only forwarded when stdin is not a terminal.
fn install_signal_handler(
    sandbox: Arc<Sandbox>,
    control: Arc<Control>,
    mount_root: PathBuf,
) -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    // Blocked here so every thread spawned later inherits the mask.
    set.thread_block().into_diagnostic()?;
    let interactive = std::io::stdin().is_terminal();

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            loop {
                let sig = match set.wait() {
                    Ok(sig) => sig,
                    Err(e) => {
                        error!(error = %e, "Signal wait failed");
                        return;
                    }
                };
                control.interrupted.store(true, Ordering::SeqCst);

                if !forwards(sig, interactive) && sandbox.is_running() {
                    debug!(signal = %sig, "Entry point received the signal from the terminal");
                    continue;
                }

                match sandbox.signal(sig) {
                    Ok(()) => continue,
                    Err(SandboxError::NotStarted) => {}
                    Err(e) => {
                        warn!(error = %e, "Could not forward signal");
                        continue;
                    }
                }

                if control.holding.load(Ordering::SeqCst) {
                    info!(signal = %sig, "Releasing bundle");
                    if let Err(e) = bundle::mounts::unmount_detached(&mount_root) {
                        warn!(error = %e, "Could not detach bundle");
                    }
                } else {
                    info!(signal = %sig, "Interrupted, stopping after the current step");
                }
            }
        })
        .into_diagnostic()?;

    Ok(())
}

/// Whether `sig` must be forwarded to a running entry point.
fn forwards(sig: Signal, interactive: bool) -> bool {
    !(interactive && sig == Signal::SIGINT)
}

/// Renders an error and its sources on one line.
fn error_chain(err: &Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
