//! Integration tests for the bundle lifecycle controller.
//!
//! The filesystem engine and mountpoint probe are replaced with fakes so the
//! lifecycle can be exercised without FUSE. Tests that need real bind mounts
//! are ignored unless run as root.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use zbundle::bundle::{BundleSpec, Chroot, Filesystem, MountHandle, MountOptions, MountProbe};
use zbundle::error::{BundleError, EngineError};

// ============================================================================
// Fakes
// ============================================================================

/// Probe with a fixed answer that counts how often it is asked.
#[derive(Clone)]
struct FixedProbe {
    mounted: bool,
    calls: Arc<AtomicUsize>,
}

impl FixedProbe {
    fn new(mounted: bool) -> Self {
        Self {
            mounted,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MountProbe for FixedProbe {
    fn is_mounted(&self, _path: &Path) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.mounted
    }
}

#[derive(Debug, Default)]
struct EngineLog {
    mounted: Vec<MountOptions>,
    unmounts: usize,
    waits: usize,
}

/// Engine that records calls instead of mounting anything.
#[derive(Clone, Default)]
struct RecordingEngine {
    log: Arc<Mutex<EngineLog>>,
    fail_unmount: Arc<AtomicBool>,
}

impl RecordingEngine {
    fn failing_unmount() -> Self {
        let engine = Self::default();
        engine.fail_unmount.store(true, Ordering::SeqCst);
        engine
    }

    fn unmounts(&self) -> usize {
        self.log.lock().expect("log").unmounts
    }
}

struct RecordingHandle {
    log: Arc<Mutex<EngineLog>>,
    fail_unmount: Arc<AtomicBool>,
}

impl Filesystem for RecordingEngine {
    fn mount(&self, options: MountOptions) -> Result<Box<dyn MountHandle>, EngineError> {
        self.log.lock().expect("log").mounted.push(options);
        Ok(Box::new(RecordingHandle {
            log: Arc::clone(&self.log),
            fail_unmount: Arc::clone(&self.fail_unmount),
        }))
    }
}

impl MountHandle for RecordingHandle {
    fn unmount(&mut self) -> Result<(), EngineError> {
        self.log.lock().expect("log").unmounts += 1;
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(EngineError::Unmount {
                target: PathBuf::from("/fake"),
                source: nix::errno::Errno::EBUSY,
            });
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<(), EngineError> {
        self.log.lock().expect("log").waits += 1;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn tar_archive(dir: &Path) -> PathBuf {
    let mut builder = tar::Builder::new(Vec::new());
    let data = b"GREETING=hi\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "etc/env", &data[..])
        .expect("Failed to append entry");

    let path = dir.join("bundle.tar");
    fs::write(&path, builder.into_inner().expect("Failed to finish tar"))
        .expect("Failed to write archive");
    path
}

fn spec(id: &str, archive: &Path) -> BundleSpec {
    BundleSpec::new(id, archive.to_str().expect("utf-8 path"), "zdb://localhost:9900")
        .expect("Failed to create spec")
}

// ============================================================================
// State errors
// ============================================================================

#[test]
fn test_start_already_running_is_side_effect_free() {
    let home = tempfile::tempdir().expect("Failed to create temp dir");
    let engine = RecordingEngine::default();
    let probe = FixedProbe::new(true);
    let mut bundle = Chroot::new(spec("busy", Path::new("/nonexistent/b.tar")), home.path())
        .with_probe(probe.clone())
        .with_filesystem(engine.clone());

    let result = bundle.start();

    match result {
        Err(BundleError::AlreadyRunning { id, mount_root }) => {
            assert_eq!(id, "busy");
            assert_eq!(mount_root, home.path().join(".zbundle/busy"));
        }
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    assert!(engine.log.lock().expect("log").mounted.is_empty());
    // Nothing was created: no mount root, no work dir, no meta.
    assert_eq!(fs::read_dir(home.path()).expect("read home").count(), 0);
}

#[test]
fn test_stop_never_started() {
    let home = tempfile::tempdir().expect("Failed to create temp dir");
    let mut bundle = Chroot::new(spec("idle", Path::new("/tmp/x.tar")), home.path());

    assert!(matches!(bundle.stop(), Err(BundleError::NotRunning { .. })));
}

#[test]
fn test_wait_never_started() {
    let home = tempfile::tempdir().expect("Failed to create temp dir");
    let mut bundle = Chroot::new(spec("idle", Path::new("/tmp/x.tar")), home.path());

    assert!(matches!(bundle.wait(), Err(BundleError::NotRunning { .. })));
}

#[test]
fn test_start_missing_archive() {
    let home = tempfile::tempdir().expect("Failed to create temp dir");
    let engine = RecordingEngine::default();
    let mut bundle = Chroot::new(spec("gone", &home.path().join("absent.tar")), home.path())
        .with_probe(FixedProbe::new(false))
        .with_filesystem(engine.clone());

    let result = bundle.start();

    assert!(matches!(
        result,
        Err(BundleError::Fetch(zbundle::error::FetchError::NotFound { .. }))
    ));
    assert!(!bundle.is_running());
    assert!(engine.log.lock().expect("log").mounted.is_empty());
    // Mount root is left behind for inspection.
    assert!(bundle.mount_root().is_dir());
}

// ============================================================================
// Lifecycle without host binds
// ============================================================================

#[test]
fn test_start_stop_removes_meta() {
    let home = tempfile::tempdir().expect("Failed to create temp dir");
    let archive = tar_archive(home.path());
    let engine = RecordingEngine::default();
    let resolv = home.path().join("resolv.conf");
    fs::write(&resolv, "nameserver 192.0.2.1\n").expect("write resolv");

    let mut bundle = Chroot::new(spec("plain", &archive), home.path())
        .with_probe(FixedProbe::new(false))
        .with_filesystem(engine.clone())
        .with_resolv_conf(&resolv)
        .with_host_binds(&[]);

    bundle.start().expect("Failed to start");

    assert!(bundle.is_running());
    assert_eq!(engine.log.lock().expect("log").mounted.len(), 1);
    assert!(home.path().join(".zbundle.wd/plain.db/etc/env").is_file());
    assert_eq!(
        fs::read_to_string(bundle.mount_root().join("etc/resolv.conf")).expect("resolv"),
        "nameserver 192.0.2.1\n"
    );

    bundle.stop().expect("Failed to stop");

    assert!(!bundle.is_running());
    assert_eq!(engine.unmounts(), 1);
    assert!(!home.path().join(".zbundle.wd/plain.db").exists());
    assert!(matches!(bundle.stop(), Err(BundleError::NotRunning { .. })));
}

#[test]
fn test_failed_unmount_keeps_mount_for_retry() {
    let home = tempfile::tempdir().expect("Failed to create temp dir");
    let archive = tar_archive(home.path());
    let engine = RecordingEngine::failing_unmount();

    let mut bundle = Chroot::new(spec("busy", &archive), home.path())
        .with_probe(FixedProbe::new(false))
        .with_filesystem(engine.clone())
        .with_resolv_conf(home.path().join("absent"))
        .with_host_binds(&[]);

    bundle.start().expect("Failed to start");

    let result = bundle.stop();
    assert!(matches!(result, Err(BundleError::MountFailed(EngineError::Unmount { .. }))));
    assert!(bundle.is_running());
    assert!(!home.path().join(".zbundle.wd/busy.db").exists());

    let result = bundle.stop();
    assert!(matches!(result, Err(BundleError::MountFailed(EngineError::Unmount { .. }))));
    assert_eq!(engine.unmounts(), 2);

    engine.fail_unmount.store(false, Ordering::SeqCst);
    bundle.stop().expect("Failed to stop on retry");
    assert!(!bundle.is_running());
    assert_eq!(engine.unmounts(), 3);
}

#[test]
fn test_failed_prepare_keeps_mount_until_stop() {
    let home = tempfile::tempdir().expect("Failed to create temp dir");
    let archive = tar_archive(home.path());
    let engine = RecordingEngine::default();

    let mut bundle = Chroot::new(spec("half", &archive), home.path())
        .with_probe(FixedProbe::new(false))
        .with_filesystem(engine.clone())
        .with_resolv_conf(home.path().join("absent"))
        .with_host_binds(&["zbundle-absent-host-dir"]);

    let result = bundle.start();

    assert!(matches!(result, Err(BundleError::Prepare(_))));
    assert!(bundle.is_running());
    assert_eq!(engine.log.lock().expect("log").mounted.len(), 1);
    assert!(matches!(bundle.start(), Err(BundleError::AlreadyRunning { .. })));

    bundle.stop().expect("Failed to stop");

    assert!(!bundle.is_running());
    assert_eq!(engine.unmounts(), 1);
    assert!(!home.path().join(".zbundle.wd/half.db").exists());
}

// ============================================================================
// Full lifecycle (requires root for bind mounts)
// ============================================================================

#[test]
#[ignore = "requires root"]
fn test_lifecycle_with_recording_engine() {
    let home = tempfile::tempdir().expect("Failed to create temp dir");
    let archive = tar_archive(home.path());
    let engine = RecordingEngine::default();
    let resolv = home.path().join("resolv.conf");
    fs::write(&resolv, "nameserver 192.0.2.1\n").expect("write resolv");

    let mut bundle = Chroot::new(spec("life", &archive), home.path())
        .with_probe(FixedProbe::new(false))
        .with_filesystem(engine.clone())
        .with_resolv_conf(&resolv);

    bundle.start().expect("Failed to start");
    assert!(bundle.is_running());

    {
        let log = engine.log.lock().expect("log");
        let opts = &log.mounted[0];
        assert_eq!(opts.target, home.path().join(".zbundle/life"));
        assert_eq!(opts.backend, home.path().join(".zbundle.wd/life"));
        assert_eq!(opts.cache, home.path().join(".zbundle.cache"));
        assert_eq!(opts.meta.path(), home.path().join(".zbundle.wd/life.db"));
        assert_eq!(opts.storage.url().as_str(), "zdb://localhost:9900");
    }

    let root = bundle.mount_root().to_path_buf();
    assert!(root.join("proc/self").exists());
    assert_eq!(
        fs::read_to_string(root.join("etc/resolv.conf")).expect("resolv"),
        "nameserver 192.0.2.1\n"
    );
    assert!(home.path().join(".zbundle.wd/life.db/etc/env").is_file());

    bundle.wait().expect("Failed to wait");
    assert_eq!(engine.log.lock().expect("log").waits, 1);

    bundle.stop().expect("Failed to stop");

    assert!(!bundle.is_running());
    assert_eq!(engine.log.lock().expect("log").unmounts, 1);
    assert!(!home.path().join(".zbundle.wd/life.db").exists());
    assert!(!root.join("proc/self").exists());
}

#[test]
#[ignore = "requires root"]
fn test_stop_removes_meta_even_if_unmount_fails() {
    let home = tempfile::tempdir().expect("Failed to create temp dir");
    let archive = tar_archive(home.path());
    let engine = RecordingEngine::failing_unmount();

    let mut bundle = Chroot::new(spec("stuck", &archive), home.path())
        .with_probe(FixedProbe::new(false))
        .with_filesystem(engine.clone());

    bundle.start().expect("Failed to start");
    let result = bundle.stop();

    assert!(matches!(result, Err(BundleError::MountFailed(EngineError::Unmount { .. }))));
    assert!(!home.path().join(".zbundle.wd/stuck.db").exists());
    assert!(bundle.is_running());
    assert!(!bundle.mount_root().join("proc/self").exists());
}
