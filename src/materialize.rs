//! Metadata materialization.
//!
//! Extracts the entries of a tar stream into `<namespace>.db`, the directory
//! that backs the bundle's metadata store. Directory entries are skipped;
//! parents are created as file entries need them.
//!
//! A failed materialization leaves whatever was written in place. The meta
//! directory must then be treated as invalid and removed before retrying.

use std::ffi::OsString;
use std::fs::{self, DirBuilder, File};
use std::io::{self, Read};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

use tar::Archive;
use tracing::{debug, instrument, trace};

use crate::error::MaterializeError;

/// Mode used for the meta directory and every parent created inside it.
const DIR_MODE: u32 = 0o755;

/// Returns the meta directory for a namespace: `<namespace>.db`.
#[must_use]
pub fn meta_dir(namespace: &Path) -> PathBuf {
    let mut name = OsString::from(namespace.as_os_str());
    name.push(".db");
    PathBuf::from(name)
}

/// Extracts `stream` into the meta directory of `namespace`.
///
/// Returns the meta directory path. The stream is consumed and dropped once the
/// end of the archive is reached.
///
/// # Errors
///
/// Returns:
/// - `MaterializeError::Archive` if the tar stream cannot be read
/// - `MaterializeError::UnsafePath` if an entry would land outside the meta directory
/// - `MaterializeError::Io` if a directory or file cannot be written
#[instrument(skip(stream), fields(namespace = %namespace.display()))]
pub fn materialize<R: Read>(namespace: &Path, stream: R) -> Result<PathBuf, MaterializeError> {
    let db = meta_dir(namespace);
    create_dirs(&db)?;

    let mut archive = Archive::new(stream);
    let entries = archive.entries().map_err(|e| MaterializeError::Archive {
        context: "failed to read archive entries".to_string(),
        source: e,
    })?;

    let mut written = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| MaterializeError::Archive {
            context: "failed to read archive entry".to_string(),
            source: e,
        })?;

        if entry.header().entry_type().is_dir() {
            continue;
        }

        let raw = entry.path().map_err(|e| MaterializeError::Archive {
            context: "failed to decode entry path".to_string(),
            source: e,
        })?;
        let relative = sanitize(&raw)?;
        let target = db.join(&relative);

        if let Some(parent) = target.parent() {
            create_dirs(parent)?;
        }

        let mut file = File::create(&target).map_err(|e| MaterializeError::Io {
            context: format!("failed to create {}", target.display()),
            source: e,
        })?;

        io::copy(&mut entry, &mut file).map_err(|e| MaterializeError::Io {
            context: format!("failed to write {}", target.display()),
            source: e,
        })?;

        trace!(path = %relative.display(), "Materialized entry");
        written += 1;
    }

    drop(archive);
    debug!(meta = %db.display(), files = written, "Metadata materialized");
    Ok(db)
}

/// Removes the meta directory of `namespace` if it exists.
///
/// # Errors
///
/// Returns `MaterializeError::Io` if the directory exists but cannot be removed.
pub fn discard(namespace: &Path) -> Result<bool, MaterializeError> {
    let db = meta_dir(namespace);
    match fs::remove_dir_all(&db) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(MaterializeError::Io {
            context: format!("failed to remove {}", db.display()),
            source: e,
        }),
    }
}

fn create_dirs(path: &Path) -> Result<(), MaterializeError> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .map_err(|e| MaterializeError::Io {
            context: format!("failed to create directory {}", path.display()),
            source: e,
        })
}

/// Strips root and `.` components and rejects `..`.
fn sanitize(path: &Path) -> Result<PathBuf, MaterializeError> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(MaterializeError::UnsafePath {
                    path: path.display().to_string(),
                });
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(MaterializeError::UnsafePath {
            path: path.display().to_string(),
        });
    }

    Ok(clean)
}
