//! Environment file parsing.
//!
//! The in-root environment file holds one `KEY=VALUE` per line. Blank lines
//! and lines starting with `#` are ignored; there is no quoting or escaping.
//! Duplicate keys are kept in order and resolved last-one-wins at exec time.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Component, Path, PathBuf};

use tracing::trace;

use crate::error::SandboxError;

/// Parses environment lines from `reader`.
///
/// # Errors
///
/// Returns the underlying read error.
pub fn parse_env<R: BufRead>(reader: R) -> io::Result<Vec<String>> {
    let mut env = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        env.push(line.to_string());
    }
    Ok(env)
}

/// Reads the environment file `env_file` of the tree at `root`.
///
/// A missing file yields an empty environment.
///
/// # Errors
///
/// Returns `SandboxError::Environment` for any other read failure.
pub fn environ(root: &Path, env_file: &Path) -> Result<Vec<String>, SandboxError> {
    let path = in_root(root, env_file);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            trace!(path = %path.display(), "No environment file");
            return Ok(Vec::new());
        }
        Err(e) => return Err(SandboxError::Environment { path, source: e }),
    };

    parse_env(BufReader::new(file)).map_err(|e| SandboxError::Environment { path, source: e })
}

/// Appends `overrides` after `base` so overrides win on lookup.
#[must_use]
pub fn merge_env<S: AsRef<str>>(base: Vec<String>, overrides: &[S]) -> Vec<String> {
    let mut env = base;
    env.extend(overrides.iter().map(|s| s.as_ref().to_string()));
    env
}

/// Resolves a path as seen from inside `root`.
pub(crate) fn in_root(root: &Path, path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    root.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let input = "# comment\nFOO=bar\n\nBAZ=qux\n";
        assert_eq!(parse_env(input.as_bytes()).unwrap(), vec!["FOO=bar", "BAZ=qux"]);
    }

    #[test]
    fn test_parse_trims_and_keeps_duplicates() {
        let input = "  A=1  \n\t# indented comment\nA=2\r\n";
        assert_eq!(parse_env(input.as_bytes()).unwrap(), vec!["A=1", "A=2"]);
    }

    #[test]
    fn test_merge_puts_overrides_last() {
        let merged = merge_env(vec!["A=1".to_string()], &["A=2", "B=3"]);
        assert_eq!(merged, vec!["A=1", "A=2", "B=3"]);
    }

    #[test]
    fn test_in_root() {
        assert_eq!(
            in_root(Path::new("/mnt/root"), Path::new("/etc/env")),
            PathBuf::from("/mnt/root/etc/env")
        );
    }

    #[test]
    fn test_environ_unreadable_is_error() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc/env")).unwrap();
        // A directory opens but cannot be read as lines.
        let result = environ(root.path(), Path::new("/etc/env"));
        assert!(matches!(result, Err(SandboxError::Environment { .. })));
    }
}
