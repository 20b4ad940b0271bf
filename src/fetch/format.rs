//! Archive format selection from the locator's file extension.

use std::fmt;
use std::io::{self, Cursor, Read};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;

use super::layered::{LayerReader, LayeredStream};
use crate::error::FetchError;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";

/// Compression wrapped around the tar payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// gzip-compressed tar (`.tgz`, `.flist`, `.gz`).
    Gzip,
    /// bzip2-compressed tar (`.tbz2`, `.bz2`).
    Bzip2,
    /// Plain tar (`.tar`).
    Tar,
}

impl ArchiveFormat {
    /// Selects the format from a file extension, dot included.
    ///
    /// Matching is exact and case-sensitive.
    pub fn from_extension(ext: &str) -> Result<Self, FetchError> {
        match ext {
            ".tgz" | ".flist" | ".gz" => Ok(Self::Gzip),
            ".tbz2" | ".bz2" => Ok(Self::Bzip2),
            ".tar" => Ok(Self::Tar),
            other => Err(FetchError::UnknownFormat {
                ext: other.to_string(),
            }),
        }
    }

    /// Selects the format from the final segment of a path.
    pub fn from_path(path: &str) -> Result<Self, FetchError> {
        Self::from_extension(extension(path))
    }

    /// Stacks the decoder for this format on top of `stream`.
    ///
    /// On failure every layer already in `stream` is closed.
    pub fn decode(self, stream: &mut LayeredStream) -> Result<(), FetchError> {
        let result = match self {
            Self::Gzip => stream.push_with("gzip", |below| {
                checked(below, GZIP_MAGIC).map(MultiGzDecoder::new)
            }),
            Self::Bzip2 => stream.push_with("bzip2", |below| {
                checked(below, BZIP2_MAGIC).map(MultiBzDecoder::new)
            }),
            Self::Tar => Ok(()),
        };

        result.map_err(|source| FetchError::Decoder {
            format: self.name(),
            source,
        })
    }

    /// Short lowercase name of the format.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Tar => "tar",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returns the extension of the final path segment, dot included, or `""`.
///
/// A leading dot counts, so `.flist` yields `.flist`.
#[must_use]
pub fn extension(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    match base.rfind('.') {
        Some(idx) => &base[idx..],
        None => "",
    }
}

/// Reads the stream header and verifies the magic bytes, then hands back a
/// reader that replays the header before the rest of the stream.
fn checked(mut below: LayerReader, magic: &[u8]) -> io::Result<io::Chain<Cursor<Vec<u8>>, LayerReader>> {
    let mut head = Vec::with_capacity(magic.len());
    (&mut below)
        .take(magic.len() as u64)
        .read_to_end(&mut head)?;

    if head != magic {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "stream does not start with the expected magic bytes",
        ));
    }

    Ok(Cursor::new(head).chain(below))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_of_final_segment() {
        assert_eq!(extension("/hub/ubuntu.flist"), ".flist");
        assert_eq!(extension("archive.tar.gz"), ".gz");
        assert_eq!(extension("/some.dir/archive"), "");
        assert_eq!(extension(".flist"), ".flist");
        assert_eq!(extension(""), "");
    }

    #[test]
    fn test_format_table() {
        for ext in [".tgz", ".flist", ".gz"] {
            assert_eq!(ArchiveFormat::from_extension(ext).unwrap(), ArchiveFormat::Gzip);
        }
        for ext in [".tbz2", ".bz2"] {
            assert_eq!(ArchiveFormat::from_extension(ext).unwrap(), ArchiveFormat::Bzip2);
        }
        assert_eq!(ArchiveFormat::from_extension(".tar").unwrap(), ArchiveFormat::Tar);
    }

    #[test]
    fn test_extension_is_case_sensitive() {
        match ArchiveFormat::from_path("image.TAR") {
            Err(FetchError::UnknownFormat { ext }) => assert_eq!(ext, ".TAR"),
            other => panic!("expected UnknownFormat, got {other:?}"),
        }
    }

    #[test]
    fn test_gzip_rejects_bad_magic() {
        let mut stream = LayeredStream::new("source", Cursor::new(b"not gzip".to_vec()));
        let result = ArchiveFormat::Gzip.decode(&mut stream);
        assert!(matches!(result, Err(FetchError::Decoder { format: "gzip", .. })));
    }

    #[test]
    fn test_tar_adds_no_layer() {
        let mut stream = LayeredStream::new("source", Cursor::new(Vec::new()));
        ArchiveFormat::Tar.decode(&mut stream).unwrap();
        assert_eq!(stream.depth(), 1);
    }
}
