//! Archive fetching.
//!
//! Resolves an archive locator (local path, `file://`, `http://` or `https://`)
//! to a byte stream and stacks the decompressor selected by the locator's file
//! extension. The returned [`LayeredStream`] yields plain tar bytes and owns
//! every layer that was opened.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//!
//! let mut stream = zbundle::fetch::fetch("https://hub.grid.tf/tf-official-apps/ubuntu.flist").unwrap();
//! let mut tar = Vec::new();
//! stream.read_to_end(&mut tar).unwrap();
//! ```

mod format;
mod layered;

pub use format::{ArchiveFormat, extension};
pub use layered::{LayerReader, LayeredStream};

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, instrument};
use url::Url;

use crate::error::FetchError;

/// Connect timeout for remote archives. The body itself has no deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where an archive locator points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A file on the local filesystem.
    Local(PathBuf),
    /// An HTTP or HTTPS resource.
    Remote(Url),
}

impl Locator {
    /// Parses a locator string.
    ///
    /// Strings without a scheme are treated as local paths.
    pub fn parse(locator: &str) -> Result<Self, FetchError> {
        match Url::parse(locator) {
            Ok(url) => match url.scheme() {
                "file" => url
                    .to_file_path()
                    .map(Self::Local)
                    .map_err(|()| FetchError::LocatorInvalid {
                        locator: locator.to_string(),
                        reason: "file URL does not name a local path".to_string(),
                    }),
                "http" | "https" => Ok(Self::Remote(url)),
                scheme => Err(FetchError::UnsupportedLocator {
                    locator: locator.to_string(),
                    scheme: scheme.to_string(),
                }),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                if locator.is_empty() {
                    return Err(FetchError::LocatorInvalid {
                        locator: String::new(),
                        reason: "empty locator".to_string(),
                    });
                }
                Ok(Self::Local(PathBuf::from(locator)))
            }
            Err(e) => Err(FetchError::LocatorInvalid {
                locator: locator.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// The path whose final segment selects the archive format.
    #[must_use]
    pub fn format_path(&self) -> String {
        match self {
            Self::Local(path) => path.to_string_lossy().into_owned(),
            Self::Remote(url) => url.path().to_string(),
        }
    }
}

/// Fetches the archive at `locator` and returns a stream of tar bytes.
///
/// # Errors
///
/// Returns:
/// - `FetchError::LocatorInvalid` / `FetchError::UnsupportedLocator` for bad locators
/// - `FetchError::NotFound` if a local archive does not exist
/// - `FetchError::FetchFailed` if the server does not answer 200
/// - `FetchError::UnknownFormat` if the extension is not supported
/// - `FetchError::Decoder` if the compressed header is invalid
///
/// Every layer opened before a failure is closed before returning.
#[instrument(skip_all, fields(locator = %locator))]
pub fn fetch(locator: &str) -> Result<LayeredStream, FetchError> {
    let parsed = Locator::parse(locator)?;
    let format_path = parsed.format_path();

    let stream = match parsed {
        Locator::Local(path) => LayeredStream::new("file", open_local(&path)?),
        Locator::Remote(url) => LayeredStream::new("http", open_remote(url)?),
    };

    decode(stream, &format_path)
}

/// Stacks the decoder selected by `format_path` on top of `stream`.
///
/// If the format is unknown or the decoder cannot be built, `stream` is closed
/// before the error is returned.
pub fn decode(mut stream: LayeredStream, format_path: &str) -> Result<LayeredStream, FetchError> {
    let format = match ArchiveFormat::from_path(format_path) {
        Ok(format) => format,
        Err(e) => {
            stream.close();
            return Err(e);
        }
    };

    debug!(%format, "Selected archive format");
    format.decode(&mut stream)?;
    Ok(stream)
}

fn open_local(path: &Path) -> Result<File, FetchError> {
    fs::metadata(path).map_err(|e| FetchError::NotFound {
        path: path.to_path_buf(),
        source: e,
    })?;

    debug!(path = %path.display(), "Opening local archive");
    File::open(path).map_err(|e| FetchError::Io {
        context: format!("failed to open archive: {}", path.display()),
        source: e,
    })
}

fn open_remote(url: Url) -> Result<impl Read + Send + 'static, FetchError> {
    let locator = url.to_string();
    let client = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(None)
        .build()
        .map_err(|e| FetchError::Http {
            locator: locator.clone(),
            source: e,
        })?;

    debug!(%locator, "Downloading archive");
    let response = client.get(url).send().map_err(|e| FetchError::Http {
        locator: locator.clone(),
        source: e,
    })?;

    if response.status() != StatusCode::OK {
        return Err(FetchError::FetchFailed {
            locator,
            status: response.status().as_u16(),
        });
    }

    Ok(response)
}
