//! Integration tests for archive fetching.
//!
//! Fixtures are built in-test: a small tar archive, compressed with each
//! supported codec and written under a temp directory with the matching
//! extension.

use std::fs;
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use zbundle::error::FetchError;
use zbundle::fetch::{self, LayeredStream};

fn tar_fixture() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in [("etc/env", &b"GREETING=hi\n"[..]), ("a/b/c.txt", b"payload")] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data)
            .expect("Failed to append entry");
    }
    builder.into_inner().expect("Failed to finish tar")
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).expect("Failed to gzip");
    enc.finish().expect("Failed to finish gzip")
}

fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    enc.write_all(data).expect("Failed to bzip2");
    enc.finish().expect("Failed to finish bzip2")
}

fn write_fixture(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).expect("Failed to write fixture");
    path
}

fn read_all(mut stream: LayeredStream) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).expect("Failed to read stream");
    out
}

fn entry_names(tar_bytes: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(tar_bytes);
    archive
        .entries()
        .expect("Failed to list entries")
        .map(|e| {
            e.expect("Bad entry")
                .path()
                .expect("Bad path")
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

// ============================================================================
// Format round-trips
// ============================================================================

#[test]
fn test_every_supported_extension_yields_original_tar() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let tar = tar_fixture();

    let fixtures = [
        ("image.tar", tar.clone()),
        ("image.tgz", gzip(&tar)),
        ("image.flist", gzip(&tar)),
        ("image.tar.gz", gzip(&tar)),
        ("image.tbz2", bzip2(&tar)),
        ("image.tar.bz2", bzip2(&tar)),
    ];

    for (name, bytes) in fixtures {
        let path = write_fixture(dir.path(), name, &bytes);
        let stream = fetch::fetch(path.to_str().expect("utf-8 path"))
            .unwrap_or_else(|e| panic!("fetch {name} failed: {e:?}"));
        let out = read_all(stream);

        assert_eq!(out, tar, "{name} did not round-trip");
        assert_eq!(entry_names(&out), vec!["etc/env", "a/b/c.txt"]);
    }
}

#[test]
fn test_file_url_locator() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let tar = tar_fixture();
    let path = write_fixture(dir.path(), "meta.tgz", &gzip(&tar));

    let locator = format!("file://{}", path.display());
    let stream = fetch::fetch(&locator).expect("Failed to fetch file URL");

    assert_eq!(stream.layer_names(), vec!["file", "gzip"]);
    assert_eq!(read_all(stream), tar);
}

#[test]
fn test_extension_is_case_sensitive() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = write_fixture(dir.path(), "IMAGE.TAR", &tar_fixture());

    match fetch::fetch(path.to_str().expect("utf-8 path")) {
        Err(FetchError::UnknownFormat { ext }) => assert_eq!(ext, ".TAR"),
        other => panic!("expected UnknownFormat, got {other:?}"),
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Serves one HTTP response on a loopback port and returns the base URL.
fn serve_once(status: &'static str, body: Vec<u8>) -> (String, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get address");

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("Failed to accept");
        let mut reader = BufReader::new(stream);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).expect("Failed to read request");
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).expect("Failed to read header");
            if line == "\r\n" || line.is_empty() {
                break;
            }
        }

        let mut stream = reader.into_inner();
        write!(
            stream,
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .expect("Failed to write head");
        stream.write_all(&body).expect("Failed to write body");
        request_line
    });

    (format!("http://{addr}"), server)
}

#[test]
fn test_http_archive_is_decoded() {
    let tar = tar_fixture();
    let (base, server) = serve_once("200 OK", gzip(&tar));

    let stream = fetch::fetch(&format!("{base}/hub/ubuntu.tgz")).expect("Failed to fetch");

    assert_eq!(stream.layer_names(), vec!["http", "gzip"]);
    assert_eq!(read_all(stream), tar);
    let request = server.join().expect("server panicked");
    assert!(request.starts_with("GET /hub/ubuntu.tgz "), "{request}");
}

#[test]
fn test_http_not_found_is_fetch_failed() {
    let (base, server) = serve_once("404 Not Found", b"no such flist".to_vec());

    let result = fetch::fetch(&format!("{base}/hub/missing.flist"));

    match result {
        Err(FetchError::FetchFailed { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected FetchFailed, got {other:?}"),
    }
    server.join().expect("server panicked");
}

// ============================================================================
// Failure paths
// ============================================================================

/// Source that counts how many times it is dropped.
struct CloseCounter {
    inner: Cursor<Vec<u8>>,
    closed: Arc<AtomicUsize>,
}

impl Read for CloseCounter {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for CloseCounter {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn counted(bytes: Vec<u8>) -> (LayeredStream, Arc<AtomicUsize>) {
    let closed = Arc::new(AtomicUsize::new(0));
    let source = CloseCounter {
        inner: Cursor::new(bytes),
        closed: Arc::clone(&closed),
    };
    (LayeredStream::new("test", source), closed)
}

#[test]
fn test_unknown_format_closes_source() {
    let (stream, closed) = counted(tar_fixture());

    let result = fetch::decode(stream, "/bundles/image.zip");

    match result {
        Err(FetchError::UnknownFormat { ext }) => assert_eq!(ext, ".zip"),
        other => panic!("expected UnknownFormat, got {other:?}"),
    }
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_bad_gzip_header_closes_source() {
    let (stream, closed) = counted(b"definitely not gzip".to_vec());

    let result = fetch::decode(stream, "image.flist");

    assert!(matches!(result, Err(FetchError::Decoder { .. })));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_successful_decode_closes_source_once_on_drop() {
    let (stream, closed) = counted(gzip(&tar_fixture()));

    let mut stream = fetch::decode(stream, "image.tgz").expect("Failed to decode");
    assert_eq!(closed.load(Ordering::SeqCst), 0);

    stream.close();
    drop(stream);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_missing_local_archive() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let missing = dir.path().join("absent.tar");

    let result = fetch::fetch(missing.to_str().expect("utf-8 path"));

    assert!(matches!(result, Err(FetchError::NotFound { .. })));
}

#[test]
fn test_unsupported_scheme() {
    let result = fetch::fetch("ftp://hub.grid.tf/image.flist");
    assert!(matches!(result, Err(FetchError::UnsupportedLocator { .. })));
}
