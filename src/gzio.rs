//! Transparent gzip-or-plain file storage.
//!
//! Queue snapshots, tester records and page-run caches are written as
//! `<name>.gz`; reads prefer the compressed variant and fall back to a plain
//! file with the same name so hand-placed or legacy files still load.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

fn gz_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".gz");
    PathBuf::from(os)
}

/// Check for either the compressed or uncompressed variant of a file.
pub fn gz_is_file(path: &Path) -> bool {
    gz_path(path).is_file() || path.is_file()
}

/// Read a file, preferring `<path>.gz` and decompressing it.
pub fn gz_read(path: &Path) -> Option<Vec<u8>> {
    let gz = gz_path(path);
    if gz.is_file() {
        let file = File::open(&gz).ok()?;
        let mut data = Vec::new();
        GzDecoder::new(file).read_to_end(&mut data).ok()?;
        return Some(data);
    }
    if path.is_file() {
        return std::fs::read(path).ok();
    }
    None
}

/// Read a file to a string, preferring the gzip variant.
pub fn gz_read_to_string(path: &Path) -> Option<String> {
    gz_read(path).and_then(|data| String::from_utf8(data).ok())
}

/// Read a file as lines, preferring the gzip variant.
pub fn gz_read_lines(path: &Path) -> Option<Vec<String>> {
    gz_read_to_string(path).map(|text| text.lines().map(str::to_string).collect())
}

/// Write gzip-compressed data to `<path>.gz`.
pub fn gz_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(gz_path(path))?;
    let mut encoder = GzEncoder::new(file, Compression::new(6));
    encoder.write_all(data)?;
    encoder.finish()?;
    Ok(())
}

/// Deflate-compress a payload (broker tube messages).
pub fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), Compression::new(7));
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflate a deflate-compressed payload.
pub fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
