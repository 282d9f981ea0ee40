//! Package Codec
//!
//! A web update package is a gzip-compressed tar stream of the replacement
//! web content tree. Decoding yields a [`FileTable`] of path → contents.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path};
use thiserror::Error;

/// Decoded web content, keyed by relative `/`-separated path.
pub type FileTable = BTreeMap<String, Vec<u8>>;

/// Default cap on the decompressed size of a package.
pub const DEFAULT_MAX_UNPACKED_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to decompress package: {0}")]
    Decompress(io::Error),
    #[error("Decompressed package exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("Failed to decode file table: {0}")]
    FileTable(io::Error),
    #[error("Unsafe path in package: {0}")]
    UnsafePath(String),
}

/// The decompress / decode pair applied to a verified package.
pub trait PackageCodec: Send + Sync {
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decode_file_table(&self, bytes: &[u8]) -> Result<FileTable, CodecError>;
}

/// gzip + tar, the format produced by [`pack_directory`].
#[derive(Debug, Clone)]
pub struct TarGzCodec {
    max_unpacked_bytes: u64,
}

impl TarGzCodec {
    pub fn new(max_unpacked_bytes: u64) -> Self {
        Self { max_unpacked_bytes }
    }
}

impl Default for TarGzCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNPACKED_BYTES)
    }
}

impl PackageCodec for TarGzCodec {
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut decoder = GzDecoder::new(bytes).take(self.max_unpacked_bytes.saturating_add(1));
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(CodecError::Decompress)?;
        if out.len() as u64 > self.max_unpacked_bytes {
            return Err(CodecError::TooLarge { limit: self.max_unpacked_bytes });
        }
        Ok(out)
    }

    fn decode_file_table(&self, bytes: &[u8]) -> Result<FileTable, CodecError> {
        let mut archive = tar::Archive::new(bytes);
        let mut table = FileTable::new();

        for entry in archive.entries().map_err(CodecError::FileTable)? {
            let mut entry = entry.map_err(CodecError::FileTable)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let path = entry.path().map_err(CodecError::FileTable)?;
            let key = table_key(&path)?;

            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).map_err(CodecError::FileTable)?;
            table.insert(key, contents);
        }

        Ok(table)
    }
}

/// Relative, traversal-free key for a package path.
fn table_key(path: &Path) -> Result<String, CodecError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(CodecError::UnsafePath(path.display().to_string())),
        }
    }
    if parts.is_empty() {
        return Err(CodecError::UnsafePath(path.display().to_string()));
    }
    Ok(parts.join("/"))
}

/// Build a package from every regular file under `dir`.
pub fn pack_directory(dir: &Path) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::best());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    append_dir(&mut builder, dir, dir)?;
    builder.into_inner()?.finish()
}

fn append_dir<W: io::Write>(builder: &mut tar::Builder<W>, root: &Path, dir: &Path) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            append_dir(builder, root, &path)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            builder.append_path_with_name(&path, relative)?;
        }
    }
    Ok(())
}

/// Encode a file table directly (used to build packages in memory).
pub fn pack_file_table(table: &FileTable) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::best());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in table {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, contents.as_slice())?;
    }
    builder.into_inner()?.finish()
}
