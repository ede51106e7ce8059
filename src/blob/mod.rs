//! Named-blob container carrying serialized indexes.
//!
//! An index writes one or more named byte blobs into a [`BinarySet`] and
//! reads them back by name. The set itself can be written to and read from
//! bytes or a file.
//!
//! # File Format
//!
//! ```text
//! [MAGIC 8B "ANNEXBS\0"][VERSION u32][FLAGS u32][CHECKSUM u32]
//! [PAYLOAD bincode: name -> bytes]
//! ```
//!
//! # Example
//!
//! ```
//! use annex::BinarySet;
//!
//! let mut set = BinarySet::new();
//! set.append("FLAT", vec![1, 2, 3]);
//! let bytes = set.to_bytes().unwrap();
//! let back = BinarySet::from_bytes(&bytes).unwrap();
//! assert_eq!(back.get_by_name("FLAT").unwrap().data(), &[1, 2, 3]);
//! ```

mod format;

pub use format::{FileHeader, FormatFlags, FORMAT_VERSION, MAGIC};

use crate::error::{AnnexError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// One serialized blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    data: Arc<[u8]>,
}

impl Binary {
    /// Blob bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Blob length in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Serialize, Deserialize)]
struct Payload {
    blobs: BTreeMap<String, Vec<u8>>,
}

/// Container of named blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinarySet {
    blobs: BTreeMap<String, Binary>,
    flags: FormatFlags,
}

impl BinarySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the blob called `name`.
    pub fn append(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.blobs.insert(name.into(), Binary { data: data.into() });
    }

    /// The blob called `name`.
    pub fn get_by_name(&self, name: &str) -> Result<&Binary> {
        self.blobs
            .get(name)
            .ok_or_else(|| AnnexError::BlobNotFound(name.to_string()))
    }

    /// True if a blob called `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.blobs.contains_key(name)
    }

    /// Blob names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.blobs.keys().map(String::as_str)
    }

    /// Number of blobs.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// True if the set holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Container flags.
    pub fn flags(&self) -> FormatFlags {
        self.flags
    }

    /// Set a container flag.
    pub fn set_flag(&mut self, flag: u32) {
        self.flags.set(flag);
    }

    /// Serialize the set with header and checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = Payload {
            blobs: self
                .blobs
                .iter()
                .map(|(name, blob)| (name.clone(), blob.data.to_vec()))
                .collect(),
        };
        let body = bincode::serialize(&payload)?;
        let header = FileHeader::new(self.flags, crc32fast::hash(&body));

        let mut out = Vec::with_capacity(FileHeader::SIZE + body.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse a set produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let body = verify_header(data)?;
        let header = FileHeader::from_bytes(&data[..FileHeader::SIZE])?;
        let payload: Payload = bincode::deserialize(body)?;
        Ok(Self {
            blobs: payload
                .blobs
                .into_iter()
                .map(|(name, data)| (name, Binary { data: data.into() }))
                .collect(),
            flags: header.flags,
        })
    }

    /// Write the set to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        use std::io::Write;

        let bytes = self.to_bytes()?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read a set from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

/// Verify file header and return the payload section.
fn verify_header(data: &[u8]) -> Result<&[u8]> {
    if data.len() < FileHeader::SIZE {
        return Err(AnnexError::invalid_format("file too small for header"));
    }

    let header = FileHeader::from_bytes(&data[..FileHeader::SIZE])?;
    header.verify()?;

    let body = &data[FileHeader::SIZE..];
    if crc32fast::hash(body) != header.checksum {
        return Err(AnnexError::ChecksumMismatch);
    }

    Ok(body)
}
