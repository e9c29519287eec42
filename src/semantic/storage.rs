//! Binary snapshot of the backing store.
//!
//! File format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - fingerprint: [u8; 32] (SHA256 of the embedding model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Rows (repeated):
//! - id_len: u16, id: [u8; id_len] (UTF-8)
//! - flags: u8 (bit 0 = processed, bit 1 = has vector)
//! - created_at, updated_at: i64 (unix millis, little-endian)
//! - metadata_len: u32, metadata: [u8; metadata_len] (JSON object)
//! - vector: [f32; dimensions] (only when bit 1 is set)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};

use crate::semantic::backend::ContentRow;
use crate::semantic::record::{ContentId, Metadata};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + fingerprint(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

const FLAG_PROCESSED: u8 = 0b01;
const FLAG_HAS_VECTOR: u8 = 0b10;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Storage manager for the vectors.bin snapshot.
#[derive(Debug, Clone)]
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load all rows, validating header, fingerprint and dimensions.
    pub fn load(
        &self,
        expected_fingerprint: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<Vec<ContentRow>, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        validate_header(&header, expected_fingerprint, expected_dimensions)?;

        let mut rows = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            rows.push(read_row(&mut reader, header.dimensions as usize)?);
        }

        Ok(rows)
    }

    /// Save rows. Uses atomic write: temp file -> fsync -> rename
    pub fn save(
        &self,
        rows: &[ContentRow],
        fingerprint: &[u8; 32],
        dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(dimensions).map_err(|_| {
            VectorStorageError::InvalidFormat(format!("{dimensions} dimensions do not fit in u16"))
        })?;
        let temp_path = self.path.with_extension("tmp");

        let result = write_to_file(&temp_path, rows, fingerprint, dimensions);

        if result.is_err() {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    fingerprint: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

fn compute_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

fn write_to_file(
    path: &Path,
    rows: &[ContentRow],
    fingerprint: &[u8; 32],
    dimensions: u16,
) -> Result<(), VectorStorageError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes[0] = FORMAT_VERSION;
    header_bytes[1..33].copy_from_slice(fingerprint);
    header_bytes[33..35].copy_from_slice(&dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&(rows.len() as u64).to_le_bytes());
    let checksum = compute_checksum(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());
    writer.write_all(&header_bytes)?;

    for row in rows {
        write_row(&mut writer, row, dimensions as usize)?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version > FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes(take_array(&header_bytes[43..47]));
    if stored_checksum != compute_checksum(&header_bytes[0..43]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    Ok(Header {
        fingerprint: take_array(&header_bytes[1..33]),
        dimensions: u16::from_le_bytes(take_array(&header_bytes[33..35])),
        entry_count: u64::from_le_bytes(take_array(&header_bytes[35..43])),
    })
}

fn take_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn validate_header(
    header: &Header,
    expected_fingerprint: &[u8; 32],
    expected_dimensions: usize,
) -> Result<(), VectorStorageError> {
    if header.fingerprint != *expected_fingerprint {
        return Err(VectorStorageError::ModelMismatch);
    }

    if header.dimensions as usize != expected_dimensions {
        return Err(VectorStorageError::DimensionMismatch {
            expected: expected_dimensions,
            got: header.dimensions as usize,
        });
    }

    Ok(())
}

fn write_row(
    writer: &mut impl Write,
    row: &ContentRow,
    dimensions: usize,
) -> Result<(), VectorStorageError> {
    let id = row.id.as_bytes();
    let id_len = u16::try_from(id.len())
        .map_err(|_| VectorStorageError::InvalidFormat(format!("id '{}' too long", row.id)))?;
    writer.write_all(&id_len.to_le_bytes())?;
    writer.write_all(id)?;

    let vector = row.vector.as_ref().filter(|v| v.len() == dimensions);
    let mut flags = 0u8;
    if row.processed {
        flags |= FLAG_PROCESSED;
    }
    if vector.is_some() {
        flags |= FLAG_HAS_VECTOR;
    }
    writer.write_all(&[flags])?;

    writer.write_all(&row.created_at.timestamp_millis().to_le_bytes())?;
    writer.write_all(&row.updated_at.timestamp_millis().to_le_bytes())?;

    let metadata = serde_json::to_vec(&row.metadata)
        .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?;
    writer.write_all(&(metadata.len() as u32).to_le_bytes())?;
    writer.write_all(&metadata)?;

    if let Some(vector) = vector {
        for &value in vector {
            writer.write_all(&value.to_le_bytes())?;
        }
    }

    Ok(())
}

fn read_row(reader: &mut impl Read, dimensions: usize) -> Result<ContentRow, VectorStorageError> {
    let mut u16_bytes = [0u8; 2];
    reader.read_exact(&mut u16_bytes)?;
    let mut id = vec![0u8; u16::from_le_bytes(u16_bytes) as usize];
    reader.read_exact(&mut id)?;
    let id = String::from_utf8(id)
        .map_err(|e| VectorStorageError::InvalidFormat(format!("id is not UTF-8: {e}")))?;

    let mut flags = [0u8; 1];
    reader.read_exact(&mut flags)?;
    let flags = flags[0];

    let created_at = read_timestamp(reader)?;
    let updated_at = read_timestamp(reader)?;

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let mut metadata = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
    reader.read_exact(&mut metadata)?;
    let metadata: Metadata = serde_json::from_slice(&metadata)
        .map_err(|e| VectorStorageError::InvalidFormat(format!("metadata: {e}")))?;

    let vector = if flags & FLAG_HAS_VECTOR != 0 {
        let mut vector = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            let mut float_bytes = [0u8; 4];
            reader.read_exact(&mut float_bytes)?;
            vector.push(f32::from_le_bytes(float_bytes));
        }
        Some(vector)
    } else {
        None
    };

    Ok(ContentRow {
        id: ContentId::from(id),
        vector,
        processed: flags & FLAG_PROCESSED != 0,
        created_at,
        updated_at,
        metadata,
    })
}

fn read_timestamp(reader: &mut impl Read) -> Result<DateTime<Utc>, VectorStorageError> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    let millis = i64::from_le_bytes(bytes);
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| VectorStorageError::InvalidFormat(format!("bad timestamp {millis}")))
}
