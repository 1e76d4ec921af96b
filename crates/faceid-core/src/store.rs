//! Binary persistence for the enrolled reference embedding.
//!
//! Layout (all little-endian):
//!
//! ```text
//! offset 0   u32  magic 0xFAD1D00D
//! offset 4   i32  dim, 0 < dim <= 4096
//! offset 8   f32  x dim
//! ```
//!
//! A file is valid only when the magic matches, the dimension is in range and
//! exactly `dim` floats follow the header.

use crate::types::Embedding;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const STORE_MAGIC: u32 = 0xFAD1_D00D;
/// Largest dimension accepted by the store.
pub const MAX_STORED_DIM: usize = 4096;

const HEADER_LEN: usize = 8;
const FLOAT_LEN: usize = std::mem::size_of::<f32>();

/// Why a byte buffer is not a valid reference file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorruptReason {
    #[error("file is {0} bytes, shorter than the 8-byte header")]
    ShortHeader(usize),
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("dimension {0} outside 1..=4096")]
    BadDimension(i64),
    #[error("expected {expected} payload bytes, found {actual}")]
    PayloadLength { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no enrollment file at {}: {source}", .path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("enrollment file {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: CorruptReason },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refusing to store a {0}-dimensional embedding")]
    InvalidEmbedding(usize),
}

/// Serialize an embedding into the reference file layout.
pub fn encode(embedding: &Embedding) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + embedding.dim() * FLOAT_LEN);
    buf.extend_from_slice(&STORE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(embedding.dim() as i32).to_le_bytes());
    for value in &embedding.values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf
}

/// Parse a reference file. Never yields a partially populated embedding.
pub fn decode(bytes: &[u8]) -> Result<Embedding, CorruptReason> {
    if bytes.len() < HEADER_LEN {
        return Err(CorruptReason::ShortHeader(bytes.len()));
    }

    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != STORE_MAGIC {
        return Err(CorruptReason::BadMagic(magic));
    }

    let dim = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if dim <= 0 || dim as usize > MAX_STORED_DIM {
        return Err(CorruptReason::BadDimension(i64::from(dim)));
    }
    let dim = dim as usize;

    let payload = &bytes[HEADER_LEN..];
    let expected = dim * FLOAT_LEN;
    if payload.len() != expected {
        return Err(CorruptReason::PayloadLength {
            expected,
            actual: payload.len(),
        });
    }

    let values = payload
        .chunks_exact(FLOAT_LEN)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(Embedding::new(values))
}

/// Write `embedding` to `path`, creating parent directories.
///
/// The bytes go to a sibling `.tmp` file that is then renamed over `path`, so
/// an existing reference is replaced whole or left untouched.
pub fn save(path: &Path, embedding: &Embedding) -> Result<(), StoreError> {
    if embedding.dim() == 0 || embedding.dim() > MAX_STORED_DIM {
        return Err(StoreError::InvalidEmbedding(embedding.dim()));
    }

    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let tmp = staging_path(path);
    if let Err(err) = fs::write(&tmp, encode(embedding)).and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(write_err(err));
    }

    tracing::debug!(path = %path.display(), dim = embedding.dim(), "reference embedding written");
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read the reference embedding stored at `path`.
pub fn load(path: &Path) -> Result<Embedding, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::NotFound {
        path: path.to_path_buf(),
        source,
    })?;

    let embedding = decode(&bytes).map_err(|reason| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    })?;

    tracing::debug!(path = %path.display(), dim = embedding.dim(), "reference embedding loaded");
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(magic: u32, dim: i32) -> Vec<u8> {
        let mut buf = magic.to_le_bytes().to_vec();
        buf.extend_from_slice(&dim.to_le_bytes());
        buf
    }

    #[test]
    fn test_roundtrip_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enrolled.bin");

        for dim in [1usize, 2, 512, MAX_STORED_DIM] {
            let values: Vec<f32> = (0..dim)
                .map(|i| f32::from_bits(0x3f80_0000 ^ (i as u32).wrapping_mul(2_654_435_761)))
                .collect();
            let original = Embedding::new(values);

            save(&path, &original).unwrap();
            let loaded = load(&path).unwrap();

            assert_eq!(loaded.dim(), dim);
            let same_bits = original
                .values
                .iter()
                .zip(&loaded.values)
                .all(|(a, b)| a.to_bits() == b.to_bits());
            assert!(same_bits, "dim {dim} did not round-trip bit-for-bit");
        }
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode(&Embedding::new(vec![1.0, -2.5]));
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &[0x0D, 0xD0, 0xD1, 0xFA]);
        assert_eq!(&bytes[4..8], &2i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[12..16], &(-2.5f32).to_le_bytes());
    }

    #[test]
    fn test_decode_wrong_magic() {
        let mut bytes = header(0xDEAD_BEEF, 1);
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        assert_eq!(decode(&bytes), Err(CorruptReason::BadMagic(0xDEAD_BEEF)));
    }

    #[test]
    fn test_decode_dimension_out_of_range() {
        for dim in [0, -1, i32::MIN, MAX_STORED_DIM as i32 + 1] {
            let bytes = header(STORE_MAGIC, dim);
            assert_eq!(
                decode(&bytes),
                Err(CorruptReason::BadDimension(i64::from(dim))),
                "dim {dim}"
            );
        }
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut bytes = header(STORE_MAGIC, 4);
        bytes.extend_from_slice(&[0u8; 12]);
        assert_eq!(
            decode(&bytes),
            Err(CorruptReason::PayloadLength { expected: 16, actual: 12 })
        );
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = encode(&Embedding::new(vec![0.5; 3]));
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(CorruptReason::PayloadLength { .. })));
    }

    #[test]
    fn test_decode_short_header() {
        assert_eq!(decode(&[0x0D, 0xD0]), Err(CorruptReason::ShortHeader(2)));
        assert_eq!(decode(&[]), Err(CorruptReason::ShortHeader(0)));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.bin")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enrolled.bin");
        fs::write(&path, header(STORE_MAGIC, 8)).unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_save_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("enrolled.bin");
        save(&path, &Embedding::new(vec![0.25; 4])).unwrap();
        assert_eq!(load(&path).unwrap().values, vec![0.25; 4]);
    }

    #[test]
    fn test_save_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enrolled.bin");
        save(&path, &Embedding::new(vec![1.0; 64])).unwrap();
        save(&path, &Embedding::new(vec![2.0; 2])).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 16);
        assert_eq!(load(&path).unwrap().values, vec![2.0, 2.0]);
    }

    #[test]
    fn test_save_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enrolled.bin");
        save(&path, &Embedding::new(vec![1.0; 4])).unwrap();
        save(&path, &Embedding::new(vec![2.0; 4])).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("enrolled.bin")]);
    }

    #[test]
    fn test_failed_save_keeps_previous_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enrolled.bin");
        save(&path, &Embedding::new(vec![0.5; 8])).unwrap();

        // A directory squatting on the staging name makes the write fail.
        fs::create_dir(staging_path(&path)).unwrap();
        let err = save(&path, &Embedding::new(vec![3.0; 2])).unwrap_err();

        assert!(matches!(err, StoreError::Write { .. }));
        assert_eq!(load(&path).unwrap().values, vec![0.5; 8]);
    }

    #[test]
    fn test_save_rejects_empty_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enrolled.bin");
        let err = save(&path, &Embedding::new(Vec::new())).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbedding(0)));
        assert!(!path.exists());
    }

    #[test]
    fn test_save_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is expected.
        let blocker = dir.path().join("data");
        fs::write(&blocker, b"x").unwrap();
        let err = save(&blocker.join("enrolled.bin"), &Embedding::new(vec![1.0])).unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
    }
}
