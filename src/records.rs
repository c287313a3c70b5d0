//! Summary-record files
//!
//! Flow, session and user summaries are persisted for the external
//! clustering trainer in a framed binary format: a big-endian u64 record
//! count, then repeated `{be_u64 size || message}` frames where each
//! message is a bincode-encoded chunk of records. End-of-file terminates
//! the frame sequence.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordFileError {
    #[error("record file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("record codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("truncated frame header")]
    TruncatedHeader,
}

/// Write records in chunks of `chunk_size` per frame.
pub fn write_records<T: Serialize>(
    path: &Path,
    records: &[T],
    chunk_size: usize,
) -> Result<(), RecordFileError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&(records.len() as u64).to_be_bytes())?;
    for chunk in records.chunks(chunk_size.max(1)) {
        let body = bincode::serialize(chunk)?;
        writer.write_all(&(body.len() as u64).to_be_bytes())?;
        writer.write_all(&body)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a record file written by [`write_records`].
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, RecordFileError> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;
    let count = u64::from_be_bytes(header) as usize;
    let mut records = Vec::with_capacity(count);

    loop {
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let size = u64::from_be_bytes(header);
        let mut body = vec![0u8; size as usize];
        reader
            .read_exact(&mut body)
            .map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => RecordFileError::TruncatedHeader,
                _ => RecordFileError::Io(e),
            })?;
        let chunk: Vec<T> = bincode::deserialize(&body)?;
        records.extend(chunk);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        addr: u64,
        count: i64,
    }

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample {
                addr: i as u64,
                count: (i * 3) as i64,
            })
            .collect()
    }

    #[test]
    fn round_trips_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.data");
        let records = samples(12_345);

        write_records(&path, &records, 5_000).unwrap();
        let loaded: Vec<Sample> = read_records(&path).unwrap();
        assert_eq!(loaded, records);
    }

    #[test]
    fn empty_file_has_count_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.data");
        write_records::<Sample>(&path, &[], 5_000).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
        let loaded: Vec<Sample> = read_records(&path).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn count_header_is_big_endian() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two.data");
        write_records(&path, &samples(2), 5_000).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], &2u64.to_be_bytes());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.data");
        write_records(&path, &samples(10), 5).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        let result: Result<Vec<Sample>, _> = read_records(&path);
        assert!(result.is_err());
    }
}
