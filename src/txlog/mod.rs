//! Append-only transaction log: one file per run, written by the Writer
//! (§4.9) and replayed by the Sync Service (§4.13). File layout (§6):
//!
//! ```text
//! header := ":W&B" | uint16 LE 0xBEE1 | uint8 0x01
//! body   := (uint32 LE length | JSON-encoded Record)*
//! ```

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};

use crate::error::{RuncoreError, RuncoreResult};
use crate::record::Record;

const HEADER_MAGIC: &[u8; 4] = b":W&B";
const HEADER_IDENT: u16 = 0xBEE1;
const HEADER_VERSION: u8 = 0x01;
const HEADER_LEN: usize = 7;

fn io_err(source: io::Error, path: &Path) -> RuncoreError {
    RuncoreError::Io {
        source,
        path: Some(path.to_path_buf()),
    }
}

/// Single writer by construction (§5 shared-resource policy): callers are
/// expected to hold the only handle to a given run's log file.
pub struct TransactionLogWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

impl TransactionLogWriter {
    pub async fn create(path: impl Into<PathBuf>) -> RuncoreResult<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| io_err(e, &path))?;

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(HEADER_MAGIC);
        header.extend_from_slice(&HEADER_IDENT.to_le_bytes());
        header.push(HEADER_VERSION);
        file.write_all(&header).await.map_err(|e| io_err(e, &path))?;

        Ok(Self {
            path,
            file: BufWriter::new(file),
        })
    }

    /// Append one record as a length-prefixed JSON block.
    pub async fn append(&mut self, record: &Record) -> RuncoreResult<()> {
        let payload = serde_json::to_vec(record)?;
        let len = payload.len() as u32;
        self.file
            .write_all(&len.to_le_bytes())
            .await
            .map_err(|e| io_err(e, &self.path))?;
        self.file
            .write_all(&payload)
            .await
            .map_err(|e| io_err(e, &self.path))
    }

    /// Flush buffered writes and fsync, matching the Writer's drain-on-close
    /// contract (§4.9, §5).
    pub async fn close(mut self) -> RuncoreResult<()> {
        self.file.flush().await.map_err(|e| io_err(e, &self.path))?;
        self.file
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| io_err(e, &self.path))
    }
}

/// Sequential reader used by the Sync Service to replay a completed (or
/// partially written) log (§4.13).
pub struct TransactionLogReader {
    path: PathBuf,
    file: BufReader<File>,
}

impl TransactionLogReader {
    pub async fn open(path: impl Into<PathBuf>) -> RuncoreResult<Self> {
        let path = path.into();
        let mut file = File::open(&path).await.map_err(|e| io_err(e, &path))?;

        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)
            .await
            .map_err(|e| io_err(e, &path))?;
        if &header[0..4] != HEADER_MAGIC {
            return Err(RuncoreError::Protocol {
                reason: format!("bad transaction log header in {}", path.display()),
            });
        }
        let ident = u16::from_le_bytes([header[4], header[5]]);
        if ident != HEADER_IDENT {
            return Err(RuncoreError::Protocol {
                reason: format!("unrecognized transaction log ident {ident:#x}"),
            });
        }
        if header[6] != HEADER_VERSION {
            return Err(RuncoreError::Protocol {
                reason: format!("unsupported transaction log version {}", header[6]),
            });
        }

        Ok(Self {
            path,
            file: BufReader::new(file),
        })
    }

    /// Read the next record. Returns `Ok(None)` only at a clean end of
    /// file; any other error — including a length prefix with no matching
    /// payload — is a read error distinct from EOF (§4.13).
    pub async fn next_record(&mut self) -> RuncoreResult<Option<Record>> {
        let mut len_bytes = [0u8; 4];
        match self.file.read_exact(&mut len_bytes).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(io_err(e, &self.path)),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        self.file
            .read_exact(&mut payload)
            .await
            .map_err(|e| io_err(e, &self.path))?;
        let record: Record = serde_json::from_slice(&payload)?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;

    #[tokio::test]
    async fn write_then_read_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");

        let mut writer = TransactionLogWriter::create(&path).await.unwrap();
        let records = vec![
            Record::new(RecordKind::Header),
            Record::new(RecordKind::Exit(crate::record::ExitRecord { exit_code: 0 })),
            Record::new(RecordKind::Footer),
        ];
        for record in &records {
            writer.append(record).await.unwrap();
        }
        writer.close().await.unwrap();

        let mut reader = TransactionLogReader::open(&path).await.unwrap();
        for expected in &records {
            let got = reader.next_record().await.unwrap().expect("record");
            assert_eq!(got.id, expected.id);
        }
        assert!(reader.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.log");
        tokio::fs::write(&path, b"not a log").await.unwrap();
        let err = TransactionLogReader::open(&path).await.unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Protocol);
    }
}
