//! Consumes the Handler's single ordered record stream and appends it to
//! the transaction log (§4.9). Close drains whatever is still buffered,
//! fsyncs and closes the file, so the Handler is never blocked for longer
//! than one fsync interval.

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::RuncoreResult;
use crate::record::Record;
use crate::txlog::TransactionLogWriter;

/// Suggested channel depth (§4.9).
pub const CHANNEL_DEPTH: usize = 32;

pub struct Writer {
    rx: mpsc::Receiver<Record>,
    log: TransactionLogWriter,
}

impl Writer {
    pub fn new(rx: mpsc::Receiver<Record>, log: TransactionLogWriter) -> Self {
        Self { rx, log }
    }

    /// Run until the channel closes, then flush and fsync. Errors appending
    /// a single record are logged and the loop continues, since a stalled
    /// transaction log must not stop the run from progressing; the final
    /// `close()` error, if any, is returned to the caller.
    pub async fn run(mut self) -> RuncoreResult<()> {
        while let Some(record) = self.rx.recv().await {
            if let Err(e) = self.log.append(&record).await {
                error!(error = %e, "failed to append record to transaction log");
            }
        }
        debug!("writer channel closed, draining and closing log");
        self.log.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use crate::txlog::TransactionLogReader;

    #[tokio::test]
    async fn drains_channel_and_closes_log_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let log = TransactionLogWriter::create(&path).await.unwrap();

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let writer = Writer::new(rx, log);
        let handle = tokio::spawn(writer.run());

        for _ in 0..5 {
            tx.send(Record::new(RecordKind::Header)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap().unwrap();

        let mut reader = TransactionLogReader::open(&path).await.unwrap();
        let mut count = 0;
        while reader.next_record().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
