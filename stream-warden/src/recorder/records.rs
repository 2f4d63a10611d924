//! Record splitting for capture process output.
//!
//! ffmpeg rewrites its stats line in place: every update ends with `\r` and a
//! `\n` only follows the final report. Splitting on `\n` alone would hold all
//! progress back until the process exits, so records end at either byte.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 4096;

/// Yields trimmed, non-empty text records delimited by `\r` or `\n`.
///
/// `next_record` is cancel safe: buffered bytes live in the reader, and the
/// only suspension point is a single `read`.
pub struct RecordReader<R> {
    inner: R,
    buffer: Vec<u8>,
    chunk: Box<[u8; READ_CHUNK]>,
}

fn is_delimiter(byte: &u8) -> bool {
    matches!(byte, b'\r' | b'\n')
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            chunk: Box::new([0u8; READ_CHUNK]),
        }
    }

    /// Next record, or `None` once the stream is exhausted.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            while let Some(end) = self.buffer.iter().position(is_delimiter) {
                let raw: Vec<u8> = self.buffer.drain(..=end).collect();
                let record = String::from_utf8_lossy(&raw[..end]).trim().to_string();
                if !record.is_empty() {
                    return Ok(Some(record));
                }
            }

            let read = self.inner.read(&mut self.chunk[..]).await?;
            if read == 0 {
                let rest = String::from_utf8_lossy(&self.buffer).trim().to_string();
                self.buffer.clear();
                return Ok((!rest.is_empty()).then_some(rest));
            }
            self.buffer.extend_from_slice(&self.chunk[..read]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn collect(input: &'static [u8]) -> Vec<String> {
        let (mut tx, rx) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = tx.write_all(input).await;
        });
        let mut reader = RecordReader::new(rx);
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().await.unwrap() {
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn test_splits_on_carriage_return_and_newline() {
        let records = collect(b"size=1kB time=00:00:01.00\rsize=2kB\r\n\r\nlast line").await;
        assert_eq!(records, vec!["size=1kB time=00:00:01.00", "size=2kB", "last line"]);
    }

    #[tokio::test]
    async fn test_record_is_available_before_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = RecordReader::new(rx);
        tx.write_all(b"frame=1\r").await.unwrap();

        let record = tokio::time::timeout(std::time::Duration::from_secs(1), reader.next_record())
            .await
            .expect("record should not wait for EOF")
            .unwrap();
        assert_eq!(record.as_deref(), Some("frame=1"));
        drop(tx);
        assert_eq!(reader.next_record().await.unwrap(), None);
    }
}
