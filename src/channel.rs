//! Line-framed adapter over the control-channel byte transport.
//!
//! The transport is whatever byte stream the deployment wired up: a TCP
//! connection to the serial bridge or an already-created character
//! device. This is the only module that touches raw transport I/O.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Newline-framed reader/writer over a bidirectional byte stream.
pub struct LineChannel<S> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
}

impl<S> LineChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wraps an established byte stream.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Reads the next frame, without its line terminator.
    ///
    /// Returns `None` at end of stream. Bytes that are not valid UTF-8
    /// are replaced rather than failing the read; the OBC side is not
    /// guaranteed clean.
    pub async fn recv(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }

        let mut line = String::from_utf8_lossy(&buf).into_owned();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Writes one newline-terminated frame and flushes it.
    pub async fn send(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}
