use std::io;

use bytes::{Bytes, BytesMut};
use clap::ValueEnum;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound for a single chunk read from a peer.
pub const BUFFER_SIZE: usize = 1024;

/// Longest line accepted in line framing, terminator included. Leaves room
/// for a rendered `[name]: ` prefix on a full chunk.
pub const MAX_LINE_LENGTH: usize = 4 * BUFFER_SIZE;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// How payloads are delimited on the TCP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Framing {
    /// Whatever a single read returns (up to [`BUFFER_SIZE`] bytes) is one message.
    /// Works with plain netcat-style peers but relies on the sender's writes
    /// not being split or coalesced in transit.
    #[default]
    Chunk,
    /// Newline-delimited messages. Writes append `\n`, reads strip line endings.
    Line,
}

pub struct PayloadReader<R> {
    inner: BufReader<R>,
    framing: Framing,
    line: Vec<u8>,
}

impl<R> PayloadReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, framing: Framing) -> Self {
        Self {
            inner: BufReader::new(inner),
            framing,
            line: Vec::new(),
        }
    }

    /// Returns the next payload, or `None` once the peer has closed its side.
    /// A line longer than [`MAX_LINE_LENGTH`] is an `InvalidData` error.
    ///
    /// Cancel safe: in line mode a partially read line stays buffered and is
    /// completed by the next call.
    pub async fn read_payload(&mut self) -> io::Result<Option<Bytes>> {
        match self.framing {
            Framing::Chunk => self.read_chunk().await,
            Framing::Line => self.read_line().await,
        }
    }

    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::zeroed(BUFFER_SIZE);
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }

    async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        let budget = MAX_LINE_LENGTH.saturating_sub(self.line.len()) as u64;
        let n = (&mut self.inner)
            .take(budget)
            .read_until(b'\n', &mut self.line)
            .await?;
        if self.line.len() >= MAX_LINE_LENGTH && self.line.last() != Some(&b'\n') {
            self.line.clear();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {MAX_LINE_LENGTH} bytes"),
            ));
        }
        if n == 0 && self.line.is_empty() {
            return Ok(None);
        }

        let mut line = std::mem::take(&mut self.line);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Some(Bytes::from(line)))
    }
}

/// Writes one payload and flushes it so peers see it promptly.
pub async fn write_payload<W>(writer: &mut W, framing: Framing, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match framing {
        Framing::Chunk => writer.write_all(payload).await?,
        Framing::Line => {
            let mut encoded = Vec::with_capacity(payload.len() + 1);
            encoded.extend_from_slice(payload);
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
        }
    }
    writer.flush().await
}

/// Decodes a payload for display, replacing invalid UTF-8 and trailing line endings.
pub fn display_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .trim_end_matches(LINE_ENDINGS)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunk_reads_return_available_bytes() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let mut reader = PayloadReader::new(reader, Framing::Chunk);

        write_payload(&mut writer, Framing::Chunk, b"alice")
            .await
            .expect("write name");
        let payload = reader
            .read_payload()
            .await
            .expect("read")
            .expect("payload");
        assert_eq!(&payload[..], b"alice");

        drop(writer);
        assert!(reader.read_payload().await.expect("read eof").is_none());
    }

    #[tokio::test]
    async fn chunk_reads_are_capped_at_buffer_size() {
        let (mut writer, reader) = tokio::io::duplex(4 * BUFFER_SIZE);
        let mut reader = PayloadReader::new(reader, Framing::Chunk);

        let big = vec![b'x'; BUFFER_SIZE + 10];
        write_payload(&mut writer, Framing::Chunk, &big)
            .await
            .expect("write");
        let first = reader.read_payload().await.expect("read").expect("payload");
        assert_eq!(first.len(), BUFFER_SIZE);
    }

    #[tokio::test]
    async fn line_framing_splits_coalesced_writes() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = PayloadReader::new(reader, Framing::Line);

        writer
            .write_all(b"bob\r\nhello there\n")
            .await
            .expect("write lines");
        drop(writer);

        let name = reader.read_payload().await.expect("read").expect("name");
        let text = reader.read_payload().await.expect("read").expect("text");
        assert_eq!(&name[..], b"bob");
        assert_eq!(&text[..], b"hello there");
        assert!(reader.read_payload().await.expect("read eof").is_none());
    }

    #[tokio::test]
    async fn line_framing_returns_unterminated_tail_before_eof() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = PayloadReader::new(reader, Framing::Line);

        writer.write_all(b"partial").await.expect("write");
        drop(writer);

        let tail = reader.read_payload().await.expect("read").expect("tail");
        assert_eq!(&tail[..], b"partial");
        assert!(reader.read_payload().await.expect("read eof").is_none());
    }

    #[tokio::test]
    async fn line_framing_rejects_overlong_lines() {
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let mut reader = PayloadReader::new(reader, Framing::Line);

        let flood = tokio::spawn(async move {
            let chunk = vec![b'x'; 64 * 1024];
            for _ in 0..128 {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let err = reader.read_payload().await.expect_err("line too long");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        drop(reader);
        flood.await.expect("writer stops");
    }

    #[tokio::test]
    async fn line_framing_accepts_line_at_limit() {
        let (mut writer, reader) = tokio::io::duplex(2 * MAX_LINE_LENGTH);
        let mut reader = PayloadReader::new(reader, Framing::Line);

        let mut line = vec![b'y'; MAX_LINE_LENGTH - 2];
        line.extend_from_slice(b"\r\n");
        writer.write_all(&line).await.expect("write");

        let payload = reader.read_payload().await.expect("read").expect("line");
        assert_eq!(payload.len(), MAX_LINE_LENGTH - 2);
    }

    #[test]
    fn display_text_is_lossy() {
        assert_eq!(display_text(b"hi\n"), "hi");
        assert_eq!(display_text(&[0x68, 0xff, 0x69]), "h\u{fffd}i");
    }
}
