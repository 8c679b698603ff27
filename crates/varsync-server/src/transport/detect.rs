//! Protocol detection from the first four bytes of a connection.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Request-line starts that route a connection to the text protocol.
pub const TEXT_PREFIXES: [&[u8; 4]; 7] = [b"GET ", b"POST", b"PUT ", b"DELE", b"HEAD", b"PATC", b"OPTI"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Text,
    /// The four bytes are a big-endian frame length.
    Packet,
}

pub fn classify(prefix: &[u8; 4]) -> Protocol {
    if TEXT_PREFIXES.iter().any(|p| *p == prefix) {
        Protocol::Text
    } else {
        Protocol::Packet
    }
}

/// Read the prefix and hand back a stream that replays it first.
pub async fn detect<S>(mut stream: S) -> io::Result<(Protocol, Rewind<S>)>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    Ok((classify(&prefix), Rewind::new(prefix, stream)))
}

pin_project! {
    /// A stream with already-consumed bytes pushed back in front of it.
    pub struct Rewind<S> {
        prefix: [u8; 4],
        pos: usize,
        #[pin]
        inner: S,
    }
}

impl<S> Rewind<S> {
    pub fn new(prefix: [u8; 4], inner: S) -> Self {
        Self { prefix, pos: 0, inner }
    }
}

impl<S: AsyncRead> AsyncRead for Rewind<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.pos < this.prefix.len() {
            let rest = &this.prefix[*this.pos..];
            let n = rest.len().min(buf.remaining());
            buf.put_slice(&rest[..n]);
            *this.pos += n;
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for Rewind<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn text_prefixes_route_to_text() {
        for prefix in TEXT_PREFIXES {
            assert_eq!(classify(prefix), Protocol::Text);
        }
    }

    #[test]
    fn anything_else_is_a_length() {
        assert_eq!(classify(&[0, 0, 0, 42]), Protocol::Packet);
        assert_eq!(classify(b"get "), Protocol::Packet);
        assert_eq!(classify(b"GETX"), Protocol::Packet);
        assert_eq!(classify(b"PUTS"), Protocol::Packet);
    }

    #[tokio::test]
    async fn prefix_is_replayed() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"POST /api/1 HTTP/1.1\r\n").await.unwrap();
        drop(client);

        let (protocol, mut stream) = detect(server).await.unwrap();
        assert_eq!(protocol, Protocol::Text);
        let mut all = String::new();
        stream.read_to_string(&mut all).await.unwrap();
        assert_eq!(all, "POST /api/1 HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn short_reads_drain_prefix_in_pieces() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 2, b'[', b']']).await.unwrap();
        drop(client);

        let (protocol, mut stream) = detect(server).await.unwrap();
        assert_eq!(protocol, Protocol::Packet);
        let mut two = [0u8; 2];
        stream.read_exact(&mut two).await.unwrap();
        assert_eq!(two, [0, 0]);
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, vec![0, 2, b'[', b']']);
    }

    #[tokio::test]
    async fn early_close_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"GE").await.unwrap();
        drop(client);
        assert!(detect(server).await.is_err());
    }
}
