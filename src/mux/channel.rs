use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use super::Shared;
use crate::error::TransportResult;

/// Read half of a multiplexed channel.
///
/// Frames are queued without bound until read. Once the connection closes,
/// reads drain whatever is still queued and then report end-of-stream.
#[derive(Debug)]
pub struct ChannelReader {
    channel_id: u32,
    rx: mpsc::UnboundedReceiver<Bytes>,
    current: Bytes,
    eof: bool,
}

impl ChannelReader {
    pub(crate) fn new(channel_id: u32, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            channel_id,
            rx,
            current: Bytes::new(),
            eof: false,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if !this.current.is_empty() {
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current[..n]);
                this.current.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(chunk)) => this.current = chunk,
                Poll::Ready(None) => {
                    this.eof = true;
                    tracing::debug!(channel_id = this.channel_id, "channel read EOF");
                }
            }
        }
    }
}

/// Write half of a multiplexed channel.
///
/// A write is split into frames and queued for the connection's writer task
/// in one step, so it completes at once and never leaves part of a frame
/// behind if the caller stops polling. Queued frames are not bounded.
pub struct ChannelWriter {
    channel_id: u32,
    shared: Arc<Shared>,
}

impl ChannelWriter {
    pub(crate) fn new(channel_id: u32, shared: Arc<Shared>) -> Self {
        Self { channel_id, shared }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Queue `data` on this channel.
    pub fn send(&self, data: &[u8]) -> TransportResult<()> {
        self.shared.send(self.channel_id, data)
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        Poll::Ready(self.send(buf).map(|()| buf.len()).map_err(io::Error::from))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("channel_id", &self.channel_id)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}
