use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::envelope::{RequestEnvelope, ResponseEnvelope, MAX_FIELD_SIZE};
use super::BoxedWriter;
use crate::codec::{Codec, JsonCodec};
use crate::error::{Result, RpcError};

type PendingMap = HashMap<u32, oneshot::Sender<Result<Bytes>>>;

struct SenderInner {
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl SenderInner {
    /// Fail every pending request and refuse new ones.
    fn close(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            self.closed.store(true, Ordering::Release);
            pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }
}

/// Removes a pending entry unless the request was written.
struct PendingGuard<'a> {
    inner: &'a SenderInner,
    request_id: u32,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.pending.lock().remove(&self.request_id);
        }
    }
}

/// Issues kind-tagged requests and matches responses to them by id.
///
/// One background task reads response envelopes for the lifetime of the
/// stream. Any number of requests may be outstanding; responses may arrive
/// in any order.
pub struct Sender<C: Codec = JsonCodec> {
    inner: Arc<SenderInner>,
    codec: C,
    reader_task: AbortHandle,
}

impl Sender<JsonCodec> {
    /// Start a sender on a read/write stream pair. Must be called within a
    /// tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_codec(reader, writer, JsonCodec)
    }
}

impl<C> Sender<C>
where
    C: Codec + Clone + Unpin + 'static,
{
    pub fn with_codec<R, W>(reader: R, writer: W, codec: C) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(SenderInner {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(read_loop(inner.clone(), reader));

        Self {
            inner,
            codec,
            reader_task: handle.abort_handle(),
        }
    }

    /// Send a request and return a future for its response.
    ///
    /// The request is written before this returns; the response can be
    /// awaited later.
    pub async fn send_and_receive<Req, Resp>(
        &self,
        kind: &str,
        request: &Req,
    ) -> Result<PendingResponse<Resp, C>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = self.codec.encode(request)?;
        let (request_id, rx) = self.send_raw(kind, Bytes::from(payload)).await?;

        Ok(PendingResponse {
            request_id,
            rx,
            codec: self.codec.clone(),
            _response: PhantomData,
        })
    }

    /// Send a request and wait for its response.
    pub async fn call<Req, Resp>(&self, kind: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.send_and_receive(kind, request).await?.await
    }

    /// Send an already encoded payload. The receiver yields the raw response
    /// body.
    ///
    /// Dropping the returned future before the write finishes forgets the
    /// request.
    pub async fn send_raw(
        &self,
        kind: &str,
        payload: Bytes,
    ) -> Result<(u32, oneshot::Receiver<Result<Bytes>>)> {
        for size in [kind.len(), payload.len()] {
            if size > MAX_FIELD_SIZE {
                return Err(RpcError::FieldTooLarge {
                    size,
                    max: MAX_FIELD_SIZE,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut pending = self.inner.pending.lock();
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(RpcError::ConnectionClosed);
            }
            // Ids wrap; skip any still waiting for a response.
            loop {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                if let Entry::Vacant(slot) = pending.entry(id) {
                    slot.insert(tx);
                    break id;
                }
            }
        };

        let mut guard = PendingGuard {
            inner: &self.inner,
            request_id,
            armed: true,
        };
        let envelope = RequestEnvelope::new(request_id, kind, payload);
        if let Err(e) = self.write(&envelope).await {
            tracing::debug!(request_id, kind, error = %e, "request write failed");
            return Err(e.into());
        }
        guard.armed = false;

        tracing::trace!(request_id, kind, "request sent");
        Ok((request_id, rx))
    }

    async fn write(&self, envelope: &RequestEnvelope) -> std::io::Result<()> {
        let bytes = envelope.encode();
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop reading responses and fail every pending request.
    pub fn shutdown(&self) {
        self.reader_task.abort();
        self.inner.close();
    }
}

impl<C: Codec> Drop for Sender<C> {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl<C: Codec> Debug for Sender<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .field("pending_requests", &self.inner.pending.lock().len())
            .field("codec", &self.codec)
            .finish()
    }
}

async fn read_loop<R>(inner: Arc<SenderInner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        match ResponseEnvelope::read_from(&mut reader).await {
            Ok(response) => {
                let request_id = response.request_id;
                let tx = inner.pending.lock().remove(&request_id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(response.into_result());
                    }
                    None => {
                        tracing::warn!(request_id, "response for unknown request dropped");
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("sender stream reached end of stream");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "sender reader failed");
                break;
            }
        }
    }

    inner.close();
}

/// Response to a request sent with [`Sender::send_and_receive`].
///
/// Resolves to the decoded response, to [`RpcError::Remote`] when the
/// handler failed, or to [`RpcError::ConnectionClosed`] when the stream
/// ended first.
#[must_use = "the response is lost unless awaited"]
pub struct PendingResponse<R, C: Codec = JsonCodec> {
    request_id: u32,
    rx: oneshot::Receiver<Result<Bytes>>,
    codec: C,
    _response: PhantomData<fn() -> R>,
}

impl<R, C: Codec> PendingResponse<R, C> {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }
}

impl<R, C> Future for PendingResponse<R, C>
where
    R: DeserializeOwned,
    C: Codec + Unpin,
{
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let body = match futures::ready!(Pin::new(&mut this.rx).poll(cx)) {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return Poll::Ready(Err(e)),
            Err(_) => return Poll::Ready(Err(RpcError::ConnectionClosed)),
        };
        Poll::Ready(this.codec.decode(&body))
    }
}

impl<R, C: Codec> Debug for PendingResponse<R, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("request_id", &self.request_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wrapped_id_skips_outstanding_request() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let sender = Sender::new(client_read, client_write);

        sender.inner.next_id.store(u32::MAX, Ordering::Relaxed);
        let last = sender.send_and_receive::<_, i32>("ECHO", &1).await.unwrap();
        let first = sender.send_and_receive::<_, i32>("ECHO", &2).await.unwrap();
        assert_eq!(last.request_id(), u32::MAX);
        assert_eq!(first.request_id(), 0);

        // Wrap again while both are still outstanding.
        sender.inner.next_id.store(u32::MAX, Ordering::Relaxed);
        let next = sender.send_and_receive::<_, i32>("ECHO", &3).await.unwrap();
        assert_eq!(next.request_id(), 1);
        assert_eq!(sender.pending_count(), 3);
    }
}
