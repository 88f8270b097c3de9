use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::envelope::{RequestEnvelope, ResponseEnvelope, MAX_FIELD_SIZE};
use super::{BoxedReader, BoxedWriter};
use crate::codec::{Codec, JsonCodec};
use crate::error::{Result, RpcError};

/// Future returned by a handler: the encoded response body.
pub type HandlerFuture = BoxFuture<'static, Result<Bytes>>;

/// Type-erased request handler: encoded request in, encoded response out.
pub type Handler = Arc<dyn Fn(Bytes) -> HandlerFuture + Send + Sync>;

type SharedWriter = Arc<tokio::sync::Mutex<BoxedWriter>>;

/// Collects one handler per kind, then starts the receiver loop.
///
/// A request whose kind has no handler stops dispatching for good: that
/// request and every later one on the stream are answered with a failure
/// response, and the [`ReceiverHandle`] resolves to
/// [`RpcError::UnknownKind`].
pub struct ReceiverBuilder<C: Codec = JsonCodec> {
    reader: BoxedReader,
    writer: BoxedWriter,
    codec: C,
    handlers: HashMap<String, Handler>,
    expected: Vec<String>,
    duplicates: Vec<String>,
}

impl ReceiverBuilder<JsonCodec> {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_codec(reader, writer, JsonCodec)
    }
}

impl<C> ReceiverBuilder<C>
where
    C: Codec + Clone + 'static,
{
    pub fn with_codec<R, W>(reader: R, writer: W, codec: C) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            codec,
            handlers: HashMap::new(),
            expected: Vec::new(),
            duplicates: Vec::new(),
        }
    }

    /// Register a typed handler for `kind`.
    ///
    /// The request payload is decoded into `P` and the handler's `R` is
    /// encoded into the response, both with the builder's codec.
    pub fn handler<P, R, F, Fut>(self, kind: impl Into<String>, func: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let func = Arc::new(func);
        let handler: Handler = Arc::new(move |payload: Bytes| -> HandlerFuture {
            let codec = codec.clone();
            let func = func.clone();
            Box::pin(async move {
                let request: P = codec.decode(&payload)?;
                let response = func(request).await?;
                Ok(Bytes::from(codec.encode(&response)?))
            })
        });
        self.register(kind.into(), handler)
    }

    /// Register a handler working on encoded payloads.
    pub fn raw_handler<F, Fut>(self, kind: impl Into<String>, func: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload: Bytes| -> HandlerFuture {
            Box::pin(func(payload))
        });
        self.register(kind.into(), handler)
    }

    /// Declare kinds that must all have a handler before the receiver starts.
    pub fn expect_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub(crate) fn register(mut self, kind: String, handler: Handler) -> Self {
        if self.handlers.contains_key(&kind) {
            self.duplicates.push(kind);
        } else {
            self.handlers.insert(kind, handler);
        }
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Validate the registrations and spawn the receiver loop.
    pub fn start(self) -> Result<ReceiverHandle> {
        if let Some(kind) = self.duplicates.into_iter().next() {
            return Err(RpcError::DuplicateHandler(kind));
        }

        let missing: Vec<String> = self
            .expected
            .into_iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect();
        if !missing.is_empty() {
            return Err(RpcError::UnhandledKinds(missing));
        }

        let writer = Arc::new(tokio::sync::Mutex::new(self.writer));
        let handle = tokio::spawn(read_loop(self.reader, writer, self.handlers));

        Ok(ReceiverHandle { handle })
    }
}

async fn read_loop(
    mut reader: BoxedReader,
    writer: SharedWriter,
    handlers: HashMap<String, Handler>,
) -> Result<()> {
    tracing::debug!(handlers = handlers.len(), "receiver started");

    loop {
        let request = match RequestEnvelope::read_from(&mut reader).await {
            Ok(request) => request,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("receiver stream reached end of stream");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, "receiver reader failed");
                return Err(e.into());
            }
        };

        let request_id = request.request_id;
        let Some(handler) = handlers.get(&request.kind).cloned() else {
            tracing::error!(request_id, kind = %request.kind, "request for unknown kind");
            let response = ResponseEnvelope::failure(
                request_id,
                &format!("no handler for kind {}", request.kind),
            );
            if let Err(e) = write_response(&writer, &response).await {
                tracing::debug!(request_id, error = %e, "failure response write failed");
            }
            tokio::spawn(refuse_remaining(reader, writer));
            return Err(RpcError::UnknownKind(request.kind));
        };

        let writer = writer.clone();
        let kind = request.kind;
        let payload = request.payload;
        // Handlers run on their own task so a slow one never stalls the loop.
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move { handler(payload).await })
                .catch_unwind()
                .await;

            let response = match outcome {
                Ok(Ok(body)) if body.len() >= MAX_FIELD_SIZE => {
                    tracing::warn!(request_id, kind = %kind, size = body.len(), "response too large");
                    let err = RpcError::FieldTooLarge {
                        size: body.len() + 1,
                        max: MAX_FIELD_SIZE,
                    };
                    ResponseEnvelope::failure(request_id, &err.to_string())
                }
                Ok(Ok(body)) => ResponseEnvelope::success(request_id, &body),
                Ok(Err(e)) => {
                    tracing::debug!(request_id, kind = %kind, error = %e, "handler failed");
                    ResponseEnvelope::failure(request_id, &failure_message(e))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(request_id, kind = %kind, %message, "handler panicked");
                    ResponseEnvelope::failure(request_id, &message)
                }
            };

            if let Err(e) = write_response(&writer, &response).await {
                tracing::warn!(request_id, error = %e, "response write failed");
            }
        });
    }
}

/// Answer every further request with a failure so no caller waits forever.
async fn refuse_remaining(mut reader: BoxedReader, writer: SharedWriter) {
    while let Ok(request) = RequestEnvelope::read_from(&mut reader).await {
        tracing::debug!(request_id = request.request_id, kind = %request.kind, "refusing request");
        let response = ResponseEnvelope::failure(
            request.request_id,
            &format!("receiver stopped, {} not handled", request.kind),
        );
        if write_response(&writer, &response).await.is_err() {
            break;
        }
    }
}

async fn write_response(writer: &SharedWriter, response: &ResponseEnvelope) -> std::io::Result<()> {
    let bytes = response.encode();
    let mut writer = writer.lock().await;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

fn failure_message(err: RpcError) -> String {
    match err {
        RpcError::Remote(message) => message,
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic in handler: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic in handler: {s}")
    } else {
        "panic in handler".to_string()
    }
}

/// Handle to a running receiver loop.
pub struct ReceiverHandle {
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl ReceiverHandle {
    /// Wait for the loop to end: `Ok` at end of stream, `Err` on a read
    /// failure or an unknown kind.
    pub async fn join(self) -> Result<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(RpcError::InvalidMessage(format!("receiver task failed: {}", e))),
        }
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl std::fmt::Debug for ReceiverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverHandle")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
