//! Remote invocation of whole interfaces.
//!
//! An interface declared with [`remote_interface!`](crate::remote_interface)
//! can be called through a [`Proxy`] on one side of a stream and served from
//! a real implementation on the other. Each method maps to its own request
//! kind, the method signature key: the wire name followed by the parameter
//! types, e.g. `echo(String;Vec<String>;)`. Arguments are encoded one by one
//! with the codec and decoded against the serving method's parameter types.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{Codec, JsonCodec};
use crate::error::{Result, RpcError};
use crate::rpc::{Handler, HandlerFuture, ReceiverBuilder, ReceiverHandle, Sender};

mod macros;

/// Request body of one method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Method signature key, equal to the request kind
    pub method: String,
    /// Arguments, each encoded separately, in declaration order
    pub args: Vec<Vec<u8>>,
}

/// Build the signature key for a method from its wire name and parameter
/// type names.
pub fn method_key(name: &str, param_types: &[&str]) -> String {
    let mut key = String::with_capacity(name.len() + 2 + param_types.len() * 8);
    key.push_str(name);
    key.push('(');
    for ty in param_types {
        key.extend(ty.chars().filter(|c| !c.is_whitespace()));
        key.push(';');
    }
    key.push(')');
    key
}

/// Interfaces that can be served remotely.
///
/// Implemented for `dyn Trait` by [`remote_interface!`](crate::remote_interface).
pub trait RemoteInterface: Send + Sync + 'static {
    /// One handler per method of `target`, keyed by method signature key.
    fn dispatch_table<C>(target: Arc<Self>, codec: C) -> DispatchTable
    where
        C: Codec + Clone + 'static;
}

/// Method signature keys and their handlers for one served object.
#[derive(Default)]
pub struct DispatchTable {
    entries: Vec<(String, Handler)>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method. `func` receives the decoded call's arguments and
    /// produces the return value that is sent back.
    pub fn insert<C, F, Fut, R>(&mut self, codec: C, name: &str, param_types: &[&str], func: F)
    where
        C: Codec + Clone + 'static,
        F: Fn(Arguments<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let key = method_key(name, param_types);
        let func = Arc::new(func);
        let expected = key.clone();
        let handler: Handler = Arc::new(move |payload: Bytes| -> HandlerFuture {
            let codec = codec.clone();
            let func = func.clone();
            let expected = expected.clone();
            Box::pin(async move {
                let invocation: Invocation = codec.decode(&payload)?;
                if invocation.method != expected {
                    return Err(RpcError::InvalidMessage(format!(
                        "invocation of {} sent as {}",
                        invocation.method, expected
                    )));
                }
                let args = Arguments::new(codec.clone(), invocation.method, invocation.args);
                let result = func(args).await?;
                Ok(Bytes::from(codec.encode(&result)?))
            })
        });
        self.entries.push((key, handler));
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register every method on a receiver builder.
    pub fn register_on<C>(self, mut builder: ReceiverBuilder<C>) -> ReceiverBuilder<C>
    where
        C: Codec + Clone + 'static,
    {
        for (key, handler) in self.entries {
            builder = builder.register(key, handler);
        }
        builder
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

/// Positional arguments of one invocation, decoded on demand.
pub struct Arguments<C> {
    codec: C,
    method: String,
    args: std::vec::IntoIter<Vec<u8>>,
    position: usize,
}

impl<C: Codec> Arguments<C> {
    fn new(codec: C, method: String, args: Vec<Vec<u8>>) -> Self {
        Self {
            codec,
            method,
            args: args.into_iter(),
            position: 0,
        }
    }

    /// Decode the next argument as `T`.
    pub fn decode_next<T: DeserializeOwned>(&mut self) -> Result<T> {
        let position = self.position;
        self.position += 1;
        let Some(raw) = self.args.next() else {
            return Err(RpcError::InvalidMessage(format!(
                "{}: missing argument {}",
                self.method, position
            )));
        };
        self.codec.decode(&raw)
    }

    /// Fail if arguments are left over.
    pub fn finish(&mut self) -> Result<()> {
        let extra = self.args.len();
        if extra > 0 {
            return Err(RpcError::InvalidMessage(format!(
                "{}: {} unexpected extra arguments",
                self.method, extra
            )));
        }
        Ok(())
    }
}

/// Client side of a remote interface.
///
/// `Proxy<dyn Trait>` implements `Trait` for every interface declared with
/// [`remote_interface!`](crate::remote_interface); each call sends one request
/// and waits for its response.
pub struct Proxy<I: ?Sized, C: Codec = JsonCodec> {
    sender: Arc<Sender<C>>,
    _interface: PhantomData<fn() -> Box<I>>,
}

impl<I: ?Sized, C> Proxy<I, C>
where
    C: Codec + Clone + Unpin + 'static,
{
    pub fn from_sender(sender: Arc<Sender<C>>) -> Self {
        Self {
            sender,
            _interface: PhantomData,
        }
    }

    pub fn sender(&self) -> &Arc<Sender<C>> {
        &self.sender
    }

    #[doc(hidden)]
    pub fn encode_arg<T: Serialize + ?Sized>(&self, arg: &T) -> Result<Vec<u8>> {
        self.sender.codec().encode(arg)
    }

    #[doc(hidden)]
    pub async fn invoke<R: DeserializeOwned>(
        &self,
        name: &str,
        param_types: &[&str],
        args: Vec<Vec<u8>>,
    ) -> Result<R> {
        let method = method_key(name, param_types);
        tracing::trace!(method = %method, "remote invocation");
        let invocation = Invocation {
            method: method.clone(),
            args,
        };
        self.sender.call(&method, &invocation).await
    }
}

impl<I: ?Sized, C: Codec> Clone for Proxy<I, C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _interface: PhantomData,
        }
    }
}

impl<I: ?Sized, C: Codec> std::fmt::Debug for Proxy<I, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("interface", &std::any::type_name::<I>())
            .field("sender", &self.sender)
            .finish()
    }
}

/// Start a sender on the stream pair and return a proxy for interface `I`.
pub fn make_caller<I, R, W>(reader: R, writer: W) -> Proxy<I>
where
    I: ?Sized,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    Proxy::from_sender(Arc::new(Sender::new(reader, writer)))
}

pub fn make_caller_with_codec<I, R, W, C>(reader: R, writer: W, codec: C) -> Proxy<I, C>
where
    I: ?Sized,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    C: Codec + Clone + Unpin + 'static,
{
    Proxy::from_sender(Arc::new(Sender::with_codec(reader, writer, codec)))
}

/// Serve every method of `target` on the stream pair.
pub fn serve<I, R, W>(reader: R, writer: W, target: Arc<I>) -> Result<ReceiverHandle>
where
    I: RemoteInterface + ?Sized,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    serve_with_codec(reader, writer, target, JsonCodec)
}

pub fn serve_with_codec<I, R, W, C>(
    reader: R,
    writer: W,
    target: Arc<I>,
    codec: C,
) -> Result<ReceiverHandle>
where
    I: RemoteInterface + ?Sized,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    C: Codec + Clone + 'static,
{
    let table = I::dispatch_table(target, codec.clone());
    tracing::debug!(methods = table.len(), "serving remote interface");
    table
        .register_on(ReceiverBuilder::with_codec(reader, writer, codec))
        .start()
}
