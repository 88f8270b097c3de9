//! Starting services on the far side of a multiplexed connection.
//!
//! Both ends wrap the connection in a [`Multiplexor`]. The [`Agent`] end
//! serves a request/response loop on the control channel; the [`Session`]
//! end asks it to run a named service on a fresh channel and then talks to
//! that service over the channel's streams.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::JsonCodec;
use crate::error::{Result, RpcError};
use crate::invoke::{self, Proxy, RemoteInterface};
use crate::mux::{ChannelReader, ChannelWriter, Multiplexor, MultiplexorConfig};
use crate::rpc::{ReceiverBuilder, ReceiverHandle, Sender};

/// Request kind sent on the control channel to start a service.
pub const RUN_SERVICE: &str = "RUN_SERVICE";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Channel carrying service start requests
    pub control_channel: u32,
    /// First channel id handed out to services
    pub first_service_channel: u32,
    pub mux: MultiplexorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            control_channel: 0,
            first_service_channel: 1,
            mux: MultiplexorConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_control_channel(mut self, channel: u32) -> Self {
        self.control_channel = channel;
        self
    }

    pub fn with_first_service_channel(mut self, channel: u32) -> Self {
        self.first_service_channel = channel;
        self
    }

    pub fn with_mux_config(mut self, mux: MultiplexorConfig) -> Self {
        self.mux = mux;
        self
    }
}

/// Body of a [`RUN_SERVICE`] request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunService {
    pub service: String,
    pub channel: u32,
}

/// Calling end: opens services hosted by the peer's [`Agent`].
pub struct Session {
    mux: Multiplexor,
    control: Sender,
    next_channel: AtomicU32,
    config: SessionConfig,
}

impl Session {
    /// Wrap `connection` and start the control channel sender. Must be called
    /// within a tokio runtime.
    pub fn connect<S>(connection: S, config: SessionConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mux = Multiplexor::with_config(connection, config.mux.clone());
        let (reader, writer) = mux.claim_channel(config.control_channel)?;
        let control = Sender::new(reader, writer);

        Ok(Self {
            mux,
            control,
            next_channel: AtomicU32::new(config.first_service_channel),
            config,
        })
    }

    /// Start service `name` on the peer and return the streams of the
    /// channel it runs on.
    pub async fn open_service(&self, name: &str) -> Result<(ChannelReader, ChannelWriter)> {
        let channel = self.allocate_channel();
        // Claimed before asking so nothing the service writes is dropped.
        let streams = self.mux.claim_channel(channel)?;

        let request = RunService {
            service: name.to_string(),
            channel,
        };
        self.control.call::<_, ()>(RUN_SERVICE, &request).await?;

        tracing::debug!(service = name, channel, "service opened");
        Ok(streams)
    }

    /// Open service `name` and call it through interface `I`.
    pub async fn open_interface<I: ?Sized>(&self, name: &str) -> Result<Proxy<I>> {
        let (reader, writer) = self.open_service(name).await?;
        Ok(invoke::make_caller(reader, writer))
    }

    fn allocate_channel(&self) -> u32 {
        let mut channel = self.next_channel.fetch_add(1, Ordering::Relaxed);
        if channel == self.config.control_channel {
            channel = self.next_channel.fetch_add(1, Ordering::Relaxed);
        }
        channel
    }

    pub fn multiplexor(&self) -> &Multiplexor {
        &self.mux
    }

    pub fn close(&self) {
        self.control.shutdown();
        self.mux.shutdown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mux", &self.mux)
            .field("next_channel", &self.next_channel.load(Ordering::Relaxed))
            .finish()
    }
}

type Service = Arc<dyn Fn(ChannelReader, ChannelWriter) -> BoxFuture<'static, ()> + Send + Sync>;

/// Hosting end: runs named services on request.
pub struct Agent {
    mux: Multiplexor,
    config: SessionConfig,
    services: HashMap<String, Service>,
}

impl Agent {
    /// Wrap `connection`. Must be called within a tokio runtime.
    pub fn new<S>(connection: S, config: SessionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mux = Multiplexor::with_config(connection, config.mux.clone());
        Self {
            mux,
            config,
            services: HashMap::new(),
        }
    }

    /// Register a service. Each start request runs `func` on its own task
    /// with the streams of the requested channel.
    pub fn service<F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ChannelReader, ChannelWriter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let service: Service = Arc::new(
            move |reader: ChannelReader, writer: ChannelWriter| -> BoxFuture<'static, ()> {
                Box::pin(func(reader, writer))
            },
        );
        self.services.insert(name.into(), service);
        self
    }

    /// Register a service that serves `target` through its remote interface.
    pub fn interface<I>(self, name: impl Into<String>, target: Arc<I>) -> Self
    where
        I: RemoteInterface + ?Sized,
    {
        let name = name.into();
        let service_name = name.clone();
        self.service(name, move |reader, writer| {
            let target = target.clone();
            let service_name = service_name.clone();
            async move {
                match invoke::serve(reader, writer, target) {
                    Ok(handle) => {
                        if let Err(e) = handle.join().await {
                            tracing::warn!(service = %service_name, error = %e, "service ended with error");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(service = %service_name, error = %e, "service failed to start");
                    }
                }
            }
        })
    }

    /// Start answering [`RUN_SERVICE`] requests on the control channel.
    pub fn start(self) -> Result<AgentHandle> {
        let (reader, writer) = self.mux.claim_channel(self.config.control_channel)?;
        let services = Arc::new(self.services);
        let mux = self.mux.clone();

        tracing::debug!(services = services.len(), "agent started");

        let receiver = ReceiverBuilder::with_codec(reader, writer, JsonCodec)
            .handler(RUN_SERVICE, move |request: RunService| {
                let services = services.clone();
                let mux = mux.clone();
                async move {
                    let Some(service) = services.get(&request.service).cloned() else {
                        tracing::warn!(service = %request.service, "unknown service requested");
                        return Err(RpcError::ServiceNotFound(request.service));
                    };
                    let (reader, writer) = mux.claim_channel(request.channel)?;
                    tracing::debug!(service = %request.service, channel = request.channel, "running service");
                    tokio::spawn(service(reader, writer));
                    Ok(())
                }
            })
            .start()?;

        Ok(AgentHandle {
            mux: self.mux,
            receiver,
        })
    }
}

/// Handle to a running [`Agent`].
#[derive(Debug)]
pub struct AgentHandle {
    mux: Multiplexor,
    receiver: ReceiverHandle,
}

impl AgentHandle {
    pub fn multiplexor(&self) -> &Multiplexor {
        &self.mux
    }

    /// Wait until the control channel ends.
    pub async fn join(self) -> Result<()> {
        self.receiver.join().await
    }

    pub async fn shutdown(self) {
        self.receiver.shutdown().await;
        self.mux.shutdown();
    }
}
