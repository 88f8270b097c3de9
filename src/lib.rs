//! remux - channels, requests and remote interfaces over one byte stream
//!
//! Three layers, each usable on its own:
//!
//! - [`mux`]: many virtual duplex channels over a single connection
//! - [`rpc`]: kind-tagged requests with correlated, out-of-order responses
//! - [`invoke`]: whole interfaces called through a proxy and served remotely
//!
//! [`session`] ties them together to start named services on a peer.
pub mod codec;
pub mod error;
pub mod invoke;
pub mod mux;
pub mod rpc;
pub mod session;

pub use async_trait::async_trait;
pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use error::{Result, RpcError, TransportError, TransportResult};
pub use invoke::{make_caller, serve, Proxy, RemoteInterface};
pub use mux::{ChannelReader, ChannelWriter, Multiplexor, MultiplexorConfig, MultiplexorStats};
pub use rpc::{PendingResponse, ReceiverBuilder, ReceiverHandle, Sender};
pub use session::{Agent, AgentHandle, Session, SessionConfig};
