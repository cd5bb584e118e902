//! Boundary to the relay transport. The engine only needs to open a stream to a named relay
//! endpoint and to listen on one; framing, authentication and reconnects belong to the transport.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{error::TransportError, rule::RelayEndpoint};

pub mod memory;

/// Ordered, reliable, full-duplex byte stream carried by the relay.
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> RelayStream for T {}

#[derive(Debug)]
pub enum RelayListenerEvent<S> {
    /// A remote caller opened a session on the endpoint.
    Incoming(S),
    /// The control channel to the relay is (re)established.
    Online,
    /// The control channel was lost, the transport is reconnecting.
    Offline(String),
    /// The relay will deliver no more sessions.
    End,
}

#[async_trait::async_trait]
pub trait RelayListener: Send + 'static {
    type Stream: RelayStream;

    async fn accept(&mut self) -> Result<RelayListenerEvent<Self::Stream>, TransportError>;
    async fn close(&mut self);
}

#[async_trait::async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    type Stream: RelayStream;
    type Listener: RelayListener<Stream = Self::Stream>;

    async fn connect(&self, endpoint: &RelayEndpoint) -> Result<Self::Stream, TransportError>;
    async fn listen(&self, endpoint: &RelayEndpoint) -> Result<Self::Listener, TransportError>;
}
