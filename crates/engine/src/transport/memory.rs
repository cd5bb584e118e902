//! In-process relay: endpoints live in a shared map and sessions are `tokio::io::duplex` pairs.
//! Lets local and remote forwards of one process reach each other without a relay service.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::{
    io::{duplex, DuplexStream},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use url::Url;

use super::{RelayListener, RelayListenerEvent, RelayTransport};
use crate::{error::TransportError, rule::RelayEndpoint};

const DEFAULT_STREAM_BUFFER: usize = 64 * 1024;

struct Endpoint {
    listener_id: u64,
    online: bool,
    tx: UnboundedSender<RelayListenerEvent<DuplexStream>>,
}

#[derive(Default)]
struct State {
    endpoints: HashMap<Url, Endpoint>,
    denied: HashSet<String>,
    crashed: HashSet<String>,
}

#[derive(Clone)]
pub struct MemoryRelay {
    state: Arc<Mutex<State>>,
    stream_buffer: usize,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

fn relay_name(uri: &Url) -> &str {
    uri.path().trim_start_matches('/')
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            state: Default::default(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer.max(1);
        self
    }

    /// Rejects connects and listens on `relay_name` with a security error.
    pub fn deny(&self, relay_name: &str) {
        self.state.lock().denied.insert(relay_name.to_string());
    }

    pub fn allow(&self, relay_name: &str) {
        let mut state = self.state.lock();
        state.denied.remove(relay_name);
        state.crashed.remove(relay_name);
    }

    /// Fails connects and listens on `relay_name` with a fatal transport error.
    pub fn crash(&self, relay_name: &str) {
        self.state.lock().crashed.insert(relay_name.to_string());
    }

    /// Simulates loss and recovery of the listener's control channel. While offline, connects to
    /// the endpoint are unreachable.
    pub fn set_online(&self, uri: &Url, online: bool) -> bool {
        let mut state = self.state.lock();
        let Some(endpoint) = state.endpoints.get_mut(uri) else {
            return false;
        };
        if endpoint.online == online {
            return true;
        }
        endpoint.online = online;
        let event = if online {
            RelayListenerEvent::Online
        } else {
            RelayListenerEvent::Offline("relay control channel lost".to_string())
        };
        endpoint.tx.send(event).is_ok()
    }

    /// Ends the listener on `uri`: it observes `End` and the endpoint becomes free.
    pub fn end_listener(&self, uri: &Url) -> bool {
        match self.state.lock().endpoints.remove(uri) {
            Some(endpoint) => endpoint.tx.send(RelayListenerEvent::End).is_ok(),
            None => false,
        }
    }

    pub fn is_listening(&self, uri: &Url) -> bool {
        self.state.lock().endpoints.get(uri).map(|e| !e.tx.is_closed()).unwrap_or(false)
    }

    fn check_allowed(state: &State, uri: &Url) -> Result<(), TransportError> {
        if state.denied.contains(relay_name(uri)) {
            return Err(TransportError::Security(format!("access to {uri} denied")));
        }
        if state.crashed.contains(relay_name(uri)) {
            return Err(TransportError::Fatal(format!("transport for {uri} crashed")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RelayTransport for MemoryRelay {
    type Stream = DuplexStream;
    type Listener = MemoryListener;

    async fn connect(&self, endpoint: &RelayEndpoint) -> Result<Self::Stream, TransportError> {
        let state = self.state.lock();
        Self::check_allowed(&state, &endpoint.uri)?;
        let target = state.endpoints.get(&endpoint.uri).filter(|e| e.online).ok_or_else(|| TransportError::Unreachable(format!("no listener on {}", endpoint.uri)))?;

        let (near, far) = duplex(self.stream_buffer);
        target
            .tx
            .send(RelayListenerEvent::Incoming(far))
            .map_err(|_| TransportError::Unreachable(format!("listener on {} is gone", endpoint.uri)))?;
        log::debug!("[MemoryRelay] connected to {}", endpoint.uri);
        Ok(near)
    }

    async fn listen(&self, endpoint: &RelayEndpoint) -> Result<Self::Listener, TransportError> {
        let mut state = self.state.lock();
        Self::check_allowed(&state, &endpoint.uri)?;
        if state.endpoints.get(&endpoint.uri).map(|e| !e.tx.is_closed()).unwrap_or(false) {
            return Err(TransportError::Unreachable(format!("{} already has a listener", endpoint.uri)));
        }

        let (tx, rx) = unbounded_channel();
        let listener_id = rand::random();
        state.endpoints.insert(endpoint.uri.clone(), Endpoint { listener_id, online: true, tx });
        log::debug!("[MemoryRelay] listening on {}", endpoint.uri);
        Ok(MemoryListener {
            uri: endpoint.uri.clone(),
            listener_id,
            rx,
            state: self.state.clone(),
        })
    }
}

pub struct MemoryListener {
    uri: Url,
    listener_id: u64,
    rx: UnboundedReceiver<RelayListenerEvent<DuplexStream>>,
    state: Arc<Mutex<State>>,
}

impl MemoryListener {
    fn unregister(&self) {
        let mut state = self.state.lock();
        if state.endpoints.get(&self.uri).map(|e| e.listener_id == self.listener_id).unwrap_or(false) {
            state.endpoints.remove(&self.uri);
        }
    }
}

#[async_trait::async_trait]
impl RelayListener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&mut self) -> Result<RelayListenerEvent<Self::Stream>, TransportError> {
        Ok(self.rx.recv().await.unwrap_or(RelayListenerEvent::End))
    }

    async fn close(&mut self) {
        self.unregister();
        self.rx.close();
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.unregister();
    }
}
