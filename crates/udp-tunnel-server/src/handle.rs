//! Proxy server handle
//!
//! A [`ProxyServer`] is returned by a successful start. The listener itself
//! runs on a background task; the handle only signals it and observes it.

use crate::error::ProxyError;
use crate::pool::PeerPool;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use udp_tunnel_proto::{Endpoint, Protocol};

/// Lifecycle of a proxy instance after a successful bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyState {
    Listening,
    Closed,
    /// The listener stopped on its own; carries the reason
    Failed(String),
}

pub(crate) enum PeerCounter {
    Pool(Arc<PeerPool>),
    Connections(Arc<AtomicUsize>),
}

/// Handle to one active tunnel
///
/// Dropping the handle has the same effect as calling [`ProxyServer::close`].
pub struct ProxyServer {
    listen_port: u16,
    listen_protocol: Protocol,
    target: Endpoint,
    target_protocol: Protocol,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ProxyState>,
    peers: PeerCounter,
}

/// The server task's side of a [`ProxyServer`]
pub(crate) struct Lifecycle {
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<ProxyState>,
}

impl Lifecycle {
    /// Resolves once `close()` was called or the handle was dropped
    pub(crate) async fn shutdown_requested(&mut self) {
        let _ = self.shutdown.wait_for(|closed| *closed).await;
    }

    pub(crate) fn finish(self, result: Result<(), String>) {
        let state = match result {
            Ok(()) => ProxyState::Closed,
            Err(reason) => ProxyState::Failed(reason),
        };
        self.state.send_replace(state);
    }
}

impl ProxyServer {
    pub(crate) fn new(
        listen_port: u16,
        listen_protocol: Protocol,
        target: Endpoint,
        target_protocol: Protocol,
        peers: PeerCounter,
    ) -> (Self, Lifecycle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ProxyState::Listening);

        let server = Self {
            listen_port,
            listen_protocol,
            target,
            target_protocol,
            shutdown: shutdown_tx,
            state: state_rx,
            peers,
        };
        let lifecycle = Lifecycle {
            shutdown: shutdown_rx,
            state: state_tx,
        };

        (server, lifecycle)
    }

    /// Port actually bound, which may differ from the one requested
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn listen_protocol(&self) -> Protocol {
        self.listen_protocol
    }

    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    pub fn target_protocol(&self) -> Protocol {
        self.target_protocol
    }

    pub fn state(&self) -> ProxyState {
        self.state.borrow().clone()
    }

    /// Pooled peers (UDP listener) or bridged connections (TCP listener)
    pub fn peer_count(&self) -> usize {
        match &self.peers {
            PeerCounter::Pool(pool) => pool.len(),
            PeerCounter::Connections(count) => count.load(Ordering::Relaxed),
        }
    }

    /// Start tearing the proxy down. Safe to call any number of times.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until the listener has stopped and its resources are released.
    pub async fn closed(&self) -> Result<(), ProxyError> {
        let mut state = self.state.clone();
        let finished = state
            .wait_for(|s| *s != ProxyState::Listening)
            .await
            .map(|s| s.clone());

        match finished {
            Ok(ProxyState::Failed(reason)) => Err(ProxyError::ServerClosedUnexpectedly(reason)),
            Ok(_) => Ok(()),
            Err(_) => Err(ProxyError::ServerClosedUnexpectedly(
                "server task ended without reporting".to_string(),
            )),
        }
    }
}

impl fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> {}/{}",
            self.listen_port,
            self.listen_protocol,
            self.target.label(),
            self.target_protocol
        )
    }
}

impl fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyServer")
            .field("listen_port", &self.listen_port)
            .field("listen_protocol", &self.listen_protocol)
            .field("target", &self.target)
            .field("target_protocol", &self.target_protocol)
            .field("state", &*self.state.borrow())
            .finish()
    }
}
