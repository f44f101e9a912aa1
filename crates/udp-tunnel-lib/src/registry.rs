//! Registry of open proxies

use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};
use udp_tunnel_proto::{Endpoint, Protocol};
use udp_tunnel_server::{ProxyServer, ProxyState};

/// Serializable view of one open proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxySummary {
    pub listen_port: u16,
    pub listen_protocol: Protocol,
    pub target: Endpoint,
    pub target_protocol: Protocol,
    pub label: String,
    pub peers: usize,
    pub listening: bool,
}

impl From<&ProxyServer> for ProxySummary {
    fn from(proxy: &ProxyServer) -> Self {
        Self {
            listen_port: proxy.listen_port(),
            listen_protocol: proxy.listen_protocol(),
            target: proxy.target().clone(),
            target_protocol: proxy.target_protocol(),
            label: proxy.to_string(),
            peers: proxy.peer_count(),
            listening: proxy.state() == ProxyState::Listening,
        }
    }
}

/// The set of proxies a process keeps open
///
/// Removing a proxy from the registry closes it.
pub struct ProxyRegistry {
    proxies: Mutex<Vec<ProxyServer>>,
    count: watch::Sender<usize>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            proxies: Mutex::new(Vec::new()),
            count,
        }
    }

    pub fn insert(&self, proxy: ProxyServer) {
        info!("Registered proxy {}", proxy);
        let mut proxies = self.lock();
        proxies.push(proxy);
        self.count.send_replace(proxies.len());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn summaries(&self) -> Vec<ProxySummary> {
        self.lock().iter().map(ProxySummary::from).collect()
    }

    /// Close every proxy forwarding to `target`
    pub fn close_by_target(&self, target: &Endpoint) -> usize {
        self.close_matching(|proxy| proxy.target() == target)
    }

    /// Close every proxy forwarding to `port`, whatever the target host
    pub fn close_by_target_port(&self, port: u16) -> usize {
        self.close_matching(|proxy| proxy.target().port == port)
    }

    /// Close everything. Idempotent.
    pub fn close_all(&self) -> usize {
        self.close_matching(|_| true)
    }

    /// Close everything and wait for each listener to finish its teardown.
    pub async fn shutdown(&self) {
        let drained: Vec<ProxyServer> = {
            let mut proxies = self.lock();
            let drained = proxies.drain(..).collect();
            self.count.send_replace(0);
            drained
        };

        for proxy in &drained {
            proxy.close();
        }
        for proxy in &drained {
            if let Err(e) = proxy.closed().await {
                debug!("Proxy {} ended with error: {}", proxy, e);
            }
        }
    }

    /// Open proxy count, updated on every change
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    fn close_matching(&self, matches: impl Fn(&ProxyServer) -> bool) -> usize {
        let mut proxies = self.lock();
        let before = proxies.len();

        proxies.retain(|proxy| {
            if matches(proxy) {
                info!("Closing proxy {}", proxy);
                proxy.close();
                false
            } else {
                true
            }
        });

        let closed = before - proxies.len();
        if closed > 0 {
            self.count.send_replace(proxies.len());
        }
        closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProxyServer>> {
        self.proxies.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{start_tcp_fronted_proxy, start_udp_fronted_proxy};

    #[tokio::test]
    async fn test_insert_and_summaries() {
        let registry = ProxyRegistry::new();
        let mut count = registry.subscribe();
        assert!(registry.is_empty());

        let proxy = start_udp_fronted_proxy(0, 3000).await.unwrap();
        let port = proxy.listen_port();
        registry.insert(proxy);

        assert!(count.has_changed().unwrap());
        assert_eq!(*count.borrow_and_update(), 1);

        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].listen_port, port);
        assert_eq!(summaries[0].label, format!("{}/udp -> 3000/tcp", port));
        assert!(summaries[0].listening);
    }

    #[tokio::test]
    async fn test_close_by_target() {
        let registry = ProxyRegistry::new();
        registry.insert(start_tcp_fronted_proxy(Endpoint::localhost(5353)).await.unwrap());
        registry.insert(start_tcp_fronted_proxy(Endpoint::new("10.0.0.2", 5353)).await.unwrap());
        registry.insert(start_tcp_fronted_proxy(Endpoint::localhost(5354)).await.unwrap());

        assert_eq!(registry.close_by_target(&Endpoint::localhost(5353)), 1);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.close_by_target_port(5353), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.summaries()[0].target, Endpoint::localhost(5354));
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let registry = ProxyRegistry::new();
        registry.insert(start_udp_fronted_proxy(0, 3000).await.unwrap());
        registry.insert(start_tcp_fronted_proxy(Endpoint::localhost(3000)).await.unwrap());

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.close_all(), 0);
        assert!(registry.is_empty());
        assert_eq!(*registry.subscribe().borrow(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_teardown() {
        let registry = ProxyRegistry::new();
        let proxy = start_udp_fronted_proxy(0, 3000).await.unwrap();
        let port = proxy.listen_port();
        registry.insert(proxy);

        registry.shutdown().await;
        assert!(registry.is_empty());

        // The port is free again once teardown finished
        let rebound = tokio::net::UdpSocket::bind(("127.0.0.1", port)).await;
        assert!(rebound.is_ok());
    }

    #[test]
    fn test_summary_serializes() {
        let summary = ProxySummary {
            listen_port: 5000,
            listen_protocol: Protocol::Udp,
            target: Endpoint::localhost(3000),
            target_protocol: Protocol::Tcp,
            label: "5000/udp -> 3000/tcp".to_string(),
            peers: 0,
            listening: true,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["listen_protocol"], "udp");
        assert_eq!(json["target"]["port"], 3000);
        assert_eq!(json["label"], "5000/udp -> 3000/tcp");
    }
}
