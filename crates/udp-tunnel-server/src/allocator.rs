//! Listen-port allocation
//!
//! Starting a proxy on a taken port walks upwards from the requested port
//! until a bind succeeds. Only "address in use" failures are retried.

use crate::error::ProxyError;
use std::future::Future;
use tracing::{info, warn};

/// Run `start` on `desired`, then `desired + 1`, and so on for up to `attempts` ports.
///
/// Any failure other than address-in-use is returned immediately. When every
/// attempt is exhausted the error from the last attempt is returned. A desired
/// port of 0 asks the OS for a free port and is never retried.
pub async fn allocate_listen_port<F, Fut, T>(
    desired: u16,
    attempts: u16,
    mut start: F,
) -> Result<T, ProxyError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = Result<T, ProxyError>>,
{
    let attempts = if desired == 0 { 1 } else { attempts.max(1) };
    let mut port = desired;
    let mut tried = 0u16;

    loop {
        tried += 1;
        match start(port).await {
            Ok(started) => {
                if port != desired {
                    info!("Port {} was busy, listening on {} instead", desired, port);
                }
                return Ok(started);
            }
            Err(e) if e.is_addr_in_use() && tried < attempts => match port.checked_add(1) {
                Some(next) => {
                    warn!("Port {} is in use, trying {}", port, next);
                    port = next;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    fn in_use(port: u16) -> ProxyError {
        ProxyError::bind(
            SocketAddr::from(([127, 0, 0, 1], port)),
            io::Error::from(io::ErrorKind::AddrInUse),
        )
    }

    fn recorder() -> Arc<Mutex<Vec<u16>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_first_port_free() {
        let tried = recorder();
        let seen = tried.clone();
        let port = allocate_listen_port(5000, 20, |port| {
            seen.lock().unwrap().push(port);
            async move { Ok::<_, ProxyError>(port) }
        })
        .await
        .unwrap();

        assert_eq!(port, 5000);
        assert_eq!(*tried.lock().unwrap(), vec![5000]);
    }

    #[tokio::test]
    async fn test_skips_busy_ports() {
        let port = allocate_listen_port(5000, 20, |port| async move {
            if port < 5003 {
                Err(in_use(port))
            } else {
                Ok(port)
            }
        })
        .await
        .unwrap();

        assert_eq!(port, 5003);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let tried = recorder();
        let seen = tried.clone();
        let err = allocate_listen_port(5000, 20, |port| {
            seen.lock().unwrap().push(port);
            async move { Err::<u16, _>(in_use(port)) }
        })
        .await
        .unwrap_err();

        let tried = tried.lock().unwrap();
        assert_eq!(tried.len(), 20);
        assert_eq!(tried.last(), Some(&5019));
        assert!(err.is_addr_in_use());
        assert!(err.to_string().contains("5019"));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let tried = recorder();
        let seen = tried.clone();
        let err = allocate_listen_port(80, 20, |port| {
            seen.lock().unwrap().push(port);
            async move {
                Err::<u16, _>(ProxyError::bind(
                    SocketAddr::from(([127, 0, 0, 1], port)),
                    io::Error::from(io::ErrorKind::PermissionDenied),
                ))
            }
        })
        .await
        .unwrap_err();

        assert!(!err.is_addr_in_use());
        assert_eq!(*tried.lock().unwrap(), vec![80]);
    }

    #[tokio::test]
    async fn test_stops_at_highest_port() {
        let tried = recorder();
        let seen = tried.clone();
        let result = allocate_listen_port(65534, 20, |port| {
            seen.lock().unwrap().push(port);
            async move { Err::<u16, _>(in_use(port)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*tried.lock().unwrap(), vec![65534, 65535]);
    }

    #[tokio::test]
    async fn test_ephemeral_port_single_attempt() {
        let tried = recorder();
        let seen = tried.clone();
        let result = allocate_listen_port(0, 20, |port| {
            seen.lock().unwrap().push(port);
            async move { Err::<u16, _>(in_use(port)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*tried.lock().unwrap(), vec![0]);
    }
}
