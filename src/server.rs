//! linkfront/src/server.rs
//! The listening front-end: accept loop, worker admission, health prober.

use crate::balancer::Balancer;
use crate::connection;
use crate::link::ProbeTarget;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, lookup_host};
use tokio::sync::{Notify, Semaphore, futures::Notified};
use tracing::{error, info};

/// Interval between two health sweeps of the link fleet.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);

const LISTEN_BACKLOG: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

fn default_domain() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1080
}

fn default_timeout() -> u64 {
    5
}

fn default_max_workers() -> u32 {
    200
}

/// The SOCKS5 front-end. Owns the balancer and the shared session state:
/// the stop flag, the monotonic connection counter, and the probe target.
#[derive(Serialize, Deserialize, Debug)]
pub struct Server {
    pub balancer: Balancer,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accept timeout in seconds; bounds how long shutdown waits on an
    /// idle acceptor.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    #[serde(default)]
    pub probe: ProbeTarget,
    #[serde(skip)]
    stop: AtomicBool,
    #[serde(skip)]
    stop_notify: Notify,
    #[serde(skip)]
    connection_counter: AtomicU64,
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Server:{}:{}", self.domain, self.port)
    }
}

impl Server {
    pub fn new(balancer: Balancer) -> Self {
        Server {
            balancer,
            domain: default_domain(),
            port: default_port(),
            timeout: default_timeout(),
            max_workers: default_max_workers(),
            probe: ProbeTarget::default(),
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Requests cooperative shutdown: the acceptor exits within the accept
    /// timeout, the prober within one probe interval, relays within their
    /// idle timeout.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Completes once `stop` is called, provided the caller also checks
    /// `is_stopped` before waiting.
    pub(crate) fn stopped(&self) -> Notified<'_> {
        self.stop_notify.notified()
    }

    /// Hands out a fresh id for an upstream connection. Never repeats, so
    /// two sessions can never collide inside a link's registry.
    pub(crate) fn next_connection_id(&self) -> String {
        self.connection_counter.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Creates the listening socket: address reuse on, configured backlog.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let bind_error = |source: io::Error| ServerError::Bind {
            addr: format!("{}:{}", self.domain, self.port),
            source,
        };

        let addr = match lookup_host((self.domain.as_str(), self.port)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    let err = io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no address resolved for {}", self.domain),
                    );
                    error!(server = %self, "Cannot bind {}:{}, error: \"{err}\".", self.domain, self.port);
                    return Err(bind_error(err));
                }
            },
            Err(err) => {
                error!(server = %self, "Cannot bind {}:{}, error: \"{err}\".", self.domain, self.port);
                return Err(bind_error(err));
            }
        };

        let created = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        };
        let socket = match created.and_then(|socket| socket.set_reuseaddr(true).map(|_| socket)) {
            Ok(socket) => socket,
            Err(err) => {
                error!(server = %self, "Failed to create the socket server, error: \"{err}\".");
                return Err(bind_error(err));
            }
        };

        if let Err(err) = socket.bind(addr) {
            error!(server = %self, "Cannot bind {}:{}, error: \"{err}\".", self.domain, self.port);
            return Err(bind_error(err));
        }
        match socket.listen(LISTEN_BACKLOG) {
            Ok(listener) => {
                info!(server = %self, "Bind {}.", self.port);
                Ok(listener)
            }
            Err(err) => {
                error!(server = %self, "Listen failed, error: \"{err}\".");
                Err(bind_error(err))
            }
        }
    }

    /// Binds and serves until `stop` is observed.
    pub async fn serve(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve_with(listener).await;
        Ok(())
    }

    /// Serves on an already-bound listener. Spawns the health prober and
    /// one task per admitted client; admission is bounded by a semaphore
    /// holding `max_workers` permits.
    pub async fn serve_with(self: Arc<Self>, listener: TcpListener) {
        self.stop.store(false, Ordering::SeqCst);
        let prober = tokio::spawn(Arc::clone(&self).probe_loop());
        let workers = Arc::new(Semaphore::new(self.max_workers as usize));

        info!(server = %self, "Ready to receive requests.");
        while !self.is_stopped() {
            let permit = tokio::select! {
                permit = Arc::clone(&workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.stopped() => break,
            };

            match tokio::time::timeout(self.accept_timeout(), listener.accept()).await {
                // accept timed out; loop around and re-check the stop flag
                Err(_) => continue,
                Ok(Err(err)) => {
                    error!(server = %self, "Error: \"{err}\".");
                    continue;
                }
                Ok(Ok((client, peer))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        connection::handle_client(server, client, peer).await;
                        drop(permit);
                    });
                }
            }
        }

        info!(server = %self, "Stopping server.");
        let _ = prober.await;
    }

    async fn probe_loop(self: Arc<Self>) {
        while !self.is_stopped() {
            self.balancer.refresh_all(&self.probe).await;
            tokio::select! {
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                _ = self.stopped() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use crate::strategy::Strategy;

    fn server() -> Server {
        Server::new(Balancer::new(Strategy::RoundRobin).add_link(Link::new()))
    }

    #[test]
    fn connection_ids_never_repeat() {
        let server = server();
        let a = server.next_connection_id();
        let b = server.next_connection_id();
        assert_ne!(a, b);
        assert_eq!(a, "0");
        assert_eq!(b, "1");
    }

    #[test]
    fn stop_flag_is_observable() {
        let server = server();
        assert!(!server.is_stopped());
        server.stop();
        assert!(server.is_stopped());
    }

    #[test]
    fn displays_its_bind_address() {
        assert_eq!(server().to_string(), "Server:0.0.0.0:1080");
    }
}
