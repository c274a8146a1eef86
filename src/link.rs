//! linkfront/src/link.rs
//! Upstream egress endpoints: direct interfaces or chained proxies.

use crate::matcher::{Policy, RequestMatcher};
use crate::request::Request;
use async_http_proxy::http_connect_tokio;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::time::Instant;
use tokio_socks::tcp::{Socks5Stream, socks4::Socks4Stream};
use tracing::warn;

/// Unified stream type for the four upstream protocols.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// How a link carries traffic out: straight to the destination, or chained
/// through an upstream proxy speaking its native protocol.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Direct,
    Socks5,
    Socks4,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Direct => "direct",
            Protocol::Socks5 => "socks5",
            Protocol::Socks4 => "socks4",
            Protocol::Http => "http",
        })
    }
}

/// Per-link verdict for one request, derived from the link's matchers and
/// its live status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityLevel {
    Forbid,
    Low,
    Normal,
    High,
}

/// Endpoint the health probe connects to through the link.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    #[serde(default = "default_probe_domain")]
    pub domain: String,
    #[serde(default = "default_probe_port")]
    pub port: u16,
}

pub const DEFAULT_PROBE_DOMAIN: &str = "example.org";
pub const DEFAULT_PROBE_PORT: u16 = 80;

/// Reserved connection id used by the health probe. The prober runs one
/// probe at a time per link, so the id can never collide with itself.
pub const PROBE_CONNECTION_ID: &str = "__probe__";

fn default_probe_domain() -> String {
    DEFAULT_PROBE_DOMAIN.to_string()
}

fn default_probe_port() -> u16 {
    DEFAULT_PROBE_PORT
}

impl Default for ProbeTarget {
    fn default() -> Self {
        ProbeTarget {
            domain: default_probe_domain(),
            port: DEFAULT_PROBE_PORT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connection id '{0}' already in use for this link")]
    IdInUse(String),
}

fn default_timeout() -> u64 {
    10
}

fn default_weight() -> u32 {
    1
}

fn link_up() -> AtomicBool {
    AtomicBool::new(true)
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

/// An upstream egress endpoint. Owns the registry of its open connections,
/// its probed reachability and latency, and the matcher list used to
/// classify request priority.
///
/// `status` and `latency` are written by the prober and read by the
/// balancer; dispatch tolerates stale values.
#[derive(Serialize, Deserialize, Debug)]
pub struct Link {
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interface: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<RequestMatcher>,
    #[serde(skip)]
    connections: Mutex<HashSet<String>>,
    #[serde(skip, default = "link_up")]
    status: AtomicBool,
    #[serde(skip)]
    latency: AtomicU64,
}

impl Default for Link {
    fn default() -> Self {
        Link {
            timeout: default_timeout(),
            weight: default_weight(),
            interface: String::new(),
            protocol: Protocol::Direct,
            domain: String::new(),
            port: 0,
            matchers: Vec::new(),
            connections: Mutex::new(HashSet::new()),
            status: link_up(),
            latency: AtomicU64::new(0),
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link:")?;
        if !self.interface.is_empty() {
            write!(f, "{},", self.interface)?;
        }
        if self.protocol != Protocol::Direct {
            write!(f, "{},", self.protocol)?;
        }
        if !self.domain.is_empty() {
            write!(f, "{}:{},", self.domain, self.port)?;
        }
        write!(f, "{}", self.weight)
    }
}

impl Link {
    pub fn new() -> Self {
        Link::default()
    }

    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = interface.to_string();
        self
    }

    pub fn with_proxy(mut self, protocol: Protocol, domain: &str, port: u16) -> Self {
        self.protocol = protocol;
        self.domain = domain.to_string();
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_matcher(mut self, matcher: RequestMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn is_up(&self) -> bool {
        self.status.load(Ordering::SeqCst)
    }

    /// Latency of the last successful probe, in seconds.
    pub fn latency(&self) -> f64 {
        f64::from_bits(self.latency.load(Ordering::SeqCst))
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub(crate) fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Classifies one request against this link.
    ///
    /// A down link forbids everything. Matchers are walked in order: an
    /// `allow` matcher that does not match, or a `forbid` matcher that
    /// does, forbids the request outright. Otherwise matched `prioritize`
    /// and `deprioritize` matchers raise or lower the verdict; both at
    /// once (or neither) is normal.
    pub fn priority(&self, request: &Request) -> PriorityLevel {
        if !self.is_up() {
            return PriorityLevel::Forbid;
        }

        let mut prioritized = false;
        let mut deprioritized = false;
        for matcher in &self.matchers {
            let matching = matcher.matches(request);
            match matcher.policy {
                Policy::Allow if !matching => return PriorityLevel::Forbid,
                Policy::Forbid if matching => return PriorityLevel::Forbid,
                Policy::Prioritize if matching => prioritized = true,
                Policy::Deprioritize if matching => deprioritized = true,
                _ => {}
            }
        }

        match (prioritized, deprioritized) {
            (true, false) => PriorityLevel::High,
            (false, true) => PriorityLevel::Low,
            _ => PriorityLevel::Normal,
        }
    }

    /// Reserves a connection id on this link. The returned handle dials the
    /// destination; dropping it (or the connection it turns into) releases
    /// the id.
    pub fn open(&self, connection_id: impl Into<String>) -> Result<PendingConnection<'_>, LinkError> {
        let id = connection_id.into();
        if !self.connections.lock().unwrap().insert(id.clone()) {
            return Err(LinkError::IdInUse(id));
        }
        Ok(PendingConnection {
            link: self,
            id: Some(id),
        })
    }

    /// Releases a connection id. Unknown ids are silently ignored.
    pub fn close(&self, connection_id: &str) {
        self.connections.lock().unwrap().remove(connection_id);
    }

    async fn tcp_connect(&self, domain: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host((domain, port)).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            self.bind_interface(&socket)?;
            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address resolved for {domain}:{port}"),
            )
        }))
    }

    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    fn bind_interface(&self, socket: &TcpSocket) -> io::Result<()> {
        if self.interface.is_empty() {
            return Ok(());
        }
        socket.bind_device(Some(self.interface.as_bytes()))
    }

    #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
    fn bind_interface(&self, _socket: &TcpSocket) -> io::Result<()> {
        if self.interface.is_empty() {
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!(
                "binding to device '{}' is not supported on this platform",
                self.interface
            ),
        ))
    }

    /// Opens the transport for one destination: a plain TCP connection for
    /// direct links, otherwise a TCP connection to the configured proxy
    /// followed by that protocol's handshake. The whole dial is bounded by
    /// the link timeout.
    async fn dial(&self, domain: &str, port: u16) -> io::Result<Box<dyn AsyncStream>> {
        tokio::time::timeout(self.timeout_duration(), self.dial_inner(domain, port))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {domain}:{port} timed out"),
                )
            })?
    }

    async fn dial_inner(&self, domain: &str, port: u16) -> io::Result<Box<dyn AsyncStream>> {
        match self.protocol {
            Protocol::Direct => {
                let stream = self.tcp_connect(domain, port).await?;
                Ok(Box::new(stream))
            }
            Protocol::Socks5 => {
                let proxy = self.tcp_connect(&self.domain, self.port).await?;
                let stream = Socks5Stream::connect_with_socket(proxy, (domain, port))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Ok(Box::new(stream))
            }
            Protocol::Socks4 => {
                let proxy = self.tcp_connect(&self.domain, self.port).await?;
                let stream = Socks4Stream::connect_with_socket(proxy, (domain, port))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Ok(Box::new(stream))
            }
            Protocol::Http => {
                let mut proxy = self.tcp_connect(&self.domain, self.port).await?;
                http_connect_tokio(&mut proxy, domain, port)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Ok(Box::new(proxy))
            }
        }
    }

    /// Probes this link end-to-end and refreshes `status` and `latency`.
    pub async fn refresh(&self) {
        self.refresh_with(&ProbeTarget::default()).await;
    }

    pub async fn refresh_with(&self, probe: &ProbeTarget) {
        let started = Instant::now();
        let result = async {
            let pending = self
                .open(PROBE_CONNECTION_ID)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let mut connection = pending.connect(&probe.domain, probe.port).await?;
            tokio::time::timeout(self.timeout_duration(), async {
                connection
                    .stream
                    .write_all(
                        format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", probe.domain).as_bytes(),
                    )
                    .await?;
                let mut buf = [0u8; 1024];
                connection.stream.read(&mut buf).await?;
                Ok::<(), io::Error>(())
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "probe timed out"))?
        }
        .await;

        match result {
            Ok(()) => {
                let latency = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
                self.latency.store(latency.to_bits(), Ordering::SeqCst);
                self.status.store(true, Ordering::SeqCst);
            }
            Err(err) => {
                self.latency.store(0f64.to_bits(), Ordering::SeqCst);
                self.status.store(false, Ordering::SeqCst);
                warn!(
                    link = %self,
                    "Connection error with {}:{}: \"{err}\".",
                    probe.domain, probe.port
                );
            }
        }
    }
}

/// A reserved connection id that has not dialed yet.
pub struct PendingConnection<'a> {
    link: &'a Link,
    id: Option<String>,
}

impl<'a> PendingConnection<'a> {
    /// Dials the destination through the link. On failure the reserved id
    /// is released when the handle drops.
    pub async fn connect(mut self, domain: &str, port: u16) -> io::Result<LinkConnection<'a>> {
        let stream = self.link.dial(domain, port).await?;
        Ok(LinkConnection {
            link: self.link,
            id: self.id.take(),
            stream,
        })
    }
}

impl Drop for PendingConnection<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.link.close(&id);
        }
    }
}

/// An established upstream connection. Owns the socket; dropping it closes
/// the socket and releases the id from the link's registry.
pub struct LinkConnection<'a> {
    link: &'a Link,
    id: Option<String>,
    pub stream: Box<dyn AsyncStream>,
}

impl Drop for LinkConnection<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.link.close(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{Policy, RequestMatcher};

    fn forbid_com() -> RequestMatcher {
        RequestMatcher::new(Policy::Forbid)
            .with_domain_re(r"^.+\.com$")
            .unwrap()
    }

    fn allow_com() -> RequestMatcher {
        RequestMatcher::new(Policy::Allow)
            .with_domain_re(r"^.+\.com$")
            .unwrap()
    }

    #[test]
    fn forbids_request_when_domain_is_in_blacklist() {
        let link = Link::new().with_matcher(forbid_com());
        assert_eq!(link.priority(&Request::new("google.com", 80)), PriorityLevel::Forbid);
        assert_eq!(link.priority(&Request::new("google.fr", 80)), PriorityLevel::Normal);
    }

    #[test]
    fn forbids_request_when_domain_is_not_in_whitelist() {
        let link = Link::new().with_matcher(allow_com());
        assert_eq!(link.priority(&Request::new("google.fr", 80)), PriorityLevel::Forbid);
    }

    #[test]
    fn forbids_request_when_domain_in_whitelist_and_in_blacklist() {
        let link = Link::new().with_matcher(allow_com()).with_matcher(forbid_com());
        assert_eq!(link.priority(&Request::new("google.com", 80)), PriorityLevel::Forbid);
    }

    #[test]
    fn gives_normal_priority_when_no_matcher_is_given() {
        let link = Link::new();
        assert_eq!(link.priority(&Request::new("google.com", 80)), PriorityLevel::Normal);
    }

    #[test]
    fn gives_normal_priority_when_prioritized_and_deprioritized_at_the_same_time() {
        let link = Link::new()
            .with_matcher(
                RequestMatcher::new(Policy::Prioritize)
                    .with_domain_re(r"^.+\.com$")
                    .unwrap(),
            )
            .with_matcher(
                RequestMatcher::new(Policy::Deprioritize)
                    .with_domain_re(r"^.+\.com$")
                    .unwrap(),
            );
        assert_eq!(link.priority(&Request::new("google.com", 80)), PriorityLevel::Normal);
    }

    #[test]
    fn gives_low_priority_when_matcher_says_so() {
        let link = Link::new().with_matcher(
            RequestMatcher::new(Policy::Deprioritize)
                .with_domain_re(r"^.+\.com$")
                .unwrap(),
        );
        assert_eq!(link.priority(&Request::new("google.com", 80)), PriorityLevel::Low);
    }

    #[test]
    fn gives_high_priority_when_matcher_says_so() {
        let link = Link::new().with_matcher(
            RequestMatcher::new(Policy::Prioritize)
                .with_domain_re(r"^.+\.com$")
                .unwrap(),
        );
        assert_eq!(link.priority(&Request::new("google.com", 80)), PriorityLevel::High);
    }

    #[test]
    fn forbids_everything_when_down() {
        let link = Link::new();
        link.status.store(false, Ordering::SeqCst);
        assert_eq!(link.priority(&Request::new("google.com", 80)), PriorityLevel::Forbid);
    }

    #[test]
    fn open_and_close_track_the_registry() {
        let link = Link::new();
        assert_eq!(link.active_connections(), 0);

        let pending = link.open("1").unwrap();
        assert_eq!(link.active_connections(), 1);
        assert!(matches!(link.open("1"), Err(LinkError::IdInUse(_))));

        link.close("1");
        assert_eq!(link.active_connections(), 0);
        // releasing again is a no-op
        link.close("1");
        drop(pending);
        assert_eq!(link.active_connections(), 0);
    }

    #[test]
    fn dropping_a_pending_connection_releases_its_id() {
        let link = Link::new();
        let pending = link.open("7").unwrap();
        assert_eq!(link.active_connections(), 1);
        drop(pending);
        assert_eq!(link.active_connections(), 0);
        assert!(link.open("7").is_ok());
    }

    #[test]
    fn displays_like_its_configuration() {
        let link = Link::new()
            .with_interface("wlp5s0")
            .with_proxy(Protocol::Socks5, "10.0.0.1", 1080)
            .with_weight(2);
        assert_eq!(link.to_string(), "Link:wlp5s0,socks5,10.0.0.1:1080,2");
        assert_eq!(Link::new().to_string(), "Link:1");
    }
}
