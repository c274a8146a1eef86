//! linkfront/src/lib.rs
//! SOCKS5 front-end proxy that multiplexes client sessions onto a balanced
//! pool of upstream links: direct egress interfaces or chained
//! SOCKS4/SOCKS5/HTTP proxies.

// Module declarations
pub mod balancer;
pub mod config;
mod connection;
pub mod link;
pub mod logging;
pub mod matcher;
pub mod protocol;
pub mod request;
pub mod server;
pub mod strategy;

pub use balancer::Balancer;
pub use link::{Link, PriorityLevel, ProbeTarget, Protocol};
pub use matcher::{Policy, RequestMatcher};
pub use request::Request;
pub use server::Server;
pub use strategy::Strategy;
