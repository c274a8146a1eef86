//! linkfront/src/balancer.rs
//! Two-stage dispatch: a global accept gate, then priority partitioning of
//! the link fleet and strategy selection on the winning partition.

use crate::link::{Link, PriorityLevel, ProbeTarget};
use crate::matcher::{Policy, RequestMatcher};
use crate::request::Request;
use crate::strategy::Strategy;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::error;

/// Mutable dispatch state, shared by concurrent `pick` calls.
///
/// `last` tracks the previously selected link across all requests, so a
/// round-robin rotation can be perturbed by requests whose partition
/// excludes the previous selection. That matches the configured intent:
/// the rotation is a process-global effect.
#[derive(Debug)]
struct Cursor {
    last: Option<Arc<Link>>,
    rng: SmallRng,
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor {
            last: None,
            rng: SmallRng::from_entropy(),
        }
    }
}

/// Chooses a [`Link`] for each accepted [`Request`].
#[derive(Serialize, Deserialize, Debug)]
pub struct Balancer {
    #[serde(default)]
    pub strategy: Strategy,
    pub links: Vec<Arc<Link>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<RequestMatcher>,
    #[serde(skip)]
    cursor: Mutex<Cursor>,
}

impl fmt::Display for Balancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Balancer:{},{}", self.strategy, self.links.len())
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Balancer::new(Strategy::default())
    }
}

impl Balancer {
    pub fn new(strategy: Strategy) -> Self {
        Balancer {
            strategy,
            links: Vec::new(),
            matchers: Vec::new(),
            cursor: Mutex::new(Cursor::default()),
        }
    }

    pub fn add_link(mut self, link: Link) -> Self {
        self.links.push(Arc::new(link));
        self
    }

    pub fn add_matcher(mut self, matcher: RequestMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Global accept gate over the balancer-level matchers. `prioritize`
    /// and `deprioritize` carry no meaning at this level and are ignored.
    pub fn should_accept(&self, request: &Request) -> bool {
        self.matchers.iter().all(|matcher| {
            let matching = matcher.matches(request);
            !(matcher.policy == Policy::Allow && !matching
                || matcher.policy == Policy::Forbid && matching)
        })
    }

    /// Buckets the fleet by per-link priority, preserving link order.
    /// Forbidden links are discarded.
    fn partition(&self, request: &Request) -> (Vec<Arc<Link>>, Vec<Arc<Link>>, Vec<Arc<Link>>) {
        let mut high = Vec::new();
        let mut normal = Vec::new();
        let mut low = Vec::new();
        for link in &self.links {
            match link.priority(request) {
                PriorityLevel::High => high.push(Arc::clone(link)),
                PriorityLevel::Normal => normal.push(Arc::clone(link)),
                PriorityLevel::Low => low.push(Arc::clone(link)),
                PriorityLevel::Forbid => {}
            }
        }
        (high, normal, low)
    }

    /// Selects a link for this request, or `None` (with a logged reason)
    /// when the request is rejected or no link can take it.
    pub fn pick(&self, request: &Request) -> Option<Arc<Link>> {
        if !self.should_accept(request) {
            error!(balancer = %self, "Request {request} rejected.");
            return None;
        }

        let (high, normal, low) = self.partition(request);
        let candidates = if !high.is_empty() {
            high
        } else if !normal.is_empty() {
            normal
        } else if !low.is_empty() {
            low
        } else {
            error!(balancer = %self, "No link available to take this request ({request}).");
            return None;
        };

        let mut cursor = self.cursor.lock().unwrap();
        let Cursor { last, rng } = &mut *cursor;
        let chosen = Arc::clone(self.strategy.select(&candidates, last.as_ref(), rng));
        *last = Some(Arc::clone(&chosen));
        Some(chosen)
    }

    /// Probes every link in turn, refreshing status and latency.
    // TODO: probe links concurrently; one unreachable link stalls the whole
    // sweep for its full timeout.
    pub async fn refresh_all(&self, probe: &ProbeTarget) {
        for link in &self.links {
            link.refresh_with(probe).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_link_balancer() -> Balancer {
        Balancer::new(Strategy::RoundRobin)
            .add_link(Link::new().with_proxy(crate::link::Protocol::Socks5, "Link1", 1080))
            .add_link(Link::new().with_proxy(crate::link::Protocol::Socks5, "Link2", 1081))
            .add_link(Link::new().with_proxy(crate::link::Protocol::Socks5, "Link3", 1082))
    }

    #[test]
    fn rotates_links_in_round_robin() {
        let balancer = three_link_balancer();
        let request = Request::new("test", 80);

        for expected in [0, 1, 2, 0] {
            let picked = balancer.pick(&request).unwrap();
            assert!(Arc::ptr_eq(&picked, &balancer.links[expected]));
        }
    }

    #[test]
    fn blocks_request_matching_a_forbid_matcher() {
        let balancer = Balancer::new(Strategy::RoundRobin)
            .add_link(Link::new())
            .add_matcher(RequestMatcher::new(Policy::Forbid).with_port(80));

        assert!(balancer.pick(&Request::new("test", 80)).is_none());
    }

    #[test]
    fn accepts_request_matching_an_allow_matcher() {
        let balancer = Balancer::new(Strategy::RoundRobin)
            .add_link(Link::new())
            .add_matcher(RequestMatcher::new(Policy::Allow).with_port(80));

        let picked = balancer.pick(&Request::new("test", 80)).unwrap();
        assert!(Arc::ptr_eq(&picked, &balancer.links[0]));
    }

    fn deprioritize_com() -> RequestMatcher {
        RequestMatcher::new(Policy::Deprioritize)
            .with_domain_re(r"^.+\.com$")
            .unwrap()
    }

    #[test]
    fn prefers_the_highest_non_empty_partition() {
        // a prioritized link wins over normal and deprioritized ones
        let balancer = Balancer::new(Strategy::RoundRobin)
            .add_link(Link::new().with_matcher(deprioritize_com()))
            .add_link(Link::new().with_matcher(
                RequestMatcher::new(Policy::Prioritize)
                    .with_domain_re(r"^.+\.com$")
                    .unwrap(),
            ))
            .add_link(Link::new());
        let picked = balancer.pick(&Request::new("google.com", 80)).unwrap();
        assert!(Arc::ptr_eq(&picked, &balancer.links[1]));

        // without a high bucket, normal wins over low
        let balancer = Balancer::new(Strategy::RoundRobin)
            .add_link(Link::new().with_matcher(deprioritize_com()))
            .add_link(Link::new());
        let picked = balancer.pick(&Request::new("google.com", 80)).unwrap();
        assert!(Arc::ptr_eq(&picked, &balancer.links[1]));

        // a low-priority link still serves when it is all that is left
        let balancer =
            Balancer::new(Strategy::RoundRobin).add_link(Link::new().with_matcher(deprioritize_com()));
        let picked = balancer.pick(&Request::new("google.com", 80)).unwrap();
        assert!(Arc::ptr_eq(&picked, &balancer.links[0]));
    }

    #[test]
    fn returns_none_when_every_link_forbids_the_request() {
        let balancer = Balancer::new(Strategy::RoundRobin).add_link(
            Link::new().with_matcher(
                RequestMatcher::new(Policy::Forbid)
                    .with_domain_re(r"^.+\.com$")
                    .unwrap(),
            ),
        );

        assert!(balancer.pick(&Request::new("google.com", 80)).is_none());
    }

    #[test]
    fn keeps_links_in_insertion_order() {
        let balancer = three_link_balancer();
        let domains: Vec<_> = balancer.links.iter().map(|l| l.domain.clone()).collect();
        assert_eq!(domains, ["Link1", "Link2", "Link3"]);
    }
}
