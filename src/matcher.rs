//! linkfront/src/matcher.rs
//! Request matching: a predicate over destinations paired with a policy tag.

use crate::request::Request;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// Declarative action taken when a matcher matches (or fails to match)
/// a request.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Forbid,
    Allow,
    Deprioritize,
    Prioritize,
}

/// Predicate over a [`Request`]: an optional port set and an optional list
/// of domain patterns. Pattern sources are kept verbatim so a loaded
/// configuration serializes back to the exact strings it was built from;
/// the compiled forms are derived and never serialized.
///
/// Patterns match from the start of the domain (`re.match` semantics), so
/// `.+\.com$` matches `google.com` but `\.com$` alone does not.
#[derive(Serialize, Debug, Default, Clone)]
pub struct RequestMatcher {
    pub policy: Policy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains_re: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(skip)]
    compiled: Vec<Regex>,
}

/// Compiles a pattern anchored at position 0. The wrapping group keeps
/// alternations intact and leaves the source string untouched.
fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})"))
}

impl RequestMatcher {
    pub fn new(policy: Policy) -> Self {
        RequestMatcher {
            policy,
            ..Default::default()
        }
    }

    pub fn with_domain_re(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.compiled.push(compile_anchored(pattern)?);
        self.domains_re.push(pattern.to_string());
        Ok(self)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    /// Matching semantics:
    /// 1. a non-empty port set that does not contain the request port is a
    ///    mismatch;
    /// 2. with no domain patterns, everything else matches;
    /// 3. otherwise at least one pattern must match the domain.
    pub fn matches(&self, request: &Request) -> bool {
        if !self.ports.is_empty() && !self.ports.contains(&request.port) {
            return false;
        }
        if self.domains_re.is_empty() {
            return true;
        }
        self.compiled.iter().any(|re| re.is_match(&request.domain))
    }
}

// Deserialization recompiles the pattern sources so the matcher is usable
// straight out of the configuration loader. A pattern that fails to compile
// is a configuration error.
impl<'de> Deserialize<'de> for RequestMatcher {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Repr {
            policy: Policy,
            #[serde(default)]
            domains_re: Vec<String>,
            #[serde(default)]
            ports: Vec<u16>,
        }

        let repr = Repr::deserialize(deserializer)?;
        let compiled = repr
            .domains_re
            .iter()
            .map(|pattern| compile_anchored(pattern))
            .collect::<Result<Vec<_>, _>>()
            .map_err(serde::de::Error::custom)?;
        Ok(RequestMatcher {
            policy: repr.policy,
            domains_re: repr.domains_re,
            ports: repr.ports,
            compiled,
        })
    }
}
