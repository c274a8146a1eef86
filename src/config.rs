//! linkfront/src/config.rs
//! JSON configuration: loading, validation, saving.
//!
//! The JSON schema is carried by the serde derives on each entity: plain
//! fields are mandatory, `default` fields are optional, `skip` fields are
//! runtime-only, and enums serialize to their lowercase tags. Matcher
//! patterns are recompiled while deserializing, so a loaded server is ready
//! to dispatch.

use crate::server::Server;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot access '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("link weight must be at least 1")]
    ZeroWeight,
}

/// Reads and validates a full server configuration.
pub fn load(path: &Path) -> Result<Server, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    from_str(&raw)
}

pub fn from_str(raw: &str) -> Result<Server, ConfigError> {
    let server: Server = serde_json::from_str(raw)?;
    validate(&server)?;
    Ok(server)
}

fn validate(server: &Server) -> Result<(), ConfigError> {
    for link in &server.balancer.links {
        if link.weight == 0 {
            return Err(ConfigError::ZeroWeight);
        }
    }
    Ok(())
}

pub fn to_string(server: &Server) -> Result<String, ConfigError> {
    Ok(serde_json::to_string_pretty(server)?)
}

/// Writes the configuration back out; only pattern sources and declarative
/// fields are emitted, never runtime state.
pub fn save(path: &Path, server: &Server) -> Result<(), ConfigError> {
    let raw = to_string(server)?;
    fs::write(path, raw).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}
