//! Transport to a remote scope.
//!
//! Only scopes reachable on the local filesystem are supported: a plain path
//! or a `file://` URL. Network protocols are left to other [`Transport`]
//! implementations.

use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::{debug, instrument};

use super::actions::{self, RemoteAction};
use crate::errors::TransportError;
use crate::scope::Scope;

/// Something that can run a remote action and return its JSON answer.
pub trait Transport {
    /// Where the remote lives, for error messages.
    fn location(&self) -> &str;

    fn call(&self, action: RemoteAction, options: &Map<String, Value>) -> Result<Value, TransportError>;
}

/// Resolve a remote location to a directory.
pub fn parse_location(location: &str) -> Result<PathBuf, TransportError> {
    if let Some(path) = location.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if let Some((scheme, _)) = location.split_once("://") {
        return Err(TransportError::UnsupportedProtocol(scheme.to_string()));
    }
    Ok(PathBuf::from(location))
}

/// A remote scope opened straight from disk.
pub struct LocalTransport {
    location: String,
    scope: Scope,
}

impl LocalTransport {
    pub fn open(location: &str) -> Result<Self, TransportError> {
        let dir = parse_location(location)?;
        let scope = Scope::open(&dir).map_err(|e| TransportError::Unreachable {
            location: location.to_string(),
            detail: e.to_string(),
        })?;
        debug!(location, "opened local remote scope");
        Ok(Self {
            location: location.to_string(),
            scope,
        })
    }
}

impl Transport for LocalTransport {
    fn location(&self) -> &str {
        &self.location
    }

    #[instrument(skip(self, options), fields(location = %self.location))]
    fn call(&self, action: RemoteAction, options: &Map<String, Value>) -> Result<Value, TransportError> {
        actions::handle(&self.scope, action, options)
    }
}

/// Default connector: open whatever `location` points at.
pub fn connect(location: &str) -> Result<Box<dyn Transport>, TransportError> {
    Ok(Box::new(LocalTransport::open(location)?))
}
