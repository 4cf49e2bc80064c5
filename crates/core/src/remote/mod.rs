//! Remote action dispatch.
//!
//! [`RemoteActionDispatcher::run_action`] resolves a remote by name among the
//! scope's configured remotes, connects to it and runs one action from the
//! closed [`RemoteAction`] set, returning the remote's JSON answer as is.
//! The typed helpers wrap the same path for the engine.

pub mod actions;
pub mod transport;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

pub use actions::{
    FetchLedgersRequest, FetchLedgersResponse, FetchObjectsRequest, ObjectPayload, PushComponent,
    PushOutcome, PushRequest, RemoteAction,
};
pub use transport::{connect, LocalTransport, Transport};

use crate::errors::{RemoteError, TransportError};
use crate::scope::Scope;

type Connector = dyn Fn(&str) -> Result<Box<dyn Transport>, TransportError>;

/// Runs remote actions on behalf of one local scope.
pub struct RemoteActionDispatcher<'a> {
    scope: &'a Scope,
    connector: Box<Connector>,
}

impl<'a> RemoteActionDispatcher<'a> {
    pub fn new(scope: &'a Scope) -> Self {
        Self::with_connector(scope, transport::connect)
    }

    /// Use a custom connector instead of [`transport::connect`].
    pub fn with_connector<F>(scope: &'a Scope, connector: F) -> Self
    where
        F: Fn(&str) -> Result<Box<dyn Transport>, TransportError> + 'static,
    {
        Self {
            scope,
            connector: Box::new(connector),
        }
    }

    /// Run the action called `name` against the remote called `remote`.
    ///
    /// Fails with [`RemoteError::UnknownRemote`] when the scope has no such
    /// remote, [`RemoteError::UnknownAction`] outside the action set, and
    /// [`RemoteError::ActionFailed`] when the transport fails.
    #[instrument(skip(self, options))]
    pub fn run_action(
        &self,
        name: &str,
        remote: &str,
        options: Map<String, Value>,
    ) -> Result<Value, RemoteError> {
        let location = self.resolve(remote)?;
        let action = RemoteAction::parse(name)?;
        self.call(remote, &location, action, &options)
    }

    fn resolve(&self, remote: &str) -> Result<String, RemoteError> {
        self.scope
            .resolve_remote(remote)?
            .ok_or_else(|| RemoteError::UnknownRemote(remote.to_string()))
    }

    fn call(
        &self,
        remote: &str,
        location: &str,
        action: RemoteAction,
        options: &Map<String, Value>,
    ) -> Result<Value, RemoteError> {
        let failed = |source| RemoteError::ActionFailed {
            remote: remote.to_string(),
            action: action.to_string(),
            source,
        };
        debug!(remote, location, action = %action, "calling remote");
        let transport = (self.connector)(location).map_err(failed)?;
        let answer = transport.call(action, options).map_err(failed)?;
        info!(remote, action = %action, "remote action completed");
        Ok(answer)
    }

    fn typed<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        remote: &str,
        action: RemoteAction,
        request: &Req,
    ) -> Result<Resp, RemoteError> {
        let failed = |detail: String| RemoteError::ActionFailed {
            remote: remote.to_string(),
            action: action.to_string(),
            source: TransportError::InvalidPayload(detail),
        };
        let options = match serde_json::to_value(request).map_err(|e| failed(e.to_string()))? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let location = self.resolve(remote)?;
        let answer = self.call(remote, &location, action, &options)?;
        serde_json::from_value(answer).map_err(|e| failed(e.to_string()))
    }

    // -- typed helpers --------------------------------------------------------

    pub fn fetch_ledgers(&self, remote: &str, ids: &[String]) -> Result<FetchLedgersResponse, RemoteError> {
        let request = FetchLedgersRequest { ids: ids.to_vec() };
        self.typed(remote, RemoteAction::FetchLedgers, &request)
    }

    /// Fetch the given trees with all their blobs, verified against their
    /// hashes.
    pub fn fetch_objects(
        &self,
        remote: &str,
        trees: &[String],
    ) -> Result<Vec<(String, Vec<u8>)>, RemoteError> {
        let request = FetchObjectsRequest { trees: trees.to_vec() };
        let response: actions::FetchObjectsResponse =
            self.typed(remote, RemoteAction::FetchObjects, &request)?;
        response
            .objects
            .iter()
            .map(ObjectPayload::decode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| RemoteError::ActionFailed {
                remote: remote.to_string(),
                action: RemoteAction::FetchObjects.to_string(),
                source,
            })
    }

    pub fn push(&self, remote: &str, request: &PushRequest) -> Result<PushOutcome, RemoteError> {
        self.typed(remote, RemoteAction::Push, request)
    }
}
