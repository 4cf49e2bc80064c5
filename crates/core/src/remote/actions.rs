//! The closed set of remote actions and their server-side handlers.
//!
//! Every action exchanges JSON: options arrive as an opaque map, are decoded
//! into a typed request, and the handler answers with a typed response
//! encoded back to a `serde_json::Value`. Object content travels base64
//! encoded.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::conflict::{ConflictDetector, Relation, Side};
use crate::errors::{RemoteConflict, RemoteError, TransportError};
use crate::ledger::{Version, VersionId, VersionLedger};
use crate::scope::{HeadUpdate, IngestBatch, Scope};

// ---------------------------------------------------------------------------
// Action set
// ---------------------------------------------------------------------------

/// Every action a remote scope answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteAction {
    ListComponents,
    FetchLedgers,
    FetchObjects,
    Push,
}

impl RemoteAction {
    pub const ALL: [RemoteAction; 4] = [
        Self::ListComponents,
        Self::FetchLedgers,
        Self::FetchObjects,
        Self::Push,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListComponents => "list-components",
            Self::FetchLedgers => "fetch-ledgers",
            Self::FetchObjects => "fetch-objects",
            Self::Push => "push",
        }
    }

    /// Look up an action by name. Names outside the set fail with
    /// [`RemoteError::UnknownAction`].
    pub fn parse(name: &str) -> Result<Self, RemoteError> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == name)
            .ok_or_else(|| RemoteError::UnknownAction {
                name: name.to_string(),
                valid: Self::ALL.iter().map(|a| a.as_str().to_string()).collect(),
            })
    }
}

impl std::fmt::Display for RemoteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// One entry of a `list-components` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub id: String,
    pub head: Option<String>,
    pub versions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListComponentsResponse {
    pub scope: String,
    pub components: Vec<ComponentSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLedgersRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLedgersResponse {
    pub ledgers: Vec<VersionLedger>,
    /// Requested ids the remote has never recorded.
    #[serde(default)]
    pub missing: Vec<String>,
}

impl FetchLedgersResponse {
    pub fn get(&self, id: &str) -> Option<&VersionLedger> {
        self.ledgers.iter().find(|l| l.component() == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchObjectsRequest {
    /// Tree hashes; each answer includes the tree and all of its blobs.
    pub trees: Vec<String>,
}

/// An object on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPayload {
    pub hash: String,
    /// Base64 of the raw bytes.
    pub content: String,
}

impl ObjectPayload {
    pub fn encode(hash: &str, content: &[u8]) -> Self {
        Self {
            hash: hash.to_string(),
            content: STANDARD.encode(content),
        }
    }

    pub fn decode(&self) -> Result<(String, Vec<u8>), TransportError> {
        let bytes = STANDARD
            .decode(&self.content)
            .map_err(|e| TransportError::InvalidPayload(format!("object {}: {e}", self.hash)))?;
        if crate::scope::blob_hash(&bytes) != self.hash {
            return Err(TransportError::InvalidPayload(format!(
                "object {} does not match its hash",
                self.hash
            )));
        }
        Ok((self.hash.clone(), bytes))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchObjectsResponse {
    pub objects: Vec<ObjectPayload>,
}

/// One component of a push: the new head and every version the remote may
/// not have yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushComponent {
    pub id: String,
    pub head: VersionId,
    pub versions: Vec<Version>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub components: Vec<PushComponent>,
    pub objects: Vec<ObjectPayload>,
}

/// Answer to a push. Nothing was applied unless both rejection lists are
/// empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<RemoteConflict>,
    /// Components whose remote history is unrelated to the pushed one.
    pub new_on_remote: Vec<String>,
}

impl PushOutcome {
    pub fn is_applied(&self) -> bool {
        self.rejected.is_empty() && self.new_on_remote.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn decode<T: DeserializeOwned>(action: RemoteAction, options: &Map<String, Value>) -> Result<T, TransportError> {
    serde_json::from_value(Value::Object(options.clone()))
        .map_err(|e| TransportError::InvalidPayload(format!("{action} options: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, TransportError> {
    serde_json::to_value(value).map_err(|e| TransportError::InvalidPayload(e.to_string()))
}

fn rejected<E: std::fmt::Display>(e: E) -> TransportError {
    TransportError::Rejected(e.to_string())
}

/// Answer `action` against `scope`. This is the remote side of every call.
pub fn handle(
    scope: &Scope,
    action: RemoteAction,
    options: &Map<String, Value>,
) -> Result<Value, TransportError> {
    debug!(action = %action, "handling remote action");
    match action {
        RemoteAction::ListComponents => encode(&list_components(scope)?),
        RemoteAction::FetchLedgers => encode(&fetch_ledgers(scope, decode(action, options)?)?),
        RemoteAction::FetchObjects => encode(&fetch_objects(scope, decode(action, options)?)?),
        RemoteAction::Push => encode(&push(scope, decode(action, options)?)?),
    }
}

fn list_components(scope: &Scope) -> Result<ListComponentsResponse, TransportError> {
    let mut components = Vec::new();
    for record in scope.list_components().map_err(rejected)? {
        let ledger = scope.load_ledger(&record.full_name).map_err(rejected)?;
        components.push(ComponentSummary {
            head: ledger
                .as_ref()
                .and_then(|l| l.head_version())
                .map(|v| v.tag.clone()),
            versions: ledger.as_ref().map_or(0, VersionLedger::len),
            id: record.full_name,
        });
    }
    Ok(ListComponentsResponse {
        scope: scope.name().map_err(rejected)?,
        components,
    })
}

fn fetch_ledgers(
    scope: &Scope,
    request: FetchLedgersRequest,
) -> Result<FetchLedgersResponse, TransportError> {
    let mut response = FetchLedgersResponse::default();
    for id in request.ids {
        match scope.load_ledger(&id).map_err(rejected)? {
            Some(ledger) => response.ledgers.push(ledger),
            None => response.missing.push(id),
        }
    }
    Ok(response)
}

fn fetch_objects(
    scope: &Scope,
    request: FetchObjectsRequest,
) -> Result<FetchObjectsResponse, TransportError> {
    let mut seen = BTreeMap::new();
    for tree in &request.trees {
        for (hash, content) in scope.tree_objects(tree).map_err(rejected)? {
            seen.entry(hash).or_insert(content);
        }
    }
    Ok(FetchObjectsResponse {
        objects: seen
            .iter()
            .map(|(hash, content)| ObjectPayload::encode(hash, content))
            .collect(),
    })
}

/// Re-validate every pushed component against the remote's current ledger
/// and apply all of them in one transaction, or none.
fn push(scope: &Scope, request: PushRequest) -> Result<PushOutcome, TransportError> {
    let mut outcome = PushOutcome::default();
    let mut batch = IngestBatch::default();

    for component in &request.components {
        let current = scope.load_ledger(&component.id).map_err(rejected)?;
        let remote_head = current.as_ref().and_then(|l| l.head().cloned());

        let mut graph = current.unwrap_or_else(|| VersionLedger::new(component.id.as_str()));
        for v in &component.versions {
            graph.insert(v.clone());
        }

        let relation = match &remote_head {
            None => Relation::FastForward(Side::Local),
            Some(remote_head) => {
                ConflictDetector::detect(&graph, &component.head, remote_head).map_err(rejected)?
            }
        };

        match relation {
            Relation::FastForward(Side::Local) => {
                batch.versions.extend(component.versions.iter().cloned());
                batch.heads.push(HeadUpdate {
                    component: component.id.clone(),
                    head: Some(component.head.clone()),
                    exported_head: Some(component.head.clone()),
                });
                outcome.accepted.push(component.id.clone());
            }
            // Nothing new for the remote.
            Relation::UpToDate | Relation::FastForward(Side::Remote) => {
                outcome.accepted.push(component.id.clone());
            }
            Relation::Conflict(divergence) => {
                let versions = divergence
                    .local_only
                    .iter()
                    .filter_map(|id| graph.get(id))
                    .map(|v| v.tag.clone())
                    .collect();
                outcome.rejected.push(RemoteConflict {
                    id: component.id.clone(),
                    versions,
                });
            }
            Relation::Unrelated => outcome.new_on_remote.push(component.id.clone()),
        }
    }

    if !outcome.is_applied() {
        warn!(
            rejected = outcome.rejected.len(),
            new_on_remote = outcome.new_on_remote.len(),
            "push rejected, nothing applied"
        );
        return Ok(outcome);
    }

    for object in &request.objects {
        batch.objects.push(object.decode()?);
    }
    scope.ingest(&batch).map_err(rejected)?;
    info!(components = outcome.accepted.len(), objects = batch.objects.len(), "push applied");
    Ok(outcome)
}
