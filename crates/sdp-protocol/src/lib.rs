// sdp-protocol: Wire types for the distributed query fan-out protocol.
//
// All bus and gateway payloads use a top-level `kind` field for discriminated
// deserialization.  The enum variants map 1:1 to the frozen message kinds.
// The transport is responsible for length-prefixed framing; the payload
// encoding itself is tagged JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub mod pagination;

/// The wildcard scope: a query with this scope is broadcast to every
/// responder regardless of the scopes they serve.
pub const WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Rejections produced by the `validate()` entry points.
///
/// Validation happens before anything crosses the bus; a payload that fails
/// here is never published.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("GET queries must carry a query string")]
    GetWithoutQuery,
    #[error("unique attribute '{0}' is not present in the item's attributes")]
    UniqueAttributeMissing(String),
    #[error("unique attribute '{0}' has an empty value")]
    UniqueAttributeEmpty(String),
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// How a responder should interpret the `query` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryMethod {
    /// Fetch exactly one item by its unique attribute value.
    Get,
    /// List every item of the type within the scope; `query` is ignored.
    List,
    /// Responder-defined free-text search.
    Search,
}

/// Link-following behaviour attached to a query.
///
/// Carried through to responders unchanged; the engine itself never follows
/// links.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecursionBehaviour {
    /// How many levels of linked items responders may resolve. 0 = none.
    #[serde(default)]
    pub link_depth: u32,
    /// Only follow links whose blast propagation allows impact to flow.
    #[serde(default)]
    pub follow_only_blast_propagation: bool,
}

/// An immutable description of one logical query.
///
/// A nil `uuid` means "not yet assigned"; the coordinator assigns a fresh v4
/// before broadcasting.  The reply subject for all frames pertaining to this
/// query is derived from the uuid (see `sdp-bus::subjects`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default = "Uuid::nil")]
    pub uuid: Uuid,
    /// Item type to query for; `*` matches all types.
    #[serde(rename = "type")]
    pub item_type: String,
    pub method: QueryMethod,
    /// Meaning depends on `method`; must be non-empty for GET.
    #[serde(default)]
    pub query: String,
    /// Routing scope; `*` denotes the wildcard scope.
    pub scope: String,
    #[serde(default)]
    pub recursion_behaviour: RecursionBehaviour,
    /// Ask responders to bypass their caches.
    #[serde(default)]
    pub ignore_cache: bool,
    /// Advisory wall-clock deadline forwarded to responders.  The engine
    /// carries it unchanged; enforcement is per-responder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl Query {
    /// Check the invariants every query must satisfy before broadcast.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.item_type.is_empty() {
            return Err(ProtocolError::MissingField("query type"));
        }
        if self.scope.is_empty() {
            return Err(ProtocolError::MissingField("query scope"));
        }
        if self.method == QueryMethod::Get && self.query.is_empty() {
            return Err(ProtocolError::GetWithoutQuery);
        }
        Ok(())
    }

    /// True when this query can only ever produce a single item: a GET with a
    /// concrete scope and a concrete type.
    pub fn is_single_item(&self) -> bool {
        self.method == QueryMethod::Get && self.scope != WILDCARD && self.item_type != WILDCARD
    }
}

/// Cancellation broadcast for a previously-issued query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelQuery {
    pub uuid: Uuid,
}

// ---------------------------------------------------------------------------
// Responder heartbeat / status
// ---------------------------------------------------------------------------

/// The state a responder reports (or is assigned) for one query.
///
/// `Stalled` is assigned by the tracker only — responders never emit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponderState {
    Working,
    Stalled,
    Complete,
    Error,
    Cancelled,
}

impl ResponderState {
    /// Terminal states never transition out.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

/// A heartbeat or final status frame from one responder working a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Human-readable responder name (not unique).
    pub responder: String,
    /// Stable identity of the responder process for this query.
    pub responder_uuid: Uuid,
    pub state: ResponderState,
    /// How long the tracker should wait for the next frame before declaring
    /// a stall.  Absent on terminal frames.
    #[serde(
        default,
        rename = "next_update_in_ms",
        with = "serde_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_update_in: Option<Duration>,
    pub query_uuid: Uuid,
}

/// Serialize `Option<Duration>` as integer milliseconds.
mod serde_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// Items, references, edges
// ---------------------------------------------------------------------------

/// The content-addressed identity of an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "type")]
    pub item_type: String,
    pub unique_attribute_value: String,
    pub scope: String,
}

impl Reference {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.item_type.is_empty() {
            return Err(ProtocolError::MissingField("reference type"));
        }
        if self.unique_attribute_value.is_empty() {
            return Err(ProtocolError::MissingField("reference unique attribute value"));
        }
        if self.scope.is_empty() {
            return Err(ProtocolError::MissingField("reference scope"));
        }
        Ok(())
    }

    /// `scope.type.uniqueAttributeValue` — globally unique across the system.
    pub fn globally_unique_name(&self) -> String {
        format!("{}.{}.{}", self.scope, self.item_type, self.unique_attribute_value)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.globally_unique_name())
    }
}

/// Whether impact flows in and/or out along an edge.  Carried through
/// unchanged by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlastPropagation {
    #[serde(rename = "in")]
    pub propagate_in: bool,
    #[serde(rename = "out")]
    pub propagate_out: bool,
}

/// A resolved link from an item to another item that already exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedItem {
    pub item: Reference,
    #[serde(default)]
    pub blast_propagation: BlastPropagation,
}

/// An unresolved link: a query that would locate the linked item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedItemQuery {
    pub query: Query,
    #[serde(default)]
    pub blast_propagation: BlastPropagation,
}

/// One discovered item, streamed on the reply subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "type")]
    pub item_type: String,
    /// Name of the attribute whose value makes this item unique in its scope.
    pub unique_attribute: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub scope: String,
    /// UUID of the query this item was discovered for, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_query: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_items: Vec<LinkedItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_item_queries: Vec<LinkedItemQuery>,
}

impl Item {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.item_type.is_empty() {
            return Err(ProtocolError::MissingField("item type"));
        }
        if self.unique_attribute.is_empty() {
            return Err(ProtocolError::MissingField("item unique attribute"));
        }
        if self.scope.is_empty() {
            return Err(ProtocolError::MissingField("item scope"));
        }
        if self.attributes.is_empty() {
            return Err(ProtocolError::MissingField("item attributes"));
        }
        match self.unique_attribute_value() {
            None => Err(ProtocolError::UniqueAttributeMissing(self.unique_attribute.clone())),
            Some(v) if v.is_empty() => {
                Err(ProtocolError::UniqueAttributeEmpty(self.unique_attribute.clone()))
            }
            Some(_) => Ok(()),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    /// The unique attribute's value rendered as a string.  Non-string values
    /// use their JSON rendering.
    pub fn unique_attribute_value(&self) -> Option<String> {
        self.attributes.get(&self.unique_attribute).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn reference(&self) -> Reference {
        Reference {
            item_type: self.item_type.clone(),
            unique_attribute_value: self.unique_attribute_value().unwrap_or_default(),
            scope: self.scope.clone(),
        }
    }

    pub fn globally_unique_name(&self) -> String {
        self.reference().globally_unique_name()
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.globally_unique_name())
    }
}

/// A directed relationship between two items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: Reference,
    pub to: Reference,
    #[serde(default)]
    pub blast_propagation: BlastPropagation,
}

impl Edge {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.from.validate()?;
        self.to.validate()
    }
}

// ---------------------------------------------------------------------------
// Errors from responders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryErrorType {
    /// The query matched nothing.  Treated as a trivially-successful mapping
    /// by the gateway client.
    NotFound,
    /// The responder does not serve the requested scope.
    NoScope,
    Timeout,
    Other,
}

/// A structured error from one responder, streamed on the reply subject and
/// forwarded to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    /// UUID of the query this error pertains to.
    pub uuid: Uuid,
    pub error_type: QueryErrorType,
    pub error_string: String,
    pub scope: String,
    /// Name of the source (adapter) that produced the error.
    pub source_name: String,
    pub item_type: String,
    pub responder_name: String,
}

impl QueryError {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.error_string.is_empty() {
            return Err(ProtocolError::MissingField("error string"));
        }
        if self.scope.is_empty() {
            return Err(ProtocolError::MissingField("error scope"));
        }
        if self.source_name.is_empty() {
            return Err(ProtocolError::MissingField("error source name"));
        }
        if self.item_type.is_empty() {
            return Err(ProtocolError::MissingField("error item type"));
        }
        if self.responder_name.is_empty() {
            return Err(ProtocolError::MissingField("error responder name"));
        }
        Ok(())
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} from {} ({}.{}): {}",
            self.error_type, self.responder_name, self.scope, self.item_type, self.error_string
        )
    }
}

// ---------------------------------------------------------------------------
// Logical query lifecycle (gateway stream)
// ---------------------------------------------------------------------------

/// Lifecycle state of a whole logical query, as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Started,
    Finished,
    Cancelled,
    Errored,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Started)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatus {
    pub uuid: Uuid,
    pub status: QueryState,
}

// ---------------------------------------------------------------------------
// Reply-subject envelope
// ---------------------------------------------------------------------------

/// Union of everything a responder publishes on a query's reply subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum QueryResponse {
    NewItem(Item),
    NewEdge(Edge),
    Error(QueryError),
    Response(Response),
}

// ---------------------------------------------------------------------------
// Gateway stream messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Correlation ID for the matching result frame.
    pub msg_id: Uuid,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub msg_id: Uuid,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStoreResult {
    pub msg_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLoadResult {
    pub msg_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreBookmark {
    pub msg_id: Uuid,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBookmark {
    pub msg_id: Uuid,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkStoreResult {
    pub msg_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkLoadResult {
    pub msg_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
}

/// A user chat message sent over the gateway stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
}

/// A (possibly partial) assistant reply.  Keyed on the nil uuid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    #[serde(default)]
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStart {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFinish {
    pub name: String,
    #[serde(default)]
    pub output: String,
}

/// Everything a client may send on the gateway stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum GatewayRequest {
    Query(Query),
    CancelQuery(CancelQuery),
    StoreSnapshot(StoreSnapshot),
    LoadSnapshot(LoadSnapshot),
    StoreBookmark(StoreBookmark),
    LoadBookmark(LoadBookmark),
    ChatMessage(ChatMessage),
}

/// Everything the gateway may send on the stream.  Unknown kinds fail
/// deserialization and are logged-and-dropped at the demultiplexing site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum GatewayResponse {
    NewItem(Item),
    NewEdge(Edge),
    /// A responder heartbeat forwarded by the gateway.
    Status(Response),
    QueryError(QueryError),
    DeleteItem(Reference),
    DeleteEdge(Edge),
    UpdateItem(Item),
    SnapshotStoreResult(SnapshotStoreResult),
    SnapshotLoadResult(SnapshotLoadResult),
    BookmarkStoreResult(BookmarkStoreResult),
    BookmarkLoadResult(BookmarkLoadResult),
    QueryStatus(QueryStatus),
    ChatResponse(ChatResponse),
    ToolStart(ToolStart),
    ToolFinish(ToolFinish),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(scope: &str, item_type: &str, name: &str) -> Item {
        let mut attributes = serde_json::Map::new();
        attributes.insert("name".to_owned(), serde_json::Value::String(name.to_owned()));
        Item {
            item_type: item_type.to_owned(),
            unique_attribute: "name".to_owned(),
            attributes,
            scope: scope.to_owned(),
            source_query: None,
            linked_items: vec![],
            linked_item_queries: vec![],
        }
    }

    #[test]
    fn query_validation_rejects_empty_type_and_scope() {
        let mut q = Query {
            uuid: Uuid::nil(),
            item_type: "person".to_owned(),
            method: QueryMethod::List,
            query: String::new(),
            scope: "global".to_owned(),
            recursion_behaviour: RecursionBehaviour::default(),
            ignore_cache: false,
            deadline: None,
        };
        assert!(q.validate().is_ok());

        q.item_type = String::new();
        assert_eq!(q.validate(), Err(ProtocolError::MissingField("query type")));

        q.item_type = "person".to_owned();
        q.scope = String::new();
        assert_eq!(q.validate(), Err(ProtocolError::MissingField("query scope")));
    }

    #[test]
    fn get_query_requires_query_string() {
        let q = Query {
            uuid: Uuid::nil(),
            item_type: "person".to_owned(),
            method: QueryMethod::Get,
            query: String::new(),
            scope: "global".to_owned(),
            recursion_behaviour: RecursionBehaviour::default(),
            ignore_cache: false,
            deadline: None,
        };
        assert_eq!(q.validate(), Err(ProtocolError::GetWithoutQuery));
    }

    #[test]
    fn single_item_requires_get_with_concrete_scope_and_type() {
        let mut q = Query {
            uuid: Uuid::nil(),
            item_type: "person".to_owned(),
            method: QueryMethod::Get,
            query: "alice".to_owned(),
            scope: "global".to_owned(),
            recursion_behaviour: RecursionBehaviour::default(),
            ignore_cache: false,
            deadline: None,
        };
        assert!(q.is_single_item());

        q.scope = WILDCARD.to_owned();
        assert!(!q.is_single_item());

        q.scope = "global".to_owned();
        q.item_type = WILDCARD.to_owned();
        assert!(!q.is_single_item());

        q.item_type = "person".to_owned();
        q.method = QueryMethod::List;
        assert!(!q.is_single_item());
    }

    #[test]
    fn globally_unique_name_is_scope_type_value() {
        let i = item("prod", "person", "alice");
        assert_eq!(i.globally_unique_name(), "prod.person.alice");
        assert_eq!(i.reference().to_string(), "prod.person.alice");
    }

    #[test]
    fn item_validation_requires_unique_attribute_present_and_non_empty() {
        let mut i = item("prod", "person", "alice");
        assert!(i.validate().is_ok());

        i.unique_attribute = "id".to_owned();
        assert_eq!(
            i.validate(),
            Err(ProtocolError::UniqueAttributeMissing("id".to_owned()))
        );

        i.unique_attribute = "name".to_owned();
        i.attributes
            .insert("name".to_owned(), serde_json::Value::String(String::new()));
        assert_eq!(
            i.validate(),
            Err(ProtocolError::UniqueAttributeEmpty("name".to_owned()))
        );
    }

    #[test]
    fn non_string_unique_attribute_uses_json_rendering() {
        let mut i = item("prod", "port", "ignored");
        i.unique_attribute = "number".to_owned();
        i.attributes
            .insert("number".to_owned(), serde_json::Value::from(8080));
        assert_eq!(i.unique_attribute_value().as_deref(), Some("8080"));
        assert_eq!(i.globally_unique_name(), "prod.port.8080");
    }

    #[test]
    fn edge_validation_checks_both_endpoints() {
        let good = Reference {
            item_type: "person".to_owned(),
            unique_attribute_value: "alice".to_owned(),
            scope: "prod".to_owned(),
        };
        let bad = Reference {
            item_type: String::new(),
            unique_attribute_value: "x".to_owned(),
            scope: "prod".to_owned(),
        };
        let edge = Edge {
            from: good.clone(),
            to: bad,
            blast_propagation: BlastPropagation::default(),
        };
        assert!(edge.validate().is_err());

        let edge = Edge {
            from: good.clone(),
            to: good,
            blast_propagation: BlastPropagation { propagate_in: true, propagate_out: false },
        };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn terminal_states_are_exactly_complete_error_cancelled() {
        assert!(!ResponderState::Working.is_terminal());
        assert!(!ResponderState::Stalled.is_terminal());
        assert!(ResponderState::Complete.is_terminal());
        assert!(ResponderState::Error.is_terminal());
        assert!(ResponderState::Cancelled.is_terminal());
    }

    #[test]
    fn query_error_validation_requires_all_descriptive_fields() {
        let mut e = QueryError {
            uuid: Uuid::new_v4(),
            error_type: QueryErrorType::Other,
            error_string: "boom".to_owned(),
            scope: "prod".to_owned(),
            source_name: "aws".to_owned(),
            item_type: "person".to_owned(),
            responder_name: "resp-1".to_owned(),
        };
        assert!(e.validate().is_ok());
        e.source_name = String::new();
        assert!(e.validate().is_err());
    }
}
