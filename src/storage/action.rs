use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Payload for {0} must be a JSON object")]
    NotAnObject(OperationKind),

    #[error("{0} requires a non-empty string or numeric id")]
    MissingId(OperationKind),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Upsert,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Upsert => "upsert",
        };
        f.write_str(name)
    }
}

impl FromStr for OperationKind {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            "upsert" => Ok(OperationKind::Upsert),
            other => Err(ActionError::UnknownOperation(other.to_string())),
        }
    }
}

/// Primary key of a row, kept in the JSON form the caller supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowId {
    Text(String),
    Number(serde_json::Number),
}

impl RowId {
    /// Accepts a non-empty string or a number.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(RowId::Text(s.clone())),
            Value::Number(n) => Some(RowId::Number(n.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RowId::Text(s) => Value::String(s.clone()),
            RowId::Number(n) => Value::Number(n.clone()),
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowId::Text(s) => f.write_str(s),
            RowId::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for RowId {
    fn from(s: &str) -> Self {
        RowId::Text(s.to_string())
    }
}

impl From<i64> for RowId {
    fn from(n: i64) -> Self {
        RowId::Number(n.into())
    }
}

/// A full row body, as sent by insert and upsert.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, Value>);

impl Record {
    pub fn id(&self) -> Option<RowId> {
        self.0.get("id").and_then(RowId::from_value)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Partial row body addressed by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct Patch {
    pub id: RowId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TryFrom<Map<String, Value>> for Patch {
    type Error = ActionError;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        let id = take_id(&mut map).ok_or(ActionError::MissingId(OperationKind::Update))?;
        Ok(Patch { id, fields: map })
    }
}

/// Row addressed by id only. Extra payload fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct RecordRef {
    pub id: RowId,
}

impl TryFrom<Map<String, Value>> for RecordRef {
    type Error = ActionError;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        let id = take_id(&mut map).ok_or(ActionError::MissingId(OperationKind::Delete))?;
        Ok(RecordRef { id })
    }
}

fn take_id(map: &mut Map<String, Value>) -> Option<RowId> {
    RowId::from_value(&map.remove("id")?)
}

/// A write against one table, with a payload shape fixed by the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "data", rename_all = "lowercase")]
pub enum Mutation {
    Insert(Record),
    Update(Patch),
    Delete(RecordRef),
    Upsert(Record),
}

impl Mutation {
    /// Build a mutation from an untyped payload, rejecting shapes that could
    /// never be replayed.
    pub fn from_parts(kind: OperationKind, data: Value) -> Result<Self, ActionError> {
        let map = match data {
            Value::Object(map) => map,
            _ => return Err(ActionError::NotAnObject(kind)),
        };

        match kind {
            OperationKind::Insert => Ok(Mutation::Insert(Record(map))),
            OperationKind::Upsert => Ok(Mutation::Upsert(Record(map))),
            OperationKind::Update => Patch::try_from(map)
                .map(Mutation::Update)
                .map_err(|_| ActionError::MissingId(kind)),
            OperationKind::Delete => RecordRef::try_from(map)
                .map(Mutation::Delete)
                .map_err(|_| ActionError::MissingId(kind)),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Mutation::Insert(_) => OperationKind::Insert,
            Mutation::Update(_) => OperationKind::Update,
            Mutation::Delete(_) => OperationKind::Delete,
            Mutation::Upsert(_) => OperationKind::Upsert,
        }
    }

    /// Id of the targeted row, when the payload names one.
    pub fn record_id(&self) -> Option<RowId> {
        match self {
            Mutation::Insert(record) | Mutation::Upsert(record) => record.id(),
            Mutation::Update(patch) => Some(patch.id.clone()),
            Mutation::Delete(target) => Some(target.id.clone()),
        }
    }

    /// Payload as it would be handed to a remote table API.
    pub fn data(&self) -> Value {
        match self {
            Mutation::Insert(record) | Mutation::Upsert(record) => {
                Value::Object(record.0.clone())
            }
            Mutation::Update(patch) => {
                let mut map = patch.fields.clone();
                map.insert("id".to_string(), patch.id.to_value());
                Value::Object(map)
            }
            Mutation::Delete(target) => {
                let mut map = Map::new();
                map.insert("id".to_string(), target.id.to_value());
                Value::Object(map)
            }
        }
    }
}

/// One pending write, as stored in the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: String,
    pub table: String,
    pub mutation: Mutation,
    /// Creation time in milliseconds since `UNIX_EPOCH`.
    pub timestamp: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedAction {
    pub fn new<T: Into<String>>(table: T, mutation: Mutation, timestamp: u64) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), table, mutation, timestamp)
    }

    pub fn with_id<I: Into<String>, T: Into<String>>(
        id: I,
        table: T,
        mutation: Mutation,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            mutation,
            timestamp,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn operation(&self) -> OperationKind {
        self.mutation.kind()
    }
}
