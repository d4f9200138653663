//! Commit records, commit options and the commit log.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The logical unit of change: a mutation type and its payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl CommitRecord {
    pub fn new(kind: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }
}

/// Options accompanying a commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitOptions {
    /// Set when the commit replays a mutation received from a transport.
    /// External commits are never broadcast again.
    pub external: bool,
}

impl CommitOptions {
    pub fn local() -> Self {
        Self { external: false }
    }

    pub fn external() -> Self {
        Self { external: true }
    }
}

/// The two calling conventions a commit accepts.
///
/// `Typed` names the mutation explicitly. `Object` carries a JSON object whose
/// `"type"` field names the mutation; the whole object becomes the payload.
#[derive(Clone, Debug, PartialEq)]
pub enum CommitInput {
    Typed { kind: String, payload: Value },
    Object(Value),
}

impl CommitInput {
    /// Normalize either calling convention into a [`CommitRecord`].
    pub fn unify(self) -> Result<CommitRecord> {
        match self {
            CommitInput::Typed { kind, payload } => Ok(CommitRecord { kind, payload }),
            CommitInput::Object(object) => {
                let kind = match object.get("type") {
                    Some(Value::String(kind)) => kind.clone(),
                    Some(other) => {
                        return Err(CoreError::InvalidCommitShape(format!(
                            "expects string as the type, but found {}",
                            json_type_name(other)
                        )))
                    }
                    None => {
                        return Err(CoreError::InvalidCommitShape(format!(
                            "expects an object with a string type, but found {}",
                            json_type_name(&object)
                        )))
                    }
                };
                Ok(CommitRecord {
                    kind,
                    payload: object,
                })
            }
        }
    }
}

impl From<&str> for CommitInput {
    fn from(kind: &str) -> Self {
        CommitInput::Typed {
            kind: kind.to_string(),
            payload: Value::Null,
        }
    }
}

impl From<(&str, Value)> for CommitInput {
    fn from((kind, payload): (&str, Value)) -> Self {
        CommitInput::Typed {
            kind: kind.to_string(),
            payload,
        }
    }
}

impl From<(String, Value)> for CommitInput {
    fn from((kind, payload): (String, Value)) -> Self {
        CommitInput::Typed { kind, payload }
    }
}

impl From<Value> for CommitInput {
    fn from(object: Value) -> Self {
        CommitInput::Object(object)
    }
}

impl From<CommitRecord> for CommitInput {
    fn from(record: CommitRecord) -> Self {
        CommitInput::Typed {
            kind: record.kind,
            payload: record.payload,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Append-only log of successfully applied commits, kept for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct CommitLog {
    records: Vec<CommitRecord>,
}

impl CommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return its position in the log.
    pub fn push(&mut self, record: CommitRecord) -> u64 {
        self.records.push(record);
        (self.records.len() - 1) as u64
    }

    pub fn records(&self) -> &[CommitRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommitRecord> {
        self.records.iter()
    }
}
