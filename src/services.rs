//! Collaborators consumed by the query engine and the shapes they answer with.
//!
//! The engine never talks to a concrete backend: rule resolution, document
//! retrieval, saved-query persistence and the study catalog are reached through
//! the traits below. The [`crate::memory`] module implements all of them over an
//! in-memory dataset.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{DqtError, Result};
use crate::filter::LookupPath;

// ------------- Field references -------------
/// An `instrument,field` pair, the way fields are listed in a query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldRef {
    pub instrument: String,
    pub field: String,
}

impl FieldRef {
    pub fn new(instrument: &str, field: &str) -> Self {
        Self { instrument: instrument.to_owned(), field: field.to_owned() }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.instrument, self.field)
    }
}

impl FromStr for FieldRef {
    type Err = DqtError;
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(',') {
            Some((instrument, field)) if !instrument.is_empty() && !field.is_empty() => {
                Ok(FieldRef::new(instrument, field))
            }
            _ => Err(DqtError::parse(format!("'{}' is not an instrument,field pair", s))),
        }
    }
}

impl Serialize for FieldRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
impl<'de> Deserialize<'de> for FieldRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ------------- Field dictionary -------------
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    #[serde(rename = "Type", default)]
    pub field_type: String,
    #[serde(rename = "IsFile", default)]
    pub is_file: bool,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One dictionary row: `{key: [instrument, field], value: {Type, IsFile, ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    pub key: (String, String),
    pub value: FieldInfo,
}

impl DictionaryEntry {
    pub fn field_ref(&self) -> FieldRef {
        FieldRef::new(&self.key.0, &self.key.1)
    }
}

#[async_trait]
pub trait FieldDictionary: Send + Sync {
    /// The ordered field list of one instrument.
    async fn fields(&self, instrument: &str) -> Result<Vec<DictionaryEntry>>;
    /// Dictionary entries for an arbitrary list of fields. Unknown fields are left out.
    async fn describe(&self, fields: &[FieldRef]) -> Result<Vec<DictionaryEntry>>;
}

// ------------- Session-match lookups -------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchQuery {
    pub instrument: String,
    pub field: String,
    pub value: String,
    pub path: LookupPath,
}

#[async_trait]
pub trait SessionMatcher: Send + Sync {
    /// Every `[subject, visit]` whose document satisfies the lookup.
    async fn matching_sessions(&self, query: &MatchQuery) -> Result<Vec<(String, String)>>;
}

// ------------- Document retrieval -------------
/// A `[subject, visit]` pair asked for in a retrieval request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionVisit(pub String, pub String);

impl SessionVisit {
    pub fn new(subject: &str, visit: &str) -> Self {
        Self(subject.to_owned(), visit.to_owned())
    }
    pub fn subject(&self) -> &str {
        &self.0
    }
    pub fn visit(&self) -> &str {
        &self.1
    }
}

/// An instrument document of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDocument {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl InstrumentDocument {
    /// A field's value as display text; `None` when missing or null.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.data.get(field)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// The session key of a retrieval row, sent either as `"subject,visit"` or as a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowValue {
    Key(String),
    Parts(Vec<String>),
}

impl RowValue {
    pub fn identifier(&self) -> String {
        match self {
            RowValue::Key(key) => key.clone(),
            RowValue::Parts(parts) => parts.join(","),
        }
    }
}

/// One retrieval row: `{key: [instrument, subject, visit], value, doc}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRow {
    pub key: (String, String, String),
    pub value: RowValue,
    pub doc: InstrumentDocument,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn retrieve(&self, instrument: &str, sessions: &[SessionVisit]) -> Result<Vec<DocumentRow>>;
}

// ------------- Study catalog -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub category: String,
    pub num_fields: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudySetup {
    /// Known visit labels in study order.
    pub visits: Vec<String>,
    pub categories: Vec<Category>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait StudyCatalog: Send + Sync {
    async fn setup(&self) -> Result<StudySetup>;
    /// Every candidate subject; the result of a query with no filter.
    async fn sessions(&self) -> Result<Vec<String>>;
}

// ------------- Saved queries -------------
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedQueryIds {
    pub user: Vec<String>,
    pub shared: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub name: String,
    pub shared: bool,
    pub overwrite: bool,
    pub fields: Value,
    pub filter: Value,
}

#[async_trait]
pub trait SavedQueryStore: Send + Sync {
    async fn list(&self) -> Result<SavedQueryIds>;
    /// The raw stored document, in whichever schema it was saved.
    async fn fetch(&self, id: &str) -> Result<Value>;
    /// Returns the id the query was stored under, or `DqtError::SaveConflict` when the
    /// name is taken and `overwrite` is not set.
    async fn save(&self, request: SaveRequest) -> Result<String>;
    async fn delete(&self, id: &str) -> Result<()>;
}

// ------------- Downloads -------------
pub trait FileLinkResolver: Send + Sync {
    /// A retrievable url for a file reference stored in a document.
    fn href(&self, file: &str) -> String;
}

/// The collaborators a [`crate::interface::QueryInterface`] is wired to.
#[derive(Clone)]
pub struct Services {
    pub dictionary: Arc<dyn FieldDictionary>,
    pub matcher: Arc<dyn SessionMatcher>,
    pub documents: Arc<dyn DocumentSource>,
    pub catalog: Arc<dyn StudyCatalog>,
    pub queries: Arc<dyn SavedQueryStore>,
    pub links: Arc<dyn FileLinkResolver>,
}
