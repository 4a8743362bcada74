//! An in-memory study backend.
//!
//! A [`Dataset`] holds the visits, candidate sessions, field dictionaries and
//! documents of one study, usually read from a JSON file:
//!
//! ```json
//! {
//!   "visits": ["V1", "V2"],
//!   "sessions": ["S1", "S2"],
//!   "instruments": {
//!     "bmi": {
//!       "fields": { "weight": { "Type": "int" }, "scan": { "Type": "varchar(255)", "IsFile": true } },
//!       "documents": [ { "_id": "d1", "subject": "S1", "visit": "V1", "data": { "weight": 70 } } ]
//!     }
//!   }
//! }
//! ```
//!
//! [`MemoryBackend`] answers dictionary, session-match, retrieval and catalog
//! requests from it, and [`MemoryQueryStore`] keeps saved queries.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{DqtError, Result};
use crate::filter::LookupPath;
use crate::saved;
use crate::services::{
    Category, DictionaryEntry, DocumentRow, DocumentSource, FieldDictionary, FieldInfo, FieldRef,
    InstrumentDocument, MatchQuery, RowValue, SaveRequest, SavedQueryIds, SavedQueryStore, SessionMatcher,
    SessionVisit, StudyCatalog, StudySetup,
};

// ------------- Dataset -------------
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetDocument {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub subject: String,
    pub visit: String,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetInstrument {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldInfo>,
    #[serde(default)]
    pub documents: Vec<DatasetDocument>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub visits: Vec<String>,
    /// Candidate subjects. Derived from the documents when left out.
    #[serde(default)]
    pub sessions: Vec<String>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub instruments: BTreeMap<String, DatasetInstrument>,
}

impl Dataset {
    pub fn new(visits: &[&str]) -> Self {
        Self { visits: visits.iter().map(|visit| visit.to_string()).collect(), ..Self::default() }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let dataset: Dataset = serde_json::from_str(&text)?;
        info!(
            path = %path.display(),
            instruments = dataset.instruments.len(),
            visits = dataset.visits.len(),
            "dataset loaded"
        );
        Ok(dataset)
    }

    pub fn with_field(mut self, instrument: &str, field: &str, field_type: &str, is_file: bool) -> Self {
        self.instruments.entry(instrument.to_owned()).or_default().fields.insert(
            field.to_owned(),
            FieldInfo { field_type: field_type.to_owned(), is_file, description: None },
        );
        self
    }

    /// Adds a document; `data` is expected to be a JSON object.
    pub fn with_document(mut self, instrument: &str, subject: &str, visit: &str, data: Value) -> Self {
        let documents = &mut self.instruments.entry(instrument.to_owned()).or_default().documents;
        let data = match data {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        documents.push(DatasetDocument {
            id: format!("{}_{}_{}", instrument, subject, visit),
            subject: subject.to_owned(),
            visit: visit.to_owned(),
            data,
        });
        self
    }

    fn instrument(&self, instrument: &str) -> Result<&DatasetInstrument> {
        self.instruments
            .get(instrument)
            .ok_or_else(|| DqtError::NotFound(format!("instrument '{}'", instrument)))
    }

    /// Candidate subjects, falling back to every subject with a document.
    pub fn subjects(&self) -> Vec<String> {
        if !self.sessions.is_empty() {
            return self.sessions.clone();
        }
        let subjects: BTreeSet<&str> = self
            .instruments
            .values()
            .flat_map(|instrument| instrument.documents.iter().map(|document| document.subject.as_str()))
            .collect();
        subjects.into_iter().map(str::to_owned).collect()
    }
}

// ------------- Matching -------------
fn stored_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

// numeric when both sides parse as decimals, textual otherwise
fn compare(stored: &str, wanted: &str) -> Ordering {
    match (BigDecimal::from_str(stored.trim()), BigDecimal::from_str(wanted.trim())) {
        (Ok(stored), Ok(wanted)) => stored.cmp(&wanted),
        _ => stored.cmp(wanted),
    }
}

fn equals(stored: Option<&str>, wanted: &str) -> bool {
    match stored {
        // an empty value asks for documents where the field is not filled in
        None => wanted.is_empty(),
        Some(stored) if wanted.is_empty() => stored.is_empty(),
        Some(stored) => compare(stored, wanted) == Ordering::Equal,
    }
}

pub fn matches(path: LookupPath, stored: Option<&Value>, wanted: &str) -> bool {
    let stored = stored_text(stored);
    let stored = stored.as_deref();
    match path {
        LookupPath::Equal => equals(stored, wanted),
        LookupPath::NotEqual => !equals(stored, wanted),
        LookupPath::LessThanEqual => stored.is_some_and(|stored| compare(stored, wanted) != Ordering::Greater),
        LookupPath::GreaterThanEqual => stored.is_some_and(|stored| compare(stored, wanted) != Ordering::Less),
        LookupPath::StartsWith => stored.is_some_and(|stored| stored.starts_with(wanted)),
        LookupPath::Contains => stored.is_some_and(|stored| stored.contains(wanted)),
    }
}

// ------------- Backend -------------
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    dataset: Dataset,
}

impl MemoryBackend {
    pub fn new(dataset: Dataset) -> Self {
        Self { dataset }
    }
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }
}

#[async_trait]
impl FieldDictionary for MemoryBackend {
    async fn fields(&self, instrument: &str) -> Result<Vec<DictionaryEntry>> {
        let entries = self
            .dataset
            .instrument(instrument)?
            .fields
            .iter()
            .map(|(field, info)| DictionaryEntry { key: (instrument.to_owned(), field.clone()), value: info.clone() })
            .collect();
        Ok(entries)
    }

    async fn describe(&self, fields: &[FieldRef]) -> Result<Vec<DictionaryEntry>> {
        let entries = fields
            .iter()
            .filter_map(|field| {
                let info = self.dataset.instruments.get(&field.instrument)?.fields.get(&field.field)?;
                Some(DictionaryEntry { key: (field.instrument.clone(), field.field.clone()), value: info.clone() })
            })
            .collect();
        Ok(entries)
    }
}

#[async_trait]
impl SessionMatcher for MemoryBackend {
    async fn matching_sessions(&self, query: &MatchQuery) -> Result<Vec<(String, String)>> {
        let instrument = self.dataset.instrument(&query.instrument)?;
        let found: Vec<(String, String)> = instrument
            .documents
            .iter()
            .filter(|document| matches(query.path, document.data.get(&query.field), &query.value))
            .map(|document| (document.subject.clone(), document.visit.clone()))
            .collect();
        debug!(
            instrument = %query.instrument,
            field = %query.field,
            path = query.path.name(),
            found = found.len(),
            "session match"
        );
        Ok(found)
    }
}

#[async_trait]
impl DocumentSource for MemoryBackend {
    async fn retrieve(&self, instrument: &str, sessions: &[SessionVisit]) -> Result<Vec<DocumentRow>> {
        let documents = &self
            .dataset
            .instruments
            .get(instrument)
            .ok_or_else(|| DqtError::Retrieval {
                instrument: instrument.to_owned(),
                message: "unknown instrument".to_owned(),
            })?
            .documents;
        let rows = sessions
            .iter()
            .filter_map(|session| {
                let document = documents
                    .iter()
                    .find(|document| document.subject == session.subject() && document.visit == session.visit())?;
                Some(DocumentRow {
                    key: (instrument.to_owned(), document.subject.clone(), document.visit.clone()),
                    value: RowValue::Key(format!("{},{}", document.subject, document.visit)),
                    doc: InstrumentDocument { id: document.id.clone(), data: document.data.clone() },
                })
            })
            .collect();
        Ok(rows)
    }
}

#[async_trait]
impl StudyCatalog for MemoryBackend {
    async fn setup(&self) -> Result<StudySetup> {
        let categories = self
            .dataset
            .instruments
            .iter()
            .map(|(name, instrument)| Category { category: name.clone(), num_fields: instrument.fields.len() })
            .collect();
        Ok(StudySetup { visits: self.dataset.visits.clone(), categories, updated: self.dataset.updated })
    }

    async fn sessions(&self) -> Result<Vec<String>> {
        Ok(self.dataset.subjects())
    }
}

// ------------- Saved queries -------------
/// Saved queries kept in process memory. Names are unique across both scopes.
#[derive(Debug, Default)]
pub struct MemoryQueryStore {
    documents: Mutex<BTreeMap<String, Value>>,
    next_id: AtomicU64,
}

impl MemoryQueryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a raw document as is, e.g. one saved under the legacy schema.
    pub fn insert(&self, id: &str, document: Value) -> Result<()> {
        self.lock()?.insert(id.to_owned(), document);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>> {
        self.documents
            .lock()
            .map_err(|_| DqtError::Persistence("saved query store lock poisoned".to_owned()))
    }
}

#[async_trait]
impl SavedQueryStore for MemoryQueryStore {
    async fn list(&self) -> Result<SavedQueryIds> {
        let documents = self.lock()?;
        let mut ids = SavedQueryIds::default();
        for (id, document) in documents.iter() {
            let shared = document.pointer("/Meta/shared").and_then(Value::as_bool).unwrap_or(false);
            if shared {
                ids.shared.push(id.clone());
            } else {
                ids.user.push(id.clone());
            }
        }
        Ok(ids)
    }

    async fn fetch(&self, id: &str) -> Result<Value> {
        self.lock()?
            .get(id)
            .cloned()
            .ok_or_else(|| DqtError::NotFound(format!("saved query '{}'", id)))
    }

    async fn save(&self, request: SaveRequest) -> Result<String> {
        let mut documents = self.lock()?;
        let existing = documents
            .iter()
            .find(|(_, document)| document.pointer("/Meta/name").and_then(Value::as_str) == Some(request.name.as_str()))
            .map(|(id, _)| id.clone());
        let id = match existing {
            Some(_) if !request.overwrite => return Err(DqtError::SaveConflict { name: request.name }),
            Some(id) => id,
            None => format!("query-{}", self.next_id.fetch_add(1, AtomicOrdering::SeqCst) + 1),
        };
        let document = saved::document(&id, &request.name, request.shared, request.fields, request.filter);
        documents.insert(id.clone(), document);
        Ok(id)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.lock()?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DqtError::NotFound(format!("saved query '{}'", id)))
    }
}
