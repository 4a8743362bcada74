#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dqt::error::{DqtError, Result};
use dqt::filter::{Session, SessionSet};
use dqt::interface::QueryInterface;
use dqt::memory::{Dataset, MemoryBackend, MemoryQueryStore};
use dqt::project::BaseUrlLinks;
use dqt::services::{DocumentRow, DocumentSource, MatchQuery, SessionMatcher, SessionVisit, Services};
use serde_json::json;

/// Three visits, two instruments, three subjects.
///
/// * `A.f1` (int): S1 → 5 at V1, 7 at V2; S2 → 10 at V1; S3 → null at V1
/// * `A.f2` (varchar): S1 → "alpha" at V1; S2 → "beta" at V1
/// * `B.f1` (int): S1 → 1 at V1; S3 → 3 at V2
/// * `B.scan` (file): S1 → "scans/s1 v1.mnc" at V1
pub fn dataset() -> Dataset {
    Dataset::new(&["V1", "V2", "V3"])
        .with_field("A", "f1", "int", false)
        .with_field("A", "f2", "varchar(255)", false)
        .with_field("B", "f1", "int", false)
        .with_field("B", "scan", "varchar(255)", true)
        .with_document("A", "S1", "V1", json!({ "f1": 5, "f2": "alpha" }))
        .with_document("A", "S1", "V2", json!({ "f1": 7 }))
        .with_document("A", "S2", "V1", json!({ "f1": 10, "f2": "beta" }))
        .with_document("A", "S3", "V1", json!({ "f1": null }))
        .with_document("B", "S1", "V1", json!({ "f1": 1, "scan": "scans/s1 v1.mnc" }))
        .with_document("B", "S3", "V2", json!({ "f1": 3 }))
}

pub fn backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(dataset()))
}

pub fn services(backend: Arc<MemoryBackend>) -> Services {
    Services {
        dictionary: backend.clone(),
        matcher: backend.clone(),
        documents: backend.clone(),
        catalog: backend,
        queries: Arc::new(MemoryQueryStore::new()),
        links: Arc::new(BaseUrlLinks::new("http://localhost/").expect("base url")),
    }
}

pub async fn interface() -> QueryInterface {
    QueryInterface::open(services(backend())).await.expect("open interface")
}

pub fn subjects(ids: &[&str]) -> SessionSet {
    ids.iter().map(|id| Session::Subject(id.to_string())).collect()
}

pub fn visits(pairs: &[(&str, &str)]) -> SessionSet {
    pairs.iter().map(|(subject, visit)| Session::Visit(subject.to_string(), visit.to_string())).collect()
}

// ------------- Session matchers -------------
/// Counts lookups and fails every lookup on the listed instruments.
pub struct CountingMatcher {
    inner: Arc<MemoryBackend>,
    failing: BTreeSet<String>,
    pub calls: AtomicUsize,
}

impl CountingMatcher {
    pub fn new(inner: Arc<MemoryBackend>) -> Self {
        Self { inner, failing: BTreeSet::new(), calls: AtomicUsize::new(0) }
    }
    pub fn failing(mut self, instrument: &str) -> Self {
        self.failing.insert(instrument.to_owned());
        self
    }
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionMatcher for CountingMatcher {
    async fn matching_sessions(&self, query: &MatchQuery) -> Result<Vec<(String, String)>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&query.instrument) {
            return Err(DqtError::NotFound(format!("lookup {} unavailable", query.path.name())));
        }
        self.inner.matching_sessions(query).await
    }
}

// ------------- Document sources -------------
/// Records every request, optionally failing or delaying some instruments.
pub struct ScriptedSource {
    inner: Arc<MemoryBackend>,
    failing: BTreeSet<String>,
    panicking: BTreeSet<String>,
    delay: Option<Duration>,
    pub requests: Mutex<Vec<(String, Vec<SessionVisit>)>>,
}

impl ScriptedSource {
    pub fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            failing: BTreeSet::new(),
            panicking: BTreeSet::new(),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }
    pub fn failing(mut self, instrument: &str) -> Self {
        self.failing.insert(instrument.to_owned());
        self
    }
    pub fn panicking(mut self, instrument: &str) -> Self {
        self.panicking.insert(instrument.to_owned());
        self
    }
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
    pub fn requests(&self) -> Vec<(String, Vec<SessionVisit>)> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl DocumentSource for ScriptedSource {
    async fn retrieve(&self, instrument: &str, sessions: &[SessionVisit]) -> Result<Vec<DocumentRow>> {
        self.requests.lock().expect("requests lock").push((instrument.to_owned(), sessions.to_vec()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panicking.contains(instrument) {
            panic!("{} source crashed", instrument);
        }
        if self.failing.contains(instrument) {
            return Err(DqtError::Retrieval { instrument: instrument.to_owned(), message: "service down".into() });
        }
        self.inner.retrieve(instrument, sessions).await
    }
}
