use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::task::{self, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{DqtError, Result};
use crate::filter::{Session, SessionSet};
use crate::selection::FieldSelection;
use crate::services::{DocumentRow, DocumentSource, FieldRef, InstrumentDocument, SessionVisit};

/// Session key (`subject` or `subject,visit`) → instrument → document.
pub type SessionData = BTreeMap<String, BTreeMap<String, InstrumentDocument>>;

// ------------- Planning -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentRequest {
    pub instrument: String,
    pub sessions: Vec<SessionVisit>,
}

/// One request per distinct instrument, in the order instruments first appear in
/// `fields`. A bare subject asks for every visit the instrument's fields want; a
/// subject visit is only kept when that visit is wanted.
pub fn plan(fields: &[FieldRef], selection: &FieldSelection, sessions: &SessionSet) -> Vec<InstrumentRequest> {
    let mut requests: Vec<InstrumentRequest> = Vec::new();
    for field in fields {
        if requests.iter().any(|request| request.instrument == field.instrument) {
            continue;
        }
        let mut pairs = Vec::new();
        if let Some(selected) = selection.instrument(&field.instrument) {
            let visits = selected.all_visits();
            for session in sessions {
                match session {
                    Session::Subject(subject) => {
                        pairs.extend(visits.keys().map(|visit| SessionVisit::new(subject, visit)));
                    }
                    Session::Visit(subject, visit) => {
                        if visits.contains_key(visit) {
                            pairs.push(SessionVisit::new(subject, visit));
                        }
                    }
                }
            }
        }
        requests.push(InstrumentRequest { instrument: field.instrument.clone(), sessions: pairs });
    }
    requests
}

// ------------- Run context -------------
/// State owned by a single retrieval run. Nothing outside the run touches it until
/// the run hands it back. The run is complete once every issued request has been
/// answered; a failed or panicked request still counts as answered.
#[derive(Debug)]
pub struct RunContext {
    generation: u64,
    session_data: SessionData,
    outstanding: usize,
    answered: usize,
    failed: Vec<String>,
    discarded: usize,
}

impl RunContext {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            session_data: SessionData::new(),
            outstanding: 0,
            answered: 0,
            failed: Vec::new(),
            discarded: 0,
        }
    }
    pub fn generation(&self) -> u64 {
        self.generation
    }
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
    pub fn is_complete(&self) -> bool {
        self.outstanding == 0
    }
    fn issued(&mut self) {
        self.outstanding += 1;
    }
    fn answered(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.answered += 1;
    }
    /// Rows are keyed by their `value`; each row contributes its instrument's document.
    pub fn merge(&mut self, rows: Vec<DocumentRow>) {
        for row in rows {
            self.session_data
                .entry(row.value.identifier())
                .or_default()
                .insert(row.key.0, row.doc);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub generation: u64,
    pub session_data: SessionData,
    pub requests: usize,
    /// Requests counted as answered before the rows were handed back.
    pub answered: usize,
    /// Instruments whose request failed. They simply contribute no documents.
    pub failed: Vec<String>,
}

struct Response {
    generation: u64,
    instrument: String,
    result: Result<Vec<DocumentRow>>,
}

// ------------- Coordinator -------------
/// Fetches the documents of a query, one concurrent request per instrument.
///
/// Every run takes a new generation number. Responses tagged with any other
/// generation than the active one are dropped, and a run that was overtaken by a
/// newer one reports `DqtError::Superseded` instead of its data.
pub struct RetrievalCoordinator {
    source: Arc<dyn DocumentSource>,
    active: Arc<AtomicU64>,
}

impl RetrievalCoordinator {
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self { source, active: Arc::new(AtomicU64::new(0)) }
    }
    pub fn active_generation(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }
    /// Starts a new generation, superseding whatever run is still in flight.
    pub fn begin(&self) -> u64 {
        self.active.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn run(&self, fields: &[FieldRef], selection: &FieldSelection, sessions: &SessionSet) -> Result<RunOutcome> {
        let generation = self.begin();
        self.execute(generation, fields, selection, sessions).await
    }

    /// Runs the retrieval for a generation obtained from [`Self::begin`].
    pub async fn execute(
        &self,
        generation: u64,
        fields: &[FieldRef],
        selection: &FieldSelection,
        sessions: &SessionSet,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let requests = plan(fields, selection, sessions);
        let issued = requests.len();
        let mut context = RunContext::new(generation);
        let mut tasks = JoinSet::new();
        let mut instruments: HashMap<task::Id, String> = HashMap::new();
        for request in requests {
            context.issued();
            debug!(generation, instrument = %request.instrument, sessions = request.sessions.len(), "retrieval issued");
            let source = Arc::clone(&self.source);
            let instrument = request.instrument.clone();
            let handle = tasks.spawn(async move {
                let result = source.retrieve(&request.instrument, &request.sessions).await;
                Response { generation, instrument: request.instrument, result }
            });
            instruments.insert(handle.id(), instrument);
        }
        while !context.is_complete() {
            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            context.answered();
            match joined {
                Ok((_, response)) => self.accept(&mut context, response),
                Err(e) => {
                    let instrument = instruments.remove(&e.id()).unwrap_or_default();
                    warn!(generation, %instrument, error = %e, "retrieval task did not finish");
                    if self.active_generation() == generation {
                        context.failed.push(instrument);
                    }
                }
            }
        }
        if self.active_generation() != generation {
            info!(generation, discarded = context.discarded, "retrieval superseded");
            return Err(DqtError::Superseded { generation });
        }
        info!(
            generation,
            requests = issued,
            sessions = context.session_data.len(),
            failed = context.failed.len(),
            ms = started.elapsed().as_secs_f64() * 1000.0,
            "retrieval complete"
        );
        Ok(RunOutcome {
            generation,
            session_data: context.session_data,
            requests: issued,
            answered: context.answered,
            failed: context.failed,
        })
    }

    fn accept(&self, context: &mut RunContext, response: Response) {
        if response.generation != self.active_generation() {
            context.discarded += 1;
            info!(generation = response.generation, instrument = %response.instrument, "late response discarded");
            return;
        }
        match response.result {
            Ok(rows) => {
                debug!(generation = response.generation, instrument = %response.instrument, rows = rows.len(), "retrieval answered");
                context.merge(rows);
            }
            Err(e) => {
                warn!(generation = response.generation, instrument = %response.instrument, error = %e, "retrieval failed");
                context.failed.push(response.instrument);
            }
        }
    }
}
