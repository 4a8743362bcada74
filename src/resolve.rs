use std::collections::{BTreeSet, HashMap};
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use seahash::SeaHasher;
use tracing::{debug, warn};

use crate::error::{DqtError, Result};
use crate::filter::{Rule, Session, SessionSet, VisitFilter};
use crate::services::{DictionaryEntry, FieldDictionary, MatchQuery, SessionMatcher};

// instrument names are short strings, a fast non-cryptographic hash is plenty
pub type LookupHasher = BuildHasherDefault<SeaHasher>;

// ------------- Rule resolution -------------
/// Resolves leaf rules to the sessions they match.
///
/// The field dictionary of an instrument is fetched the first time a rule on that
/// instrument is resolved and kept for the lifetime of the resolver.
pub struct RuleResolver {
    dictionary: Arc<dyn FieldDictionary>,
    matcher: Arc<dyn SessionMatcher>,
    fields: HashMap<String, Arc<Vec<DictionaryEntry>>, LookupHasher>,
}

impl RuleResolver {
    pub fn new(dictionary: Arc<dyn FieldDictionary>, matcher: Arc<dyn SessionMatcher>) -> Self {
        Self { dictionary, matcher, fields: HashMap::default() }
    }

    pub async fn dictionary(&mut self, instrument: &str) -> Result<Arc<Vec<DictionaryEntry>>> {
        if let Some(entries) = self.fields.get(instrument) {
            return Ok(Arc::clone(entries));
        }
        let entries = Arc::new(self.dictionary.fields(instrument).await.map_err(|e| lookup_failure(instrument, e))?);
        self.fields.insert(instrument.to_owned(), Arc::clone(&entries));
        Ok(entries)
    }

    /// Fills in the rule's field type and resolved sessions. A visit without any
    /// matches resolves to the empty set; a failing lookup is returned as is and
    /// leaves the rule untouched.
    pub async fn resolve(&mut self, rule: &mut Rule) -> Result<()> {
        let operator = rule
            .operator
            .ok_or_else(|| DqtError::parse(format!("rule on {},{} has no operator", rule.instrument, rule.field)))?;
        let entries = self.dictionary(&rule.instrument).await?;
        let field_type = entries
            .iter()
            .find(|entry| entry.key.1 == rule.field)
            .map(|entry| entry.value.field_type.clone());
        if field_type.is_none() {
            warn!(instrument = %rule.instrument, field = %rule.field, "field missing from the dictionary");
        }
        let query = MatchQuery {
            instrument: rule.instrument.clone(),
            field: rule.field.clone(),
            value: if operator.is_null_check() { String::new() } else { rule.value.clone() },
            path: operator.lookup_path(),
        };
        let matches = self
            .matcher
            .matching_sessions(&query)
            .await
            .map_err(|e| lookup_failure(&rule.instrument, e))?;
        let sessions = sessions_for_visit(&matches, &rule.visit);
        debug!(
            instrument = %rule.instrument,
            field = %rule.field,
            operator = %operator,
            lookup = query.path.name(),
            matches = matches.len(),
            sessions = sessions.len(),
            "rule resolved"
        );
        rule.field_type = field_type;
        rule.resolved_sessions = Some(sessions);
        rule.failure = None;
        Ok(())
    }
}

fn lookup_failure(instrument: &str, e: DqtError) -> DqtError {
    match e {
        DqtError::Lookup { .. } => e,
        other => DqtError::Lookup { instrument: instrument.to_owned(), message: other.to_string() },
    }
}

/// Subjects matched at the requested visit, or at any visit for `All`.
pub fn sessions_for_visit(matches: &[(String, String)], visit: &VisitFilter) -> SessionSet {
    let subjects: BTreeSet<&String> = match visit {
        VisitFilter::All => matches.iter().map(|(subject, _)| subject).collect(),
        VisitFilter::Only(wanted) => matches
            .iter()
            .filter(|(_, visit)| visit == wanted)
            .map(|(subject, _)| subject)
            .collect(),
    };
    subjects.into_iter().map(|subject| Session::Subject(subject.clone())).collect()
}
