//! Output fields chosen for a query, per instrument and per visit.
//!
//! Each selected instrument keeps, besides its fields, an `allVisits` tally: for
//! every visit, the number of the instrument's fields that ask for it. Retrieval
//! only looks at the tally, so removing one field must not drop a visit that
//! another field of the same instrument still wants.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{DqtError, Result};
use crate::services::FieldRef;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentSelection {
    fields: BTreeMap<String, BTreeSet<String>>,
    all_visits: BTreeMap<String, u32>,
}

impl InstrumentSelection {
    pub fn fields(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.fields
    }
    pub fn all_visits(&self) -> &BTreeMap<String, u32> {
        &self.all_visits
    }
    pub fn visits_of(&self, field: &str) -> Option<&BTreeSet<String>> {
        self.fields.get(field)
    }
    pub fn has_visit(&self, field: &str, visit: &str) -> bool {
        self.fields.get(field).is_some_and(|visits| visits.contains(visit))
    }
}

fn retain_visit(all_visits: &mut BTreeMap<String, u32>, visit: &str) {
    *all_visits.entry(visit.to_owned()).or_insert(0) += 1;
}

fn release_visit(all_visits: &mut BTreeMap<String, u32>, visit: &str) {
    if let Some(count) = all_visits.get_mut(visit) {
        *count -= 1;
        if *count == 0 {
            all_visits.remove(visit);
        }
    }
}

// ------------- Selection -------------
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelection {
    instruments: BTreeMap<String, InstrumentSelection>,
    // selection order, retrieval walks instruments in this order
    fields: Vec<FieldRef>,
    downloadable: BTreeSet<FieldRef>,
}

impl FieldSelection {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn instruments(&self) -> &BTreeMap<String, InstrumentSelection> {
        &self.instruments
    }
    pub fn instrument(&self, instrument: &str) -> Option<&InstrumentSelection> {
        self.instruments.get(instrument)
    }
    pub fn fields(&self) -> &[FieldRef] {
        &self.fields
    }
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
    pub fn contains(&self, field: &FieldRef) -> bool {
        self.instruments
            .get(&field.instrument)
            .is_some_and(|selected| selected.fields.contains_key(&field.field))
    }
    pub fn has_visit(&self, field: &FieldRef, visit: &str) -> bool {
        self.instruments
            .get(&field.instrument)
            .is_some_and(|selected| selected.has_visit(&field.field, visit))
    }
    pub fn is_downloadable(&self, field: &FieldRef) -> bool {
        self.downloadable.contains(field)
    }
    pub fn downloadable(&self) -> &BTreeSet<FieldRef> {
        &self.downloadable
    }
    pub fn mark_downloadable(&mut self, field: FieldRef) {
        if self.contains(&field) {
            self.downloadable.insert(field);
        }
    }

    /// Adds a field asking for the given visits. Visits already held by the field are
    /// not counted twice.
    pub fn insert(&mut self, field: FieldRef, visits: impl IntoIterator<Item = String>) {
        let selected = self.instruments.entry(field.instrument.clone()).or_default();
        let held = selected.fields.entry(field.field.clone()).or_default();
        for visit in visits {
            if held.insert(visit.clone()) {
                retain_visit(&mut selected.all_visits, &visit);
            }
        }
        if !self.fields.contains(&field) {
            self.fields.push(field);
        }
    }

    /// Selection as saved by old queries: every listed field asks for every visit.
    pub fn from_field_list(fields: &[FieldRef], visits: &[String]) -> Self {
        let mut selection = Self::new();
        for field in fields {
            selection.insert(field.clone(), visits.iter().cloned());
        }
        selection
    }
}

// ------------- Model -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitAction {
    Check,
    Uncheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    Added,
    Removed,
}

/// Edits a [`FieldSelection`] against the study's ordered visit list.
#[derive(Debug, Clone, Default)]
pub struct FieldSelectionModel {
    visits: Vec<String>,
    selection: FieldSelection,
}

impl FieldSelectionModel {
    pub fn new(visits: Vec<String>) -> Self {
        Self { visits, selection: FieldSelection::new() }
    }
    pub fn visits(&self) -> &[String] {
        &self.visits
    }
    pub fn selection(&self) -> &FieldSelection {
        &self.selection
    }
    pub fn selection_mut(&mut self) -> &mut FieldSelection {
        &mut self.selection
    }
    pub fn replace(&mut self, selection: FieldSelection) {
        self.selection = selection;
    }
    pub fn reset(&mut self) {
        self.selection = FieldSelection::new();
    }

    /// Adds the field when it is not selected and removes it when it is.
    ///
    /// A field of a newly selected instrument starts out with the first known visit
    /// only; a field joining an instrument that is already selected takes over every
    /// visit the instrument currently asks for.
    pub fn toggle(&mut self, instrument: &str, field: &str, downloadable: bool) -> Toggle {
        let field_ref = FieldRef::new(instrument, field);
        let selection = &mut self.selection;
        match selection.instruments.get_mut(instrument) {
            Some(selected) if selected.fields.contains_key(field) => {
                if let Some(visits) = selected.fields.remove(field) {
                    for visit in &visits {
                        release_visit(&mut selected.all_visits, visit);
                    }
                }
                let emptied = selected.fields.is_empty();
                if emptied {
                    selection.instruments.remove(instrument);
                }
                selection.fields.retain(|selected| selected != &field_ref);
                selection.downloadable.remove(&field_ref);
                Toggle::Removed
            }
            Some(selected) => {
                let visits: Vec<String> = selected.all_visits.keys().cloned().collect();
                selection.insert(field_ref.clone(), visits);
                if downloadable {
                    selection.downloadable.insert(field_ref);
                }
                Toggle::Added
            }
            None => {
                let first = self.visits.first().cloned();
                selection.insert(field_ref.clone(), first);
                if downloadable {
                    selection.downloadable.insert(field_ref);
                }
                Toggle::Added
            }
        }
    }

    /// Checks or unchecks one visit of one already selected field.
    pub fn field_visit_select(&mut self, action: VisitAction, visit: &str, field: &FieldRef) -> Result<()> {
        let not_selected = || DqtError::NotSelected {
            instrument: field.instrument.clone(),
            field: field.field.clone(),
        };
        let selected = self.selection.instruments.get_mut(&field.instrument).ok_or_else(not_selected)?;
        let held = selected.fields.get_mut(&field.field).ok_or_else(not_selected)?;
        match action {
            VisitAction::Check => {
                if held.insert(visit.to_owned()) {
                    retain_visit(&mut selected.all_visits, visit);
                }
            }
            VisitAction::Uncheck => {
                if held.remove(visit) {
                    release_visit(&mut selected.all_visits, visit);
                }
            }
        }
        Ok(())
    }
}
