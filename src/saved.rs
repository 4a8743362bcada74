//! Saved-query payloads.
//!
//! Two schemas are in circulation. The legacy one stores fields as a flat list of
//! `"instrument,field"` strings and the filter as a flat list of criteria
//! `{Field, Operator, Value}`. The current one stores the per-instrument field
//! selection (with its `allVisits` tally) and the filter as a group tree.
//! Both decode into a [`FilterTree`] plus a [`FieldSelection`]; encoding always
//! writes the current schema, with an explicit `type` on every filter node.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::error::{DqtError, Result};
use crate::filter::{FilterNode, FilterTree, Group, GroupOperator, Rule, RuleOperator, VisitFilter};
use crate::selection::FieldSelection;
use crate::services::FieldRef;

const ALL_VISITS_KEY: &str = "allVisits";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryScope {
    #[default]
    User,
    Shared,
}

impl QueryScope {
    pub fn from_shared(shared: bool) -> Self {
        if shared { QueryScope::Shared } else { QueryScope::User }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedQuery {
    pub id: String,
    pub name: String,
    pub scope: QueryScope,
    pub filter: FilterTree,
    pub selection: FieldSelection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedQuerySummary {
    pub id: String,
    pub name: String,
    pub scope: QueryScope,
}

#[derive(Debug, Default, Deserialize)]
struct StoredMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    shared: bool,
}

#[derive(Debug, Deserialize)]
struct StoredDocument {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(rename = "Meta", default)]
    meta: StoredMeta,
    #[serde(rename = "Fields", default)]
    fields: Value,
    #[serde(rename = "Conditions", default)]
    conditions: Value,
}

#[derive(Debug, Deserialize)]
struct LegacyCriterion {
    #[serde(rename = "Field")]
    field: String,
    #[serde(rename = "Operator")]
    operator: String,
    #[serde(rename = "Value", default)]
    value: Value,
}

/// The stored document layout: `{_id, Meta: {name, shared}, Fields, Conditions}`.
pub fn document(id: &str, name: &str, shared: bool, fields: Value, filter: Value) -> Value {
    json!({
        "_id": id,
        "Meta": { "name": name, "shared": shared },
        "Fields": fields,
        "Conditions": filter,
    })
}

pub fn summarize(document: &Value) -> Result<SavedQuerySummary> {
    let stored: StoredDocument = serde_json::from_value(document.clone())?;
    Ok(SavedQuerySummary { id: stored.id, name: stored.meta.name, scope: QueryScope::from_shared(stored.meta.shared) })
}

pub fn decode_document(document: &Value, visits: &[String]) -> Result<SavedQuery> {
    let stored: StoredDocument = serde_json::from_value(document.clone())?;
    let (filter, selection) = decode(&stored.fields, &stored.conditions, visits)?;
    Ok(SavedQuery {
        id: stored.id,
        name: stored.meta.name,
        scope: QueryScope::from_shared(stored.meta.shared),
        filter,
        selection,
    })
}

// ------------- Decoding -------------
/// Decodes the fields and criteria of a saved query, in either schema. `visits` is
/// the study's visit list; legacy fields ask for all of them.
pub fn decode(fields: &Value, criteria: &Value, visits: &[String]) -> Result<(FilterTree, FieldSelection)> {
    let selection = decode_fields(fields, visits)?;
    let mut root = match criteria {
        Value::Array(items) => decode_legacy_criteria(items)?,
        Value::Object(object) => decode_group(object)?,
        Value::Null => Group::new(GroupOperator::And),
        other => return Err(DqtError::parse(format!("unexpected criteria payload: {}", other))),
    };
    if root.children.is_empty() {
        root.children.push(FilterNode::Rule(Rule::default()));
    }
    Ok((FilterTree::from_root(root), selection))
}

fn decode_fields(fields: &Value, visits: &[String]) -> Result<FieldSelection> {
    match fields {
        Value::Null => Ok(FieldSelection::new()),
        Value::Array(_) => {
            let list: Vec<FieldRef> = serde_json::from_value(fields.clone())?;
            Ok(FieldSelection::from_field_list(&list, visits))
        }
        Value::Object(instruments) => decode_selection(instruments),
        // fields are sometimes posted as a JSON encoded string
        Value::String(encoded) => decode_fields(&serde_json::from_str(encoded)?, visits),
        other => Err(DqtError::parse(format!("unexpected fields payload: {}", other))),
    }
}

fn decode_selection(instruments: &Map<String, Value>) -> Result<FieldSelection> {
    let mut selection = FieldSelection::new();
    for (instrument, entry) in instruments {
        let entry = entry
            .as_object()
            .ok_or_else(|| DqtError::parse(format!("instrument '{}' is not an object", instrument)))?;
        for (field, visits) in entry {
            if field == ALL_VISITS_KEY {
                continue;
            }
            let visits: Vec<String> = match visits {
                Value::Object(marked) => marked.keys().cloned().collect(),
                Value::Array(listed) => listed.iter().filter_map(Value::as_str).map(str::to_owned).collect(),
                _ => return Err(DqtError::parse(format!("visits of {},{} are malformed", instrument, field))),
            };
            selection.insert(FieldRef::new(instrument, field), visits);
        }
        if let (Some(stored), Some(selected)) = (entry.get(ALL_VISITS_KEY), selection.instrument(instrument)) {
            let counted = serde_json::to_value(selected.all_visits())?;
            if stored != &counted {
                warn!(%instrument, "stored visit tally disagrees with the field visits, using the recount");
            }
        }
    }
    Ok(selection)
}

fn decode_legacy_criteria(items: &[Value]) -> Result<Group> {
    let mut group = Group::new(GroupOperator::And);
    for item in items {
        let criterion: LegacyCriterion = serde_json::from_value(item.clone())?;
        let field: FieldRef = criterion.field.parse()?;
        let rule = Rule {
            instrument: field.instrument,
            field: field.field,
            operator: Some(RuleOperator::from_legacy(&criterion.operator)?),
            value: scalar_text(&criterion.value),
            visit: VisitFilter::All,
            ..Rule::default()
        };
        group.children.push(FilterNode::Rule(rule));
    }
    Ok(group)
}

fn decode_node(value: &Value) -> Result<FilterNode> {
    let object = value
        .as_object()
        .ok_or_else(|| DqtError::parse(format!("filter node is not an object: {}", value)))?;
    match object.get("type").and_then(Value::as_str) {
        Some("group") => Ok(FilterNode::Group(decode_group(object)?)),
        Some("rule") => Ok(FilterNode::Rule(decode_rule(object)?)),
        Some(other) => Err(DqtError::parse(format!("unknown filter node type '{}'", other))),
        // untyped nodes come from older saves: only groups carry children
        None if object.contains_key("children") => Ok(FilterNode::Group(decode_group(object)?)),
        None => Ok(FilterNode::Rule(decode_rule(object)?)),
    }
}

fn decode_group(object: &Map<String, Value>) -> Result<Group> {
    let operator = match (object.get("operator"), object.get("activeOperator")) {
        (Some(Value::String(name)), _) => match name.to_uppercase().as_str() {
            "AND" => GroupOperator::And,
            "OR" => GroupOperator::Or,
            _ => return Err(DqtError::parse(format!("unknown group operator '{}'", name))),
        },
        (_, Some(index)) => GroupOperator::from_index(operator_index(index)?)?,
        _ => GroupOperator::And,
    };
    let mut group = Group::new(operator);
    match object.get("children") {
        Some(Value::Array(children)) => {
            for child in children {
                group.children.push(decode_node(child)?);
            }
        }
        None | Some(Value::Null) => {}
        Some(other) => return Err(DqtError::parse(format!("group children are not a list: {}", other))),
    }
    Ok(group)
}

// form-posted saves carry the index as a string
fn operator_index(value: &Value) -> Result<u64> {
    let index = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    index.ok_or_else(|| DqtError::parse(format!("bad group operator index {}", value)))
}

fn decode_rule(object: &Map<String, Value>) -> Result<Rule> {
    let text = |key: &str| object.get(key).map(scalar_text).unwrap_or_default();
    let operator = match text("operator") {
        name if name.is_empty() => None,
        name => Some(name.parse::<RuleOperator>()?),
    };
    Ok(Rule {
        instrument: text("instrument"),
        field: text("field"),
        operator,
        value: text("value"),
        visit: VisitFilter::from(text("visit")),
        ..Rule::default()
    })
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ------------- Encoding -------------
pub fn encode_fields(selection: &FieldSelection) -> Value {
    let mut instruments = Map::new();
    for (instrument, selected) in selection.instruments() {
        let mut entry = Map::new();
        for (field, visits) in selected.fields() {
            let marked: Map<String, Value> = visits.iter().map(|visit| (visit.clone(), json!(visit))).collect();
            entry.insert(field.clone(), Value::Object(marked));
        }
        let tally: Map<String, Value> = selected.all_visits().iter().map(|(visit, count)| (visit.clone(), json!(count))).collect();
        entry.insert(ALL_VISITS_KEY.to_owned(), Value::Object(tally));
        instruments.insert(instrument.clone(), Value::Object(entry));
    }
    Value::Object(instruments)
}

pub fn encode_filter(tree: &FilterTree) -> Value {
    encode_group(tree.root())
}

fn encode_group(group: &Group) -> Value {
    let children: Vec<Value> = group
        .children
        .iter()
        .map(|child| match child {
            FilterNode::Group(nested) => encode_group(nested),
            FilterNode::Rule(rule) => json!({
                "type": "rule",
                "instrument": rule.instrument,
                "field": rule.field,
                "operator": rule.operator.map(|operator| operator.name()).unwrap_or_default(),
                "value": rule.value,
                "visit": String::from(rule.visit.clone()),
            }),
        })
        .collect();
    json!({
        "type": "group",
        "activeOperator": group.operator.index(),
        "children": children,
    })
}
