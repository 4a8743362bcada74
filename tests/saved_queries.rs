mod common;

use std::sync::Arc;

use common::{backend, services, subjects};
use dqt::error::DqtError;
use dqt::filter::{FilterNode, FilterTree, Group, GroupOperator, NodePath, Rule, RuleOperator, VisitFilter};
use dqt::interface::QueryInterface;
use dqt::memory::MemoryQueryStore;
use dqt::saved::{self, QueryScope};
use dqt::selection::VisitAction;
use dqt::services::{FieldRef, SavedQueryStore};
use serde_json::json;

fn study_visits() -> Vec<String> {
    vec!["V1".into(), "V2".into(), "V3".into()]
}

async fn interface_with(store: Arc<MemoryQueryStore>) -> QueryInterface {
    let mut wired = services(backend());
    wired.queries = store;
    QueryInterface::open(wired).await.expect("open")
}

fn rule_at(tree: &FilterTree, path: &[usize]) -> Rule {
    match tree.node(&NodePath(path.to_vec())).expect("node") {
        FilterNode::Rule(rule) => rule.clone(),
        other => panic!("expected a rule, got {:?}", other),
    }
}

#[test]
fn legacy_criteria_become_an_and_group() {
    let (tree, selection) = saved::decode(
        &json!(["A,f1"]),
        &json!([{ "Field": "A,f1", "Operator": "=", "Value": "x" }]),
        &study_visits(),
    )
    .expect("decode legacy");
    assert_eq!(tree.root().operator, GroupOperator::And);
    assert_eq!(tree.root().children.len(), 1);
    let rule = rule_at(&tree, &[0]);
    assert_eq!(rule.instrument, "A");
    assert_eq!(rule.field, "f1");
    assert_eq!(rule.operator, Some(RuleOperator::Equal));
    assert_eq!(rule.value, "x");
    assert_eq!(rule.visit, VisitFilter::All);

    // legacy fields ask for every visit of the study
    let selected = selection.instrument("A").expect("instrument A");
    assert_eq!(selected.all_visits().len(), 3);
    assert!(selected.all_visits().values().all(|count| *count == 1));
}

#[test]
fn legacy_numbers_and_symbols() {
    let (tree, _) = saved::decode(
        &json!([]),
        &json!([
            { "Field": "A,f1", "Operator": ">=", "Value": 7 },
            { "Field": "A,f2", "Operator": "startsWith", "Value": "al" },
        ]),
        &study_visits(),
    )
    .expect("decode legacy");
    let first = rule_at(&tree, &[0]);
    assert_eq!(first.operator, Some(RuleOperator::GreaterThanEqual));
    assert_eq!(first.value, "7");
    assert_eq!(rule_at(&tree, &[1]).operator, Some(RuleOperator::StartsWith));
}

#[test]
fn untyped_nodes_are_told_apart_by_children() {
    let criteria = json!({
        "activeOperator": 1,
        "children": [
            { "instrument": "A", "field": "f1", "operator": "equal", "value": "5", "visit": "V1" },
            { "activeOperator": "0", "children": [
                { "instrument": "A", "field": "f2", "operator": "contains", "value": "et" }
            ] }
        ]
    });
    let (tree, _) = saved::decode(&json!(null), &criteria, &study_visits()).expect("decode");
    assert_eq!(tree.root().operator, GroupOperator::Or);
    assert_eq!(rule_at(&tree, &[0]).visit, VisitFilter::Only("V1".into()));
    match tree.node(&NodePath(vec![1])).expect("nested") {
        FilterNode::Group(group) => assert_eq!(group.operator, GroupOperator::And),
        other => panic!("expected a group, got {:?}", other),
    }
    assert_eq!(rule_at(&tree, &[1, 0]).operator, Some(RuleOperator::Contains));
}

#[test]
fn explicit_types_win() {
    let criteria = json!({
        "type": "group",
        "operator": "or",
        "children": [
            { "type": "group", "activeOperator": 0, "children": [] },
            { "type": "rule", "instrument": "B", "field": "f1", "operator": "isNull" }
        ]
    });
    let (tree, _) = saved::decode(&json!(null), &criteria, &study_visits()).expect("decode");
    assert_eq!(tree.root().operator, GroupOperator::Or);
    assert!(matches!(tree.node(&NodePath(vec![0])), Ok(FilterNode::Group(_))));
    assert_eq!(rule_at(&tree, &[1]).operator, Some(RuleOperator::IsNull));
}

#[test]
fn empty_criteria_leave_one_empty_rule() {
    let (tree, selection) = saved::decode(&json!(null), &json!(null), &study_visits()).expect("decode");
    assert_eq!(tree.root().children, vec![FilterNode::Rule(Rule::default())]);
    assert!(selection.is_empty());
}

#[test]
fn stored_tally_is_recounted() {
    let fields = json!({ "A": { "f1": { "V1": "V1", "V2": "V2" }, "f2": { "V2": "V2" }, "allVisits": { "V1": 5 } } });
    let (_, selection) = saved::decode(&fields, &json!(null), &study_visits()).expect("decode");
    let tally = selection.instrument("A").expect("instrument A").all_visits();
    assert_eq!(tally.get("V1"), Some(&1));
    assert_eq!(tally.get("V2"), Some(&2));
}

#[test]
fn fields_may_arrive_json_encoded() {
    let encoded = json!("[\"A,f1\",\"B,f1\"]");
    let (_, selection) = saved::decode(&encoded, &json!([]), &study_visits()).expect("decode");
    assert!(selection.contains(&FieldRef::new("B", "f1")));
}

#[test]
fn malformed_payloads_are_parse_failures() {
    let cases = [
        (json!(["A,f1"]), json!(42)),
        (json!(["A"]), json!([])),
        (json!([]), json!([{ "Field": "A,f1", "Operator": "~", "Value": "x" }])),
        (json!([]), json!({ "activeOperator": 3, "children": [] })),
        (json!([]), json!({ "children": [{ "type": "leaf" }] })),
        (json!({ "A": { "f1": 1 } }), json!([])),
    ];
    for (fields, criteria) in cases {
        let result = saved::decode(&fields, &criteria, &study_visits());
        assert!(matches!(result, Err(DqtError::Parse { .. })), "{} / {}", fields, criteria);
    }
}

#[tokio::test]
async fn failed_load_keeps_the_workspace() {
    let query = interface_with(Arc::new(MemoryQueryStore::new())).await;
    query.toggle_field("A", "f1", false).await;
    let before = query.selection().await;
    let result = query.load_saved_query(&json!(["B,f1"]), &json!("junk")).await;
    assert!(matches!(result, Err(DqtError::Parse { .. })));
    assert_eq!(query.selection().await, before);
}

#[tokio::test]
async fn load_resolves_the_filter() {
    let query = interface_with(Arc::new(MemoryQueryStore::new())).await;
    let (tree, selection) = query
        .load_saved_query(&json!(["A,f1", "B,scan"]), &json!([{ "Field": "A,f1", "Operator": ">=", "Value": "7" }]))
        .await
        .expect("load");
    assert_eq!(tree.resolved_sessions(), Some(&subjects(&["S1", "S2"])));
    assert!(selection.is_downloadable(&FieldRef::new("B", "scan")));
    assert!(!selection.is_downloadable(&FieldRef::new("A", "f1")));
    assert_eq!(query.filter().await, tree);
}

#[tokio::test]
async fn save_round_trips_the_current_schema() {
    let store = Arc::new(MemoryQueryStore::new());
    let query = interface_with(store.clone()).await;
    let root = Group::new(GroupOperator::Or)
        .with_child(Rule::new("A", "f1", RuleOperator::Equal, "5").with_visit("V1"))
        .with_child(Group::new(GroupOperator::And).with_child(Rule::new("B", "f1", RuleOperator::IsNotNull, "")));
    query.submit_filter(FilterTree::from_root(root)).await;
    query.toggle_field("A", "f1", false).await;
    query.toggle_field("A", "f2", false).await;
    query
        .field_visit_select(VisitAction::Check, "V3", &FieldRef::new("A", "f2"))
        .await
        .expect("check V3");

    let id = query.save_current_query("mine", false, false).await.expect("save");
    let stored = store.fetch(&id).await.expect("fetch");
    assert_eq!(stored["Conditions"]["type"], "group");
    assert_eq!(stored["Conditions"]["activeOperator"], 1);
    assert_eq!(stored["Fields"]["A"]["allVisits"], json!({ "V1": 2, "V3": 1 }));

    let decoded = saved::decode_document(&stored, &study_visits()).expect("decode");
    assert_eq!(decoded.name, "mine");
    assert_eq!(decoded.scope, QueryScope::User);
    let mut current = query.filter().await;
    current.root_mut().clear_resolution();
    assert_eq!(decoded.filter, current);
    assert_eq!(decoded.selection.instruments(), query.selection().await.instruments());
}

#[tokio::test]
async fn duplicate_names_need_overwrite() {
    let store = Arc::new(MemoryQueryStore::new());
    let query = interface_with(store.clone()).await;
    query.toggle_field("A", "f1", false).await;
    let id = query.save_current_query("q1", true, false).await.expect("first save");

    query.toggle_field("B", "f1", false).await;
    let conflict = query.save_current_query("q1", false, false).await;
    assert!(matches!(conflict, Err(DqtError::SaveConflict { ref name }) if name == "q1"));
    let unchanged = store.fetch(&id).await.expect("fetch");
    assert!(unchanged["Fields"].get("B").is_none());

    let again = query.save_current_query("q1", false, true).await.expect("overwrite");
    assert_eq!(again, id);
    let replaced = store.fetch(&id).await.expect("fetch");
    assert!(replaced["Fields"].get("B").is_some());
}

#[tokio::test]
async fn listing_skips_unreadable_queries() {
    let store = Arc::new(MemoryQueryStore::new());
    let query = interface_with(store.clone()).await;
    query.save_current_query("mine", false, false).await.expect("save user");
    query.save_current_query("ours", true, false).await.expect("save shared");
    store.insert("broken", json!("not a query")).expect("insert");

    let mut names: Vec<(String, QueryScope)> = query
        .saved_queries()
        .await
        .expect("list")
        .into_iter()
        .map(|summary| (summary.name, summary.scope))
        .collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(names, vec![("mine".to_string(), QueryScope::User), ("ours".to_string(), QueryScope::Shared)]);
}

#[tokio::test]
async fn load_by_id_restores_selection_and_downloads() {
    let store = Arc::new(MemoryQueryStore::new());
    let query = interface_with(store.clone()).await;
    query.toggle_field("B", "scan", false).await;
    query
        .replace_rule(&NodePath(vec![0]), Rule::new("B", "f1", RuleOperator::LessThanEqual, "2"))
        .await
        .expect("rule");
    let id = query.save_current_query("scans", false, false).await.expect("save");

    query.reset_query().await;
    assert!(query.selection().await.is_empty());

    let loaded = query.load_saved_query_by_id(&id).await.expect("load");
    assert_eq!(loaded.name, "scans");
    assert!(loaded.selection.is_downloadable(&FieldRef::new("B", "scan")));
    assert_eq!(loaded.filter.resolved_sessions(), Some(&subjects(&["S1"])));

    let missing = query.load_saved_query_by_id("nope").await;
    assert!(matches!(missing, Err(DqtError::NotFound(_))));

    query.delete_saved_query(&id).await.expect("delete");
    assert!(query.saved_queries().await.expect("list").is_empty());
}

#[tokio::test]
async fn legacy_documents_load_from_the_store() {
    let store = Arc::new(MemoryQueryStore::new());
    store
        .insert(
            "old",
            json!({
                "_id": "old",
                "Meta": { "name": "old style", "shared": true },
                "Fields": ["A,f1"],
                "Conditions": [{ "Field": "A,f2", "Operator": "=", "Value": "beta" }]
            }),
        )
        .expect("insert");
    let query = interface_with(store).await;
    let loaded = query.load_saved_query_by_id("old").await.expect("load");
    assert_eq!(loaded.scope, QueryScope::Shared);
    assert_eq!(loaded.filter.resolved_sessions(), Some(&subjects(&["S2"])));
    let projection = query.run_current_query().await.expect("run");
    // every visit was asked for; S2 only has V1
    assert_eq!(projection.row_identifiers, vec!["S2,V1"]);
}
