mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedSource, backend, services, subjects, visits};
use dqt::error::DqtError;
use dqt::filter::{FilterTree, Group, GroupOperator, Rule, RuleOperator, Session};
use dqt::interface::QueryInterface;
use dqt::retrieve::{RetrievalCoordinator, plan};
use dqt::selection::FieldSelection;
use dqt::services::{FieldRef, SessionVisit};

fn field(s: &str) -> FieldRef {
    s.parse().expect("field ref")
}

fn fields(list: &[&str]) -> Vec<FieldRef> {
    list.iter().map(|s| field(s)).collect()
}

fn first_visit_selection(list: &[&str]) -> FieldSelection {
    FieldSelection::from_field_list(&fields(list), &["V1".to_string()])
}

#[tokio::test]
async fn one_request_per_instrument() {
    let source = Arc::new(ScriptedSource::new(backend()));
    let coordinator = RetrievalCoordinator::new(source.clone());
    let wanted = fields(&["A,f1", "A,f2", "B,f1"]);
    let selection = first_visit_selection(&["A,f1", "A,f2", "B,f1"]);
    let outcome = coordinator
        .run(&wanted, &selection, &subjects(&["S1", "S2"]))
        .await
        .expect("run");
    assert_eq!(outcome.requests, 2);
    let requested: BTreeSet<String> = source.requests().into_iter().map(|(instrument, _)| instrument).collect();
    assert_eq!(requested, ["A".to_string(), "B".to_string()].into_iter().collect::<BTreeSet<String>>());
}

#[test]
fn plan_follows_field_order() {
    let selection = first_visit_selection(&["B,f1", "A,f1"]);
    let requests = plan(&fields(&["B,f1", "A,f1", "B,f1"]), &selection, &subjects(&["S1"]));
    let order: Vec<&str> = requests.iter().map(|request| request.instrument.as_str()).collect();
    assert_eq!(order, vec!["B", "A"]);
}

#[test]
fn subjects_expand_and_visits_are_kept_when_wanted() {
    let mut selection = FieldSelection::new();
    selection.insert(field("A,f1"), ["V1".to_string(), "V2".to_string()]);
    let mut sessions = subjects(&["S1"]);
    sessions.extend(visits(&[("S2", "V1"), ("S2", "V3")]));
    let requests = plan(&fields(&["A,f1"]), &selection, &sessions);
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].sessions,
        vec![SessionVisit::new("S1", "V1"), SessionVisit::new("S1", "V2"), SessionVisit::new("S2", "V1")]
    );
}

#[test]
fn instrument_without_wanted_sessions_still_gets_a_request() {
    let selection = first_visit_selection(&["A,f1"]);
    let sessions = visits(&[("S1", "V2")]);
    let requests = plan(&fields(&["A,f1"]), &selection, &sessions);
    assert_eq!(requests.len(), 1);
    assert!(requests[0].sessions.is_empty());
}

#[tokio::test]
async fn rows_merge_by_session_key() {
    let coordinator = RetrievalCoordinator::new(backend());
    let selection = first_visit_selection(&["A,f1", "B,f1"]);
    let outcome = coordinator
        .run(&fields(&["A,f1", "B,f1"]), &selection, &subjects(&["S1", "S2"]))
        .await
        .expect("run");
    let keys: Vec<&String> = outcome.session_data.keys().collect();
    assert_eq!(keys, vec!["S1,V1", "S2,V1"]);
    let s1 = &outcome.session_data["S1,V1"];
    assert_eq!(s1.len(), 2);
    assert_eq!(s1["A"].text("f1").as_deref(), Some("5"));
    assert_eq!(s1["B"].text("f1").as_deref(), Some("1"));
    // S2 has no B document at V1
    assert_eq!(outcome.session_data["S2,V1"].len(), 1);
}

#[tokio::test]
async fn failed_instrument_does_not_block_completion() {
    let source = Arc::new(ScriptedSource::new(backend()).failing("B"));
    let coordinator = RetrievalCoordinator::new(source);
    let selection = first_visit_selection(&["A,f1", "B,f1"]);
    let outcome = coordinator
        .run(&fields(&["A,f1", "B,f1"]), &selection, &subjects(&["S1"]))
        .await
        .expect("a failed instrument is not an error");
    assert_eq!(outcome.answered, outcome.requests);
    assert_eq!(outcome.failed, vec!["B".to_string()]);
    assert_eq!(outcome.session_data["S1,V1"].keys().collect::<Vec<_>>(), vec!["A"]);
}

#[tokio::test]
async fn crashed_request_still_counts_as_answered() {
    let source = Arc::new(ScriptedSource::new(backend()).panicking("B"));
    let coordinator = RetrievalCoordinator::new(source);
    let selection = first_visit_selection(&["A,f1", "B,f1"]);
    let outcome = coordinator
        .run(&fields(&["A,f1", "B,f1"]), &selection, &subjects(&["S1"]))
        .await
        .expect("a crashed request is not an error");
    assert_eq!(outcome.requests, 2);
    assert_eq!(outcome.answered, 2);
    assert_eq!(outcome.failed, vec!["B".to_string()]);
    assert_eq!(outcome.session_data["S1,V1"].keys().collect::<Vec<_>>(), vec!["A"]);
}

#[tokio::test]
async fn newer_run_supersedes_an_older_one() {
    let source = Arc::new(ScriptedSource::new(backend()).delayed(Duration::from_millis(100)));
    let coordinator = RetrievalCoordinator::new(source);
    let wanted = fields(&["A,f1"]);
    let selection = first_visit_selection(&["A,f1"]);
    let sessions = subjects(&["S1", "S2"]);
    let (older, newer) = tokio::join!(coordinator.run(&wanted, &selection, &sessions), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.run(&wanted, &selection, &sessions).await
    });
    assert!(matches!(older, Err(DqtError::Superseded { generation: 1 })));
    let newer = newer.expect("newer run");
    assert_eq!(newer.generation, 2);
    assert_eq!(newer.session_data.len(), 2);
}

#[tokio::test]
async fn run_query_uses_the_filtered_sessions() {
    let query = QueryInterface::open(services(backend())).await.expect("open");
    let filter = FilterTree::from_root(
        Group::new(GroupOperator::And).with_child(Rule::new("A", "f1", RuleOperator::GreaterThanEqual, "7")),
    );
    let evaluation = query.submit_filter(filter).await;
    assert!(evaluation.sessions.contains(&Session::Subject("S2".into())));
    query.toggle_field("A", "f1", false).await;

    let projection = query.run_current_query().await.expect("run");
    assert_eq!(projection.row_identifiers, vec!["S1,V1", "S2,V1"]);
    let cells: Vec<&str> = projection.rows.iter().map(|row| row[0].text()).collect();
    assert_eq!(cells, vec!["5", "10"]);
    assert_eq!(query.projection().await, Some(projection));
    let kept = query.session_data().await;
    assert_eq!(kept.keys().collect::<Vec<_>>(), vec!["S1,V1", "S2,V1"]);
    assert_eq!(kept["S2,V1"]["A"].id, "A_S2_V1");
}

#[tokio::test]
async fn superseded_query_leaves_the_newer_results() {
    let backend = backend();
    let mut wired = services(backend.clone());
    wired.documents = Arc::new(ScriptedSource::new(backend).delayed(Duration::from_millis(100)));
    let query = QueryInterface::open(wired).await.expect("open");
    query.toggle_field("A", "f1", false).await;
    query.toggle_field("B", "f1", false).await;

    let first = fields(&["A,f1"]);
    let second = fields(&["B,f1"]);
    let (older, newer) = tokio::join!(query.run_query(&first), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        query.run_query(&second).await
    });
    assert!(matches!(older, Err(DqtError::Superseded { .. })));
    let newer = newer.expect("newer run");
    assert_eq!(newer.column_headers, vec!["B,f1"]);
    assert_eq!(query.projection().await, Some(newer));
}
