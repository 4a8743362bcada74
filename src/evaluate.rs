use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::filter::{FilterNode, FilterTree, Group, GroupOperator, NodePath, SessionSet};
use crate::resolve::RuleResolver;

/// A rule whose lookup failed; the rule itself resolved to the empty set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailure {
    pub path: NodePath,
    pub instrument: String,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Evaluation {
    pub sessions: SessionSet,
    pub failures: Vec<RuleFailure>,
}

/// Combines the sessions of a group's participating children. AND intersects and
/// OR unions; with nothing to combine the group matches the whole universe.
pub fn combine<'s>(
    operator: GroupOperator,
    children: impl IntoIterator<Item = &'s SessionSet>,
    universe: &SessionSet,
) -> SessionSet {
    let mut sets = children.into_iter();
    let Some(first) = sets.next() else {
        return universe.clone();
    };
    let mut combined = first.clone();
    for set in sets {
        match operator {
            GroupOperator::And => combined.retain(|session| set.contains(session)),
            GroupOperator::Or => combined.extend(set.iter().cloned()),
        }
    }
    combined
}

// ------------- Group evaluation -------------
/// Walks a filter tree depth-first, resolving one rule at a time in tree order.
///
/// Rules that already carry resolved sessions are kept as they are, so evaluating
/// an unchanged tree twice yields the same result without new lookups. Rules whose
/// last lookup failed are tried again.
pub struct GroupEvaluator<'a> {
    resolver: &'a mut RuleResolver,
    universe: &'a SessionSet,
}

impl<'a> GroupEvaluator<'a> {
    pub fn new(resolver: &'a mut RuleResolver, universe: &'a SessionSet) -> Self {
        Self { resolver, universe }
    }

    pub async fn evaluate_tree(&mut self, tree: &mut FilterTree) -> Evaluation {
        let mut failures = Vec::new();
        self.evaluate(tree.root_mut(), NodePath::root(), &mut failures).await;
        Evaluation { sessions: tree.resolved_sessions().cloned().unwrap_or_default(), failures }
    }

    pub fn evaluate<'b>(
        &'b mut self,
        group: &'b mut Group,
        path: NodePath,
        failures: &'b mut Vec<RuleFailure>,
    ) -> BoxFuture<'b, ()> {
        async move {
            for (index, child) in group.children.iter_mut().enumerate() {
                match child {
                    FilterNode::Rule(rule) => {
                        if !rule.is_complete() {
                            rule.clear_resolution();
                            continue;
                        }
                        if rule.resolved_sessions.is_some() && rule.failure.is_none() {
                            continue;
                        }
                        if let Err(e) = self.resolver.resolve(rule).await {
                            let message = e.to_string();
                            warn!(path = %path.child(index), error = %message, "rule lookup failed");
                            rule.resolved_sessions = Some(SessionSet::new());
                            rule.failure = Some(message.clone());
                            failures.push(RuleFailure {
                                path: path.child(index),
                                instrument: rule.instrument.clone(),
                                field: rule.field.clone(),
                                message,
                            });
                        }
                    }
                    FilterNode::Group(nested) => {
                        self.evaluate(nested, path.child(index), failures).await;
                    }
                }
            }
            let sessions = combine(
                group.operator,
                group.children.iter().filter_map(FilterNode::resolved_sessions),
                self.universe,
            );
            debug!(path = %path, operator = ?group.operator, sessions = sessions.len(), "group evaluated");
            group.resolved_sessions = Some(sessions);
        }
        .boxed()
    }
}
