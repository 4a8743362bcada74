//! The filter tree a query is defined by.
//!
//! A tree is a root [`Group`] whose children are either [`Rule`]s (leaves naming an
//! instrument field, an operator, a value and a visit) or nested groups. The node kind
//! is carried by an explicit `type` discriminant, so a serialized node is never guessed
//! from the presence or absence of its other properties.
//!
//! Every node caches the sessions it resolved to. Editing a node through [`FilterTree`]
//! drops the cached sessions of every group between the edited node and the root, so
//! a later evaluation pass re-resolves exactly what changed.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DqtError, Result};

// ------------- Sessions -------------
/// A resolved session: either a bare subject (all of its visits) or one subject visit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Session {
    Subject(String),
    Visit(String, String),
}

impl Session {
    pub fn subject(&self) -> &str {
        match self {
            Session::Subject(subject) | Session::Visit(subject, _) => subject,
        }
    }
    pub fn visit(&self) -> Option<&str> {
        match self {
            Session::Subject(_) => None,
            Session::Visit(_, visit) => Some(visit),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Session::Subject(subject) => write!(f, "{}", subject),
            Session::Visit(subject, visit) => write!(f, "{},{}", subject, visit),
        }
    }
}

pub type SessionSet = BTreeSet<Session>;

// ------------- Operators -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupOperator {
    #[default]
    And,
    Or,
}

impl GroupOperator {
    /// Persisted queries store the operator as an index: 0 for AND, 1 for OR.
    pub fn from_index(index: u64) -> Result<Self> {
        match index {
            0 => Ok(GroupOperator::And),
            1 => Ok(GroupOperator::Or),
            other => Err(DqtError::parse(format!("unknown group operator index {}", other))),
        }
    }
    pub fn index(&self) -> u64 {
        match self {
            GroupOperator::And => 0,
            GroupOperator::Or => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleOperator {
    Equal,
    NotEqual,
    LessThanEqual,
    GreaterThanEqual,
    StartsWith,
    Contains,
    IsNull,
    IsNotNull,
}

/// The session-match lookup a rule operator is answered by. The null checks share
/// the equality lookups, queried with an empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LookupPath {
    Equal,
    NotEqual,
    LessThanEqual,
    GreaterThanEqual,
    StartsWith,
    Contains,
}

impl LookupPath {
    pub fn name(&self) -> &'static str {
        match self {
            LookupPath::Equal => "queryEqual",
            LookupPath::NotEqual => "queryNotEqual",
            LookupPath::LessThanEqual => "queryLessThanEqual",
            LookupPath::GreaterThanEqual => "queryGreaterThanEqual",
            LookupPath::StartsWith => "queryStartsWith",
            LookupPath::Contains => "queryContains",
        }
    }
}

impl RuleOperator {
    pub fn lookup_path(&self) -> LookupPath {
        match self {
            RuleOperator::Equal | RuleOperator::IsNull => LookupPath::Equal,
            RuleOperator::NotEqual | RuleOperator::IsNotNull => LookupPath::NotEqual,
            RuleOperator::LessThanEqual => LookupPath::LessThanEqual,
            RuleOperator::GreaterThanEqual => LookupPath::GreaterThanEqual,
            RuleOperator::StartsWith => LookupPath::StartsWith,
            RuleOperator::Contains => LookupPath::Contains,
        }
    }
    pub fn is_null_check(&self) -> bool {
        matches!(self, RuleOperator::IsNull | RuleOperator::IsNotNull)
    }
    pub fn name(&self) -> &'static str {
        match self {
            RuleOperator::Equal => "equal",
            RuleOperator::NotEqual => "notEqual",
            RuleOperator::LessThanEqual => "lessThanEqual",
            RuleOperator::GreaterThanEqual => "greaterThanEqual",
            RuleOperator::StartsWith => "startsWith",
            RuleOperator::Contains => "contains",
            RuleOperator::IsNull => "isNull",
            RuleOperator::IsNotNull => "isNotNull",
        }
    }
    /// Old saved queries spell comparisons as symbols; anything else must be an operator name.
    pub fn from_legacy(symbol: &str) -> Result<Self> {
        match symbol {
            "=" => Ok(RuleOperator::Equal),
            "!=" => Ok(RuleOperator::NotEqual),
            "<=" => Ok(RuleOperator::LessThanEqual),
            ">=" => Ok(RuleOperator::GreaterThanEqual),
            other => other.parse(),
        }
    }
}

impl FromStr for RuleOperator {
    type Err = DqtError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "equal" => Ok(RuleOperator::Equal),
            "notEqual" => Ok(RuleOperator::NotEqual),
            "lessThanEqual" => Ok(RuleOperator::LessThanEqual),
            "greaterThanEqual" => Ok(RuleOperator::GreaterThanEqual),
            "startsWith" => Ok(RuleOperator::StartsWith),
            "contains" => Ok(RuleOperator::Contains),
            "isNull" => Ok(RuleOperator::IsNull),
            "isNotNull" => Ok(RuleOperator::IsNotNull),
            other => Err(DqtError::parse(format!("unknown rule operator '{}'", other))),
        }
    }
}

impl fmt::Display for RuleOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ------------- Visits -------------
pub const ALL_VISITS: &str = "All";

/// Which visit a rule restricts its matches to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VisitFilter {
    #[default]
    All,
    Only(String),
}

impl From<String> for VisitFilter {
    fn from(visit: String) -> Self {
        if visit == ALL_VISITS || visit.is_empty() {
            VisitFilter::All
        } else {
            VisitFilter::Only(visit)
        }
    }
}
impl From<&str> for VisitFilter {
    fn from(visit: &str) -> Self {
        VisitFilter::from(visit.to_owned())
    }
}
impl From<VisitFilter> for String {
    fn from(visit: VisitFilter) -> Self {
        match visit {
            VisitFilter::All => ALL_VISITS.to_owned(),
            VisitFilter::Only(visit) => visit,
        }
    }
}

// ------------- Rule -------------
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub instrument: String,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub operator: Option<RuleOperator>,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub visit: VisitFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_sessions: Option<SessionSet>,
    /// Set when the lookup for this rule failed during the last evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Rule {
    pub fn new(instrument: &str, field: &str, operator: RuleOperator, value: &str) -> Self {
        Self {
            instrument: instrument.to_owned(),
            field: field.to_owned(),
            operator: Some(operator),
            value: value.to_owned(),
            ..Self::default()
        }
    }
    pub fn with_visit(mut self, visit: impl Into<VisitFilter>) -> Self {
        self.visit = visit.into();
        self
    }
    /// A rule only takes part in evaluation once instrument, field and operator are all set.
    pub fn is_complete(&self) -> bool {
        !self.instrument.is_empty() && !self.field.is_empty() && self.operator.is_some()
    }
    pub fn clear_resolution(&mut self) {
        self.field_type = None;
        self.resolved_sessions = None;
        self.failure = None;
    }
}

// ------------- Group -------------
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    #[serde(default)]
    pub operator: GroupOperator,
    #[serde(default)]
    pub children: Vec<FilterNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_sessions: Option<SessionSet>,
}

impl Group {
    pub fn new(operator: GroupOperator) -> Self {
        Self { operator, children: Vec::new(), resolved_sessions: None }
    }
    pub fn with_child(mut self, child: impl Into<FilterNode>) -> Self {
        self.children.push(child.into());
        self
    }
    pub fn clear_resolution(&mut self) {
        self.resolved_sessions = None;
        for child in &mut self.children {
            child.clear_resolution();
        }
    }
}

// ------------- Node -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterNode {
    Rule(Rule),
    Group(Group),
}

impl FilterNode {
    pub fn resolved_sessions(&self) -> Option<&SessionSet> {
        match self {
            FilterNode::Rule(rule) => rule.resolved_sessions.as_ref(),
            FilterNode::Group(group) => group.resolved_sessions.as_ref(),
        }
    }
    pub fn clear_resolution(&mut self) {
        match self {
            FilterNode::Rule(rule) => rule.clear_resolution(),
            FilterNode::Group(group) => group.clear_resolution(),
        }
    }
}

impl From<Rule> for FilterNode {
    fn from(rule: Rule) -> Self {
        FilterNode::Rule(rule)
    }
}
impl From<Group> for FilterNode {
    fn from(group: Group) -> Self {
        FilterNode::Group(group)
    }
}

// ------------- Paths -------------
/// Child indices leading from the root group to a node. The empty path is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(pub Vec<usize>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }
    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for index in &self.0 {
            write!(f, "/{}", index)?;
        }
        Ok(())
    }
}

// ------------- Tree -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterTree {
    root: Group,
}

impl Default for FilterTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterTree {
    /// A fresh tree: an AND group holding a single, still empty, rule.
    pub fn new() -> Self {
        Self { root: Group::new(GroupOperator::And).with_child(Rule::default()) }
    }
    pub fn from_root(root: Group) -> Self {
        Self { root }
    }
    pub fn root(&self) -> &Group {
        &self.root
    }
    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }
    pub fn into_root(self) -> Group {
        self.root
    }
    pub fn resolved_sessions(&self) -> Option<&SessionSet> {
        self.root.resolved_sessions.as_ref()
    }
    pub fn node(&self, path: &NodePath) -> Result<&FilterNode> {
        let (last, parents) = match path.0.split_last() {
            Some(split) => split,
            None => return Err(DqtError::InvalidPath("the root is not a child node".into())),
        };
        let mut group = &self.root;
        for &index in parents {
            group = match group.children.get(index) {
                Some(FilterNode::Group(child)) => child,
                _ => return Err(DqtError::InvalidPath(path.to_string())),
            };
        }
        group.children.get(*last).ok_or_else(|| DqtError::InvalidPath(path.to_string()))
    }

    // Walks down to the group at `path`, dropping cached sessions along the way.
    fn group_mut(&mut self, path: &[usize]) -> Result<&mut Group> {
        let mut group = &mut self.root;
        group.resolved_sessions = None;
        for (depth, &index) in path.iter().enumerate() {
            group = match group.children.get_mut(index) {
                Some(FilterNode::Group(child)) => child,
                Some(FilterNode::Rule(_)) => {
                    return Err(DqtError::InvalidPath(format!(
                        "{} is a rule",
                        NodePath(path[..=depth].to_vec())
                    )));
                }
                None => return Err(DqtError::InvalidPath(NodePath(path[..=depth].to_vec()).to_string())),
            };
            group.resolved_sessions = None;
        }
        Ok(group)
    }

    pub fn add_rule(&mut self, parent: &NodePath, mut rule: Rule) -> Result<NodePath> {
        rule.clear_resolution();
        let group = self.group_mut(&parent.0)?;
        group.children.push(FilterNode::Rule(rule));
        Ok(parent.child(group.children.len() - 1))
    }
    /// Adds a nested group seeded with one empty rule.
    pub fn add_group(&mut self, parent: &NodePath, operator: GroupOperator) -> Result<NodePath> {
        let group = self.group_mut(&parent.0)?;
        group.children.push(FilterNode::Group(Group::new(operator).with_child(Rule::default())));
        Ok(parent.child(group.children.len() - 1))
    }
    pub fn remove(&mut self, path: &NodePath) -> Result<FilterNode> {
        let (last, parents) = path
            .0
            .split_last()
            .ok_or_else(|| DqtError::InvalidPath("the root group cannot be removed".into()))?;
        let group = self.group_mut(parents)?;
        if *last >= group.children.len() {
            return Err(DqtError::InvalidPath(path.to_string()));
        }
        Ok(group.children.remove(*last))
    }
    pub fn replace_rule(&mut self, path: &NodePath, mut rule: Rule) -> Result<()> {
        let (last, parents) = path
            .0
            .split_last()
            .ok_or_else(|| DqtError::InvalidPath("the root is a group".into()))?;
        let group = self.group_mut(parents)?;
        match group.children.get_mut(*last) {
            Some(FilterNode::Rule(existing)) => {
                rule.clear_resolution();
                *existing = rule;
                Ok(())
            }
            Some(FilterNode::Group(_)) => Err(DqtError::InvalidPath(format!("{} is a group", path))),
            None => Err(DqtError::InvalidPath(path.to_string())),
        }
    }
    pub fn set_operator(&mut self, path: &NodePath, operator: GroupOperator) -> Result<()> {
        self.group_mut(&path.0)?.operator = operator;
        Ok(())
    }
}
