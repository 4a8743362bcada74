//! dqt – a query engine for longitudinal clinical study data.
//!
//! A query has two halves. The *filter* decides which sessions take part: a tree
//! of AND/OR groups whose leaves are rules on one instrument field, each rule
//! resolved to the set of subjects (or subject visits) it matches. The *field
//! selection* decides what is shown: per instrument, the fields and the visits
//! each field is wanted for. Running a query fetches the selected instruments'
//! documents for the filtered sessions and lays them out as rows.
//!
//! ## Modules
//! * [`filter`] – The filter tree: sessions, rules, groups and path based edits.
//! * [`resolve`] – Resolves single rules through the session-match lookups.
//! * [`evaluate`] – Combines rule results bottom-up into a group's sessions.
//! * [`selection`] – The field selection and its per-visit bookkeeping.
//! * [`retrieve`] – Concurrent per-instrument document retrieval with run generations.
//! * [`project`] – Cross-sectional and longitudinal row layouts.
//! * [`saved`] – Decoding and encoding of saved queries, legacy schema included.
//! * [`services`] – The collaborator traits the engine is wired to.
//! * [`memory`] – An in-memory implementation of every collaborator.
//! * [`interface`] – The shared query workspace.
//! * [`server`] – HTTP routes over the workspace.
//! * [`config`] – Layered server settings.
//!
//! ## Quick Start
//! ```
//! use std::sync::Arc;
//! use dqt::filter::{FilterTree, NodePath, Rule, RuleOperator};
//! use dqt::interface::QueryInterface;
//! use dqt::memory::{Dataset, MemoryBackend, MemoryQueryStore};
//! use dqt::project::BaseUrlLinks;
//! use dqt::services::Services;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let dataset = Dataset::new(&["V1"])
//!     .with_field("bmi", "weight", "int", false)
//!     .with_document("bmi", "S1", "V1", serde_json::json!({ "weight": 70 }))
//!     .with_document("bmi", "S2", "V1", serde_json::json!({ "weight": 90 }));
//! let backend = Arc::new(MemoryBackend::new(dataset));
//! let services = Services {
//!     dictionary: backend.clone(),
//!     matcher: backend.clone(),
//!     documents: backend.clone(),
//!     catalog: backend,
//!     queries: Arc::new(MemoryQueryStore::new()),
//!     links: Arc::new(BaseUrlLinks::new("http://localhost/").unwrap()),
//! };
//! let query = QueryInterface::open(services).await.unwrap();
//! let mut tree = FilterTree::new();
//! tree.replace_rule(&NodePath(vec![0]), Rule::new("bmi", "weight", RuleOperator::GreaterThanEqual, "80")).unwrap();
//! let evaluation = query.submit_filter(tree).await;
//! assert_eq!(evaluation.sessions.len(), 1);
//! # });
//! ```

pub mod config;
pub mod error;
pub mod evaluate;
pub mod filter;
pub mod interface;
pub mod memory;
pub mod project;
pub mod resolve;
pub mod retrieve;
pub mod saved;
pub mod selection;
pub mod server;
pub mod services;

pub use error::{DqtError, Result};
