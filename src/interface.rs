//! The query workspace shared by every caller.
//!
//! A [`QueryInterface`] owns the filter tree being edited, the field selection,
//! the data of the last retrieval run and its projection. Filter work is
//! serialized: edits and evaluations hold the workspace lock until the tree is
//! resolved again. Retrieval runs do not hold it while documents are fetched, so a
//! second run can start and supersede the first.

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{DqtError, Result};
use crate::evaluate::{Evaluation, GroupEvaluator};
use crate::filter::{FilterTree, GroupOperator, NodePath, Rule, Session, SessionSet};
use crate::project::{DisplayMode, RowProjection, RowProjector};
use crate::resolve::RuleResolver;
use crate::retrieve::{RetrievalCoordinator, SessionData};
use crate::saved::{self, SavedQuery, SavedQuerySummary};
use crate::selection::{FieldSelection, FieldSelectionModel, Toggle, VisitAction};
use crate::services::{FieldRef, SaveRequest, Services, StudySetup};

#[derive(Debug)]
struct Workspace {
    tree: FilterTree,
    model: FieldSelectionModel,
    universe: SessionSet,
    session_data: SessionData,
    // fields of the last completed run, needed to re-project on a display change
    fields: Vec<FieldRef>,
    display: DisplayMode,
    projection: Option<RowProjection>,
}

impl Workspace {
    fn clear_results(&mut self) {
        self.session_data.clear();
        self.projection = None;
    }
}

pub struct QueryInterface {
    services: Services,
    setup: StudySetup,
    resolver: Mutex<RuleResolver>,
    coordinator: RetrievalCoordinator,
    projector: RowProjector,
    workspace: Mutex<Workspace>,
}

impl QueryInterface {
    /// Loads the study setup and the candidate sessions, and starts with an empty
    /// filter that matches every session.
    pub async fn open(services: Services) -> Result<Self> {
        let setup = services.catalog.setup().await?;
        let universe: SessionSet = services.catalog.sessions().await?.into_iter().map(Session::Subject).collect();
        info!(
            visits = setup.visits.len(),
            categories = setup.categories.len(),
            sessions = universe.len(),
            "study catalog loaded"
        );
        let mut tree = FilterTree::new();
        tree.root_mut().resolved_sessions = Some(universe.clone());
        let workspace = Workspace {
            tree,
            model: FieldSelectionModel::new(setup.visits.clone()),
            universe,
            session_data: SessionData::new(),
            fields: Vec::new(),
            display: DisplayMode::default(),
            projection: None,
        };
        Ok(Self {
            resolver: Mutex::new(RuleResolver::new(services.dictionary.clone(), services.matcher.clone())),
            coordinator: RetrievalCoordinator::new(services.documents.clone()),
            projector: RowProjector::new(services.links.clone(), setup.visits.clone()),
            workspace: Mutex::new(workspace),
            setup,
            services,
        })
    }

    // ------------- Accessors -------------
    pub fn setup(&self) -> &StudySetup {
        &self.setup
    }
    pub async fn filter(&self) -> FilterTree {
        self.workspace.lock().await.tree.clone()
    }
    pub async fn selection(&self) -> FieldSelection {
        self.workspace.lock().await.model.selection().clone()
    }
    pub async fn universe(&self) -> SessionSet {
        self.workspace.lock().await.universe.clone()
    }
    pub async fn display(&self) -> DisplayMode {
        self.workspace.lock().await.display
    }
    pub async fn projection(&self) -> Option<RowProjection> {
        self.workspace.lock().await.projection.clone()
    }
    pub async fn session_data(&self) -> SessionData {
        self.workspace.lock().await.session_data.clone()
    }

    // ------------- Filter -------------
    async fn evaluate(&self, tree: &mut FilterTree, universe: &SessionSet) -> Evaluation {
        let mut resolver = self.resolver.lock().await;
        GroupEvaluator::new(&mut resolver, universe).evaluate_tree(tree).await
    }

    /// Resolves a whole tree from scratch and makes it the current filter.
    pub async fn submit_filter(&self, mut tree: FilterTree) -> Evaluation {
        tree.root_mut().clear_resolution();
        let mut workspace = self.workspace.lock().await;
        let universe = workspace.universe.clone();
        let evaluation = self.evaluate(&mut tree, &universe).await;
        info!(
            sessions = evaluation.sessions.len(),
            failures = evaluation.failures.len(),
            "filter submitted"
        );
        workspace.tree = tree;
        evaluation
    }

    /// Replaces the filter without resolving it. Resolution happens on the next
    /// edit or run; sessions carried in by the caller are never trusted.
    pub async fn update_filter(&self, mut tree: FilterTree) {
        tree.root_mut().clear_resolution();
        let mut workspace = self.workspace.lock().await;
        if tree.root().children.is_empty() {
            tree.root_mut().resolved_sessions = Some(workspace.universe.clone());
        }
        workspace.tree = tree;
    }

    /// Applies an edit to the current filter and resolves what it invalidated.
    pub async fn edit_filter<T, F>(&self, edit: F) -> Result<(T, Evaluation)>
    where
        F: FnOnce(&mut FilterTree) -> Result<T> + Send,
        T: Send,
    {
        let mut workspace = self.workspace.lock().await;
        let edited = edit(&mut workspace.tree)?;
        let universe = workspace.universe.clone();
        let evaluation = self.evaluate(&mut workspace.tree, &universe).await;
        Ok((edited, evaluation))
    }

    pub async fn add_rule(&self, parent: &NodePath, rule: Rule) -> Result<(NodePath, Evaluation)> {
        self.edit_filter(|tree| tree.add_rule(parent, rule)).await
    }
    pub async fn add_group(&self, parent: &NodePath, operator: GroupOperator) -> Result<(NodePath, Evaluation)> {
        self.edit_filter(|tree| tree.add_group(parent, operator)).await
    }
    pub async fn replace_rule(&self, path: &NodePath, rule: Rule) -> Result<Evaluation> {
        let ((), evaluation) = self.edit_filter(|tree| tree.replace_rule(path, rule)).await?;
        Ok(evaluation)
    }
    pub async fn remove_node(&self, path: &NodePath) -> Result<Evaluation> {
        let (_, evaluation) = self.edit_filter(|tree| tree.remove(path)).await?;
        Ok(evaluation)
    }
    pub async fn set_group_operator(&self, path: &NodePath, operator: GroupOperator) -> Result<Evaluation> {
        let ((), evaluation) = self.edit_filter(|tree| tree.set_operator(path, operator)).await?;
        Ok(evaluation)
    }

    // ------------- Fields -------------
    pub async fn toggle_field(&self, instrument: &str, field: &str, downloadable: bool) -> Toggle {
        let toggled = self.workspace.lock().await.model.toggle(instrument, field, downloadable);
        info!(%instrument, %field, toggled = ?toggled, "field toggled");
        toggled
    }

    pub async fn field_visit_select(&self, action: VisitAction, visit: &str, field: &FieldRef) -> Result<()> {
        self.workspace.lock().await.model.field_visit_select(action, visit, field)
    }

    // ------------- Retrieval -------------
    /// Fetches the documents of `fields` for the sessions the current filter
    /// matches and projects them in the current display mode.
    ///
    /// Starting a run clears the previous results. A run overtaken by a newer one
    /// returns `DqtError::Superseded` and leaves the newer run's state alone.
    pub async fn run_query(&self, fields: &[FieldRef]) -> Result<RowProjection> {
        let (generation, selection, sessions) = {
            let mut workspace = self.workspace.lock().await;
            if workspace.tree.resolved_sessions().is_none() {
                let universe = workspace.universe.clone();
                self.evaluate(&mut workspace.tree, &universe).await;
            }
            // generations only move while the workspace is locked
            let generation = self.coordinator.begin();
            workspace.clear_results();
            let sessions = workspace.tree.resolved_sessions().cloned().unwrap_or_default();
            (generation, workspace.model.selection().clone(), sessions)
        };
        let outcome = self.coordinator.execute(generation, fields, &selection, &sessions).await?;

        let mut workspace = self.workspace.lock().await;
        if self.coordinator.active_generation() != generation {
            return Err(DqtError::Superseded { generation });
        }
        let projection = self.projector.project(&outcome.session_data, fields, &selection, workspace.display);
        workspace.session_data = outcome.session_data;
        workspace.fields = fields.to_vec();
        workspace.projection = Some(projection.clone());
        Ok(projection)
    }

    /// Runs the query over the fields currently selected.
    pub async fn run_current_query(&self) -> Result<RowProjection> {
        let fields = self.workspace.lock().await.model.selection().fields().to_vec();
        self.run_query(&fields).await
    }

    /// Switches the display mode and re-projects the data already retrieved.
    pub async fn change_display(&self, mode: DisplayMode) -> Option<RowProjection> {
        let mut workspace = self.workspace.lock().await;
        workspace.display = mode;
        if workspace.session_data.is_empty() {
            return None;
        }
        let projection =
            self.projector
                .project(&workspace.session_data, &workspace.fields, workspace.model.selection(), mode);
        workspace.projection = Some(projection.clone());
        Some(projection)
    }

    /// Back to an empty filter matching every session and no selected fields.
    pub async fn reset_query(&self) {
        let mut workspace = self.workspace.lock().await;
        let mut tree = FilterTree::new();
        tree.root_mut().resolved_sessions = Some(workspace.universe.clone());
        workspace.tree = tree;
        workspace.model.reset();
        workspace.fields.clear();
        workspace.clear_results();
        info!("query reset");
    }

    // ------------- Saved queries -------------
    /// Decodes a saved query payload in either schema and installs it as the
    /// current filter and selection. Nothing changes when decoding fails.
    pub async fn load_saved_query(
        &self,
        fields: &serde_json::Value,
        criteria: &serde_json::Value,
    ) -> Result<(FilterTree, FieldSelection)> {
        let (tree, selection) = saved::decode(fields, criteria, &self.setup.visits)?;
        self.install(tree, selection).await
    }

    pub async fn load_saved_query_by_id(&self, id: &str) -> Result<SavedQuery> {
        let document = self.services.queries.fetch(id).await?;
        let mut query = saved::decode_document(&document, &self.setup.visits)?;
        let (tree, selection) = self.install(query.filter, query.selection).await?;
        query.filter = tree;
        query.selection = selection;
        info!(id = %query.id, name = %query.name, "saved query loaded");
        Ok(query)
    }

    async fn install(&self, mut tree: FilterTree, mut selection: FieldSelection) -> Result<(FilterTree, FieldSelection)> {
        if !selection.is_empty() {
            match self.services.dictionary.describe(selection.fields()).await {
                Ok(entries) => {
                    for entry in entries.iter().filter(|entry| entry.value.is_file) {
                        selection.mark_downloadable(entry.field_ref());
                    }
                }
                Err(e) => warn!(error = %e, "could not tell which loaded fields are files"),
            }
        }
        let mut workspace = self.workspace.lock().await;
        let universe = workspace.universe.clone();
        let evaluation = self.evaluate(&mut tree, &universe).await;
        if !evaluation.failures.is_empty() {
            warn!(failures = evaluation.failures.len(), "loaded filter has failing rules");
        }
        workspace.tree = tree.clone();
        workspace.model.replace(selection.clone());
        workspace.fields.clear();
        workspace.clear_results();
        Ok((tree, selection))
    }

    /// Saves the current filter and selection under `name`, in the current schema.
    pub async fn save_current_query(&self, name: &str, shared: bool, overwrite: bool) -> Result<String> {
        let (fields, filter) = {
            let workspace = self.workspace.lock().await;
            (saved::encode_fields(workspace.model.selection()), saved::encode_filter(&workspace.tree))
        };
        let request = SaveRequest { name: name.to_owned(), shared, overwrite, fields, filter };
        match self.services.queries.save(request).await {
            Ok(id) => {
                info!(%id, %name, shared, "query saved");
                Ok(id)
            }
            Err(e @ DqtError::SaveConflict { .. }) => {
                info!(%name, "query name already taken");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Every stored query the user can see. Queries that fail to load are left out.
    pub async fn saved_queries(&self) -> Result<Vec<SavedQuerySummary>> {
        let ids = self.services.queries.list().await?;
        let fetches = ids.user.iter().chain(ids.shared.iter()).map(|id| self.services.queries.fetch(id));
        let documents = join_all(fetches).await;
        let mut summaries = Vec::with_capacity(documents.len());
        for document in documents {
            match document.and_then(|document| saved::summarize(&document)) {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(error = %e, "skipping unreadable saved query"),
            }
        }
        Ok(summaries)
    }

    pub async fn delete_saved_query(&self, id: &str) -> Result<()> {
        self.services.queries.delete(id).await?;
        info!(%id, "saved query deleted");
        Ok(())
    }
}
