//! The data source: owns one breakdown tree and keeps it in step with the
//! configured breakdown path, order, date range and filters.
//!
//! All tree mutation happens synchronously under one lock; the only
//! suspension points are endpoint calls. Each configuration change advances
//! the [`Epoch`], and a batch whose epoch was superseded while it was in
//! flight is dropped instead of merged.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::endpoint::{CellEdit, Endpoint, EndpointError, MetaData};
use crate::tree::{
    allocate_child_container, create_root, find_node, locate, replace_rows, set_loading, Node,
};
use crate::types::{
    BreakdownId, BreakdownPath, DateRange, EngineError, Epoch, Filter, NodeRef, Order,
    QueryConfig, Result,
};

mod fetch;
mod notify;
mod options;
mod reconfigure;

pub use notify::{ChangeEvent, ChangeKind, Subscription};
pub use options::{DataSourceOptions, RetryPolicy};
pub use reconfigure::find_divergence;

use fetch::Batch;
use notify::ChangeNotifier;
use reconfigure::{plan, reset_level, Reconfiguration};

/// Work done by one fetching operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Endpoint calls issued, retries included.
    pub requests: usize,
    /// Levels merged.
    pub levels: usize,
    /// Rows merged.
    pub rows: usize,
}

/// Result of an operation that may fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// No fetch was needed or requested.
    Skipped,
    /// The configuration changed while the request was in flight; the
    /// response was dropped.
    Stale,
    /// Responses were merged into the tree.
    Applied(FetchSummary),
}

impl FetchOutcome {
    /// Returns `true` when the response was dropped as stale.
    pub fn is_stale(&self) -> bool {
        matches!(self, FetchOutcome::Stale)
    }

    /// Summary of merged work, if anything was merged.
    pub fn summary(&self) -> Option<FetchSummary> {
        match self {
            FetchOutcome::Applied(summary) => Some(*summary),
            _ => None,
        }
    }
}

pub(crate) struct State {
    pub(crate) root: Arc<Node>,
    /// Configuration requested by callers.
    pub(crate) query: QueryConfig,
    /// Configuration the tree currently reflects.
    pub(crate) tree_query: QueryConfig,
    /// Set once the first level has been merged under `tree_query`.
    pub(crate) tree_loaded: bool,
    pub(crate) epoch: Epoch,
    pub(crate) revision: u64,
}

impl State {
    /// Moves to a new epoch. Every in-flight batch becomes stale, so no node
    /// is loading any more.
    pub(crate) fn advance_epoch(&mut self) -> Epoch {
        self.epoch = self.epoch.next();
        let loading = loading_nodes(&self.root);
        set_loading(&mut self.root, &loading, false);
        self.epoch
    }

    pub(crate) fn bump_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn depth(&self) -> usize {
        self.tree_query.path.len()
    }
}

fn loading_nodes(root: &Node) -> Vec<NodeRef> {
    fn walk(node: &Node, out: &mut Vec<NodeRef>) {
        if node.loading {
            out.push(node.node_ref());
        }
        if let Some(children) = node.children.as_ref() {
            for child in children.iter() {
                walk(child, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(root, &mut out);
    out
}

/// Lazily populated breakdown tree backed by an [`Endpoint`].
pub struct DataSource {
    endpoint: Arc<dyn Endpoint>,
    options: DataSourceOptions,
    state: Mutex<State>,
    notifier: ChangeNotifier,
    metadata: Mutex<Option<Arc<MetaData>>>,
}

impl DataSource {
    /// Creates a data source with an empty root and no configured path.
    pub fn new(endpoint: Arc<dyn Endpoint>, options: DataSourceOptions) -> Self {
        Self {
            endpoint,
            options,
            state: Mutex::new(State {
                root: Arc::new(create_root()),
                query: QueryConfig::default(),
                tree_query: QueryConfig::default(),
                tree_loaded: false,
                epoch: Epoch::default(),
                revision: 0,
            }),
            notifier: ChangeNotifier::new(),
            metadata: Mutex::new(None),
        }
    }

    /// Options the source was created with.
    pub fn options(&self) -> &DataSourceOptions {
        &self.options
    }

    /// Current root. The snapshot never changes; later mutations produce a new root.
    pub fn tree(&self) -> Arc<Node> {
        Arc::clone(&self.state.lock().root)
    }

    /// Configuration requested by callers.
    pub fn query(&self) -> QueryConfig {
        self.state.lock().query.clone()
    }

    /// Requested breakdown path.
    pub fn breakdown_path(&self) -> BreakdownPath {
        self.state.lock().query.path.clone()
    }

    /// Breakdown path the tree is currently shaped by.
    pub fn tree_path(&self) -> BreakdownPath {
        self.state.lock().tree_query.path.clone()
    }

    /// Current configuration epoch.
    pub fn epoch(&self) -> Epoch {
        self.state.lock().epoch
    }

    /// Registers `callback` for tree mutations until the returned handle is dropped.
    pub fn on_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(callback)
    }

    /// Receiver that observes the latest tree revision.
    pub fn watch_revisions(&self) -> watch::Receiver<u64> {
        self.notifier.watch()
    }

    /// Endpoint metadata, fetched once and cached until invalidated.
    pub async fn metadata(&self) -> Result<Arc<MetaData>> {
        if let Some(meta) = self.metadata.lock().clone() {
            return Ok(meta);
        }
        let meta = Arc::new(self.endpoint.metadata().await.map_err(EngineError::Metadata)?);
        *self.metadata.lock() = Some(Arc::clone(&meta));
        Ok(meta)
    }

    /// Drops cached metadata so the next [`Self::metadata`] call refetches it.
    pub fn invalidate_metadata(&self) {
        self.metadata.lock().take();
    }

    /// Recreates the root and fetches every configured level.
    pub async fn reload(&self) -> Result<FetchOutcome> {
        let step = {
            let mut state = self.state.lock();
            self.begin_reset(&mut state)
        };
        self.proceed(step).await
    }

    /// Changes the breakdown path.
    ///
    /// Levels shared with the current tree path are kept; only the diverging
    /// suffix is rebuilt and refetched. With `fetch == false` only the
    /// requested configuration changes and the tree follows on the next
    /// fetching call.
    pub async fn set_breakdown_path(&self, path: BreakdownPath, fetch: bool) -> Result<FetchOutcome> {
        path.validate()?;
        let step = {
            let mut state = self.state.lock();
            if !fetch {
                if state.query.path != path {
                    state.query.path = path;
                    state.advance_epoch();
                }
                return Ok(FetchOutcome::Skipped);
            }
            state.query.path = path.clone();
            let reconfiguration = if state.query.same_basis(&state.tree_query) {
                plan(&path, &state.tree_query.path, state.tree_loaded)
            } else {
                Reconfiguration::Reset
            };
            match reconfiguration {
                Reconfiguration::Unchanged => {
                    debug!(path = %path, "breakdown path unchanged");
                    return Ok(FetchOutcome::Skipped);
                }
                Reconfiguration::Reset => self.begin_reset(&mut state),
                Reconfiguration::Prune { depth } => {
                    let epoch = state.advance_epoch();
                    reset_level(&mut state.root, depth, depth);
                    state.tree_query.path = path;
                    info!(depth, epoch = %epoch, "pruned breakdown tree");
                    let revision = state.bump_revision();
                    Step {
                        event: ChangeEvent {
                            kind: ChangeKind::Pruned { depth },
                            epoch,
                            revision,
                        },
                        fetch: None,
                    }
                }
                Reconfiguration::Rebuild { level } => {
                    let epoch = state.advance_epoch();
                    let targets = reset_level(&mut state.root, level, path.len());
                    state.tree_query.path = path;
                    info!(
                        level,
                        targets = targets.len(),
                        epoch = %epoch,
                        "rebuilding breakdown below retained level"
                    );
                    let revision = state.bump_revision();
                    let batch = Batch::first_page(
                        level + 1,
                        targets,
                        self.options.page_size_for(level + 1),
                    );
                    Step {
                        event: ChangeEvent {
                            kind: ChangeKind::Reconfigured { level },
                            epoch,
                            revision,
                        },
                        fetch: Some((epoch, batch)),
                    }
                }
            }
        };
        self.proceed(step).await
    }

    /// Fetches the next `page_size` children of `node`, then the first pages of
    /// every deeper configured level below the new rows.
    pub async fn load_more(&self, node: &NodeRef, page_size: usize) -> Result<FetchOutcome> {
        let (epoch, batch) = {
            let state = self.state.lock();
            let target = find_node(&state.root, node)
                .ok_or_else(|| EngineError::NodeNotFound(node.clone()))?;
            if target.level >= state.depth() {
                return Err(EngineError::NotExpandable(node.clone()));
            }
            let Some(pagination) = target.pagination() else {
                return Err(EngineError::NotExpandable(node.clone()));
            };
            if pagination.complete {
                return Err(EngineError::AlreadyComplete(node.clone()));
            }
            if target.loading {
                debug!(node = %node, "load more ignored while a request is in flight");
                return Ok(FetchOutcome::Skipped);
            }
            let batch = Batch::load_more(
                target.level + 1,
                node.clone(),
                pagination.next_offset(),
                page_size.max(1),
            );
            (state.epoch, batch)
        };
        self.run_batches(batch, epoch).await
    }

    /// Changes the sort order; with `fetch` the tree is rebuilt from the root.
    pub async fn set_order(&self, order: Order, fetch: bool) -> Result<FetchOutcome> {
        self.update_query(|query| query.order = Some(order), fetch).await
    }

    /// Changes the reporting window; with `fetch` the tree is rebuilt from the root.
    pub async fn set_date_range(&self, range: DateRange, fetch: bool) -> Result<FetchOutcome> {
        self.update_query(|query| query.date_range = Some(range), fetch)
            .await
    }

    /// Replaces the global filters; with `fetch` the tree is rebuilt from the root.
    pub async fn set_filters(&self, filters: Vec<Filter>, fetch: bool) -> Result<FetchOutcome> {
        self.update_query(|query| query.filters = filters, fetch).await
    }

    /// Edits one cell and replaces the affected row with the endpoint's answer.
    pub async fn save(
        &self,
        id: &BreakdownId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<FetchOutcome> {
        let (epoch, edit) = {
            let state = self.state.lock();
            let node = find_node(&state.root, &NodeRef::Node(id.clone()))
                .ok_or_else(|| EngineError::NodeNotFound(NodeRef::Node(id.clone())))?;
            let edit = CellEdit {
                breakdown_id: id.clone(),
                level: node.level,
                field: field.to_string(),
                value,
                context: state.tree_query.clone(),
            };
            (state.epoch, edit)
        };

        let page = self.endpoint.save(&edit).await.map_err(|err| match err {
            EndpointError::Validation { field, message } => EngineError::Validation {
                node: id.clone(),
                field,
                message,
            },
            other => EngineError::RequestFailed {
                level: edit.level,
                source: other,
            },
        })?;

        let (event, rows) = {
            let mut state = self.state.lock();
            if state.epoch != epoch || locate(&state.root, id, Some(edit.level)).is_none() {
                debug!(node = %id, "dropping edit result for superseded tree");
                return Ok(FetchOutcome::Stale);
            }
            let mut next = Arc::clone(&state.root);
            let rows = replace_rows(&mut next, &page)?;
            state.root = next;
            let revision = state.bump_revision();
            let event = ChangeEvent {
                kind: ChangeKind::RowsReplaced { rows },
                epoch,
                revision,
            };
            (event, rows)
        };
        info!(node = %id, field, rows, "applied cell edit");
        self.notifier.publish(event);
        Ok(FetchOutcome::Applied(FetchSummary {
            requests: 1,
            levels: 0,
            rows,
        }))
    }

    async fn update_query<F>(&self, edit: F, fetch: bool) -> Result<FetchOutcome>
    where
        F: FnOnce(&mut QueryConfig),
    {
        {
            let mut state = self.state.lock();
            edit(&mut state.query);
            state.advance_epoch();
        }
        if fetch {
            self.reload().await
        } else {
            Ok(FetchOutcome::Skipped)
        }
    }

    /// Recreates the root under the requested configuration. No batch is
    /// produced when no path is configured.
    fn begin_reset(&self, state: &mut State) -> Step {
        let epoch = state.advance_epoch();
        let mut root = create_root();
        let has_levels = !state.query.path.is_empty();
        if has_levels {
            allocate_child_container(&mut root);
        }
        state.root = Arc::new(root);
        state.tree_query = state.query.clone();
        state.tree_loaded = false;
        let revision = state.bump_revision();
        info!(path = %state.tree_query.path, epoch = %epoch, "reset breakdown tree");
        Step {
            event: ChangeEvent {
                kind: ChangeKind::Reset,
                epoch,
                revision,
            },
            fetch: has_levels.then(|| (epoch, Batch::root_reset(self.options.page_size_for(1)))),
        }
    }

    /// Publishes the structural change, then runs its batch. Called with the
    /// state lock released.
    async fn proceed(&self, step: Step) -> Result<FetchOutcome> {
        self.notifier.publish(step.event);
        match step.fetch {
            Some((epoch, batch)) => self.run_batches(batch, epoch).await,
            None => Ok(FetchOutcome::Skipped),
        }
    }
}

/// Structural change applied under the lock, plus the fetch it calls for.
struct Step {
    event: ChangeEvent,
    fetch: Option<(Epoch, Batch)>,
}
