//! Level-by-level batch fetching.
//!
//! One endpoint call covers every sibling parent of a level. A batch is
//! merged into a private copy of the root and swapped in only when every
//! page applied, so a failed or malformed batch leaves the tree untouched.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{ChangeEvent, ChangeKind, DataSource, FetchOutcome, FetchSummary, State};
use crate::endpoint::{BreakdownRequest, EndpointError, Page};
use crate::tree::{merge, set_loading, MergeTarget};
use crate::types::{BreakdownId, EngineError, Epoch, NodeRef, Result};

/// Parents of one level that are paged together.
#[derive(Clone, Debug)]
pub(crate) struct Batch {
    /// Level of the rows being fetched.
    level: usize,
    parents: Vec<NodeRef>,
    offset: usize,
    limit: usize,
    /// Replace the root's children instead of appending.
    reset: bool,
}

impl Batch {
    pub(crate) fn root_reset(limit: usize) -> Self {
        Self {
            level: 1,
            parents: vec![NodeRef::Root],
            offset: 0,
            limit,
            reset: true,
        }
    }

    pub(crate) fn first_page(level: usize, parents: Vec<NodeRef>, limit: usize) -> Self {
        Self {
            level,
            parents,
            offset: 0,
            limit,
            reset: false,
        }
    }

    pub(crate) fn load_more(level: usize, parent: NodeRef, offset: usize, limit: usize) -> Self {
        Self {
            level,
            parents: vec![parent],
            offset,
            limit,
            reset: false,
        }
    }

    fn target_for(&self, page: &Page) -> Result<MergeTarget> {
        let parent = page
            .breakdown_id
            .clone()
            .map(NodeRef::Node)
            .unwrap_or(NodeRef::Root);
        if !self.parents.contains(&parent) || page.level != self.level {
            return Err(EngineError::MergeTargetMissing(parent));
        }
        if self.reset {
            Ok(MergeTarget::Reset)
        } else {
            Ok(MergeTarget::Append(parent))
        }
    }
}

/// Clears the loading flag of a batch's parents when the request ends without
/// a merge, including when the awaiting future is dropped. A merged batch
/// hands its flags over inside [`DataSource::apply`] and disarms the guard.
struct LoadingGuard<'a> {
    state: &'a Mutex<State>,
    nodes: Vec<NodeRef>,
    epoch: Epoch,
}

impl LoadingGuard<'_> {
    fn disarm(mut self) {
        self.nodes.clear();
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        // A newer epoch already cleared every flag and may have set its own.
        if state.epoch == self.epoch {
            set_loading(&mut state.root, &self.nodes, false);
        }
    }
}

enum Response {
    Pages(Vec<Page>),
    Stale,
    Failed(EndpointError),
}

/// What one merged batch changed.
struct Applied {
    event: ChangeEvent,
    rows: usize,
    next: Option<Batch>,
}

impl DataSource {
    /// Runs `batch` and then one batch per deeper level, until the configured
    /// depth is reached or a level returns nothing to expand.
    pub(super) async fn run_batches(&self, batch: Batch, epoch: Epoch) -> Result<FetchOutcome> {
        let mut summary = FetchSummary::default();
        let mut pending = Some(batch);

        while let Some(batch) = pending.take() {
            if batch.parents.is_empty() {
                break;
            }
            let request = {
                let mut state = self.state.lock();
                if state.epoch != epoch {
                    debug!(level = batch.level, epoch = %epoch, "batch superseded before dispatch");
                    return Ok(FetchOutcome::Stale);
                }
                set_loading(&mut state.root, &batch.parents, true);
                self.request_for(&state, &batch)
            };
            debug!(
                level = batch.level,
                parents = batch.parents.len(),
                offset = batch.offset,
                limit = batch.limit,
                epoch = %epoch,
                "requesting breakdown batch"
            );

            let guard = LoadingGuard {
                state: &self.state,
                nodes: batch.parents.clone(),
                epoch,
            };
            let response = self.send(&request, epoch, &mut summary).await;

            let pages = match response {
                Response::Pages(pages) => pages,
                Response::Stale => return Ok(FetchOutcome::Stale),
                Response::Failed(err) => {
                    if self.epoch() != epoch {
                        debug!(level = batch.level, error = %err, "ignoring failure of superseded batch");
                        return Ok(FetchOutcome::Stale);
                    }
                    warn!(level = batch.level, error = %err, "breakdown batch failed");
                    return Err(EngineError::RequestFailed {
                        level: batch.level,
                        source: err,
                    });
                }
            };

            let applied = {
                let mut state = self.state.lock();
                if state.epoch != epoch {
                    debug!(level = batch.level, epoch = %epoch, "dropping stale breakdown response");
                    return Ok(FetchOutcome::Stale);
                }
                self.apply(&mut state, &batch, &pages, epoch)?
            };
            guard.disarm();
            summary.levels += 1;
            summary.rows += applied.rows;
            self.notifier.publish(applied.event);
            pending = applied.next;
        }

        info!(
            requests = summary.requests,
            levels = summary.levels,
            rows = summary.rows,
            "breakdown fetch complete"
        );
        Ok(FetchOutcome::Applied(summary))
    }

    fn request_for(&self, state: &State, batch: &Batch) -> BreakdownRequest {
        let query = &state.tree_query;
        BreakdownRequest {
            level: batch.level,
            breakdown_path: query.path.clone(),
            breakdown_page: batch.parents.iter().filter_map(|node| node.id().cloned()).collect(),
            offset: batch.offset,
            limit: batch.limit,
            order: query.order.clone(),
            date_range: query.date_range,
            filters: query.filters.clone(),
        }
    }

    /// Issues `request`, retrying transport failures per the retry policy.
    /// Retries stop once the epoch has moved on.
    async fn send(&self, request: &BreakdownRequest, epoch: Epoch, summary: &mut FetchSummary) -> Response {
        let policy = &self.options.retry;
        let mut attempt = 1;
        loop {
            summary.requests += 1;
            match self.endpoint.fetch(request).await {
                Ok(pages) => return Response::Pages(pages),
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    if self.epoch() != epoch {
                        return Response::Stale;
                    }
                    let delay = policy.backoff(attempt);
                    warn!(
                        level = request.level,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "breakdown request failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Response::Failed(err),
            }
        }
    }

    /// Merges every page of a batch into a copy of the root and installs it.
    ///
    /// The batch's parents stop loading and the next level's parents start
    /// loading in the same installed root, so no other operation can observe
    /// the merged rows without also seeing which of them are being fetched.
    fn apply(&self, state: &mut State, batch: &Batch, pages: &[Page], epoch: Epoch) -> Result<Applied> {
        let depth = state.tree_query.path.len();
        let mut next = Arc::clone(&state.root);
        let mut targets = Vec::with_capacity(pages.len());
        let mut expandable: Vec<BreakdownId> = Vec::new();
        let mut rows = 0;

        for page in pages {
            let target = batch.target_for(page)?;
            let report = merge(&mut next, &target, page, batch.limit, depth)?;
            rows += report.appended.len();
            expandable.extend(report.expandable);
            targets.push(report.target);
        }
        for parent in &batch.parents {
            if !targets.contains(parent) {
                warn!(parent = %parent, level = batch.level, "response carried no page for requested parent");
            }
        }

        let next_level = batch.level + 1;
        let follow_up = (next_level <= depth && !expandable.is_empty()).then(|| {
            Batch::first_page(
                next_level,
                expandable.into_iter().map(NodeRef::Node).collect(),
                self.options.page_size_for(next_level),
            )
        });
        set_loading(&mut next, &batch.parents, false);
        if let Some(follow_up) = follow_up.as_ref() {
            set_loading(&mut next, &follow_up.parents, true);
        }

        state.root = next;
        if batch.level == 1 {
            state.tree_loaded = true;
        }
        let revision = state.bump_revision();
        debug!(level = batch.level, rows, revision, "merged breakdown batch");

        Ok(Applied {
            event: ChangeEvent {
                kind: ChangeKind::Merged {
                    level: batch.level,
                    targets,
                    rows,
                },
                epoch,
                revision,
            },
            rows,
            next: follow_up,
        })
    }
}
