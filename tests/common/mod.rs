#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use parking_lot::Mutex;
use strata::endpoint::{
    BreakdownRequest, CellEdit, Endpoint, EndpointError, MetaData, Page, PagePagination, Row,
};
use strata::tree::{StatValue, Stats};
use strata::types::Dimension;
use strata::BreakdownId;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strata=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

pub type Handler = Box<dyn Fn(&BreakdownRequest) -> Result<Vec<Page>, EndpointError> + Send + Sync>;

struct Hold {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// Endpoint driven by a closure, with request logging, failure injection and
/// the ability to park one request until the test releases it.
pub struct ScriptedEndpoint {
    handler: Handler,
    requests: Mutex<Vec<BreakdownRequest>>,
    failures: Mutex<VecDeque<EndpointError>>,
    hold: Mutex<Option<Hold>>,
    metadata_calls: AtomicUsize,
    edits: Mutex<Vec<CellEdit>>,
}

impl ScriptedEndpoint {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&BreakdownRequest) -> Result<Vec<Page>, EndpointError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            hold: Mutex::new(None),
            metadata_calls: AtomicUsize::new(0),
            edits: Mutex::new(Vec::new()),
        })
    }

    /// Synthetic endpoint where every parent at level `L` has `fanout[L - 1]` children.
    pub fn synthetic(fanout: &[usize]) -> Arc<Self> {
        Self::new(synthetic(fanout.to_vec(), true))
    }

    /// Like [`Self::synthetic`] but pages never report a row count.
    pub fn synthetic_uncounted(fanout: &[usize]) -> Arc<Self> {
        Self::new(synthetic(fanout.to_vec(), false))
    }

    pub fn requests(&self) -> Vec<BreakdownRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn edits(&self) -> Vec<CellEdit> {
        self.edits.lock().clone()
    }

    /// The next `count` fetches fail with a transport error.
    pub fn fail_next(&self, count: usize) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(EndpointError::request("connection reset"));
        }
    }

    /// Parks the next fetch. The first receiver fires once the request has
    /// arrived; sending on the returned sender lets it complete.
    pub fn hold_next(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.hold.lock() = Some(Hold {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }
}

#[async_trait]
impl Endpoint for ScriptedEndpoint {
    async fn metadata(&self) -> Result<MetaData, EndpointError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        Ok(MetaData {
            columns: Vec::new(),
            breakdown_groups: ["account", "campaign", "day"].into_iter().map(Dimension::from).collect(),
            base_level: 1,
        })
    }

    async fn fetch(&self, request: &BreakdownRequest) -> Result<Vec<Page>, EndpointError> {
        self.requests.lock().push(request.clone());
        let hold = self.hold.lock().take();
        if let Some(hold) = hold {
            let _ = hold.entered.send(());
            let _ = hold.release.await;
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        (self.handler)(request)
    }

    async fn save(&self, edit: &CellEdit) -> Result<Page, EndpointError> {
        self.edits.lock().push(edit.clone());
        if edit.field == "name" {
            return Err(EndpointError::Validation {
                field: edit.field.clone(),
                message: "name is read-only".into(),
            });
        }
        let mut stats = Stats::new();
        stats.insert("name".into(), StatValue::new(edit.breakdown_id.as_str()));
        stats.insert(edit.field.clone(), StatValue::editable(edit.value.clone()));
        Ok(Page {
            breakdown_id: None,
            level: edit.level,
            rows: vec![Row {
                breakdown_id: edit.breakdown_id.clone(),
                stats,
            }],
            pagination: PagePagination {
                offset: 0,
                limit: 1,
                count: Some(1),
            },
            totals: None,
        })
    }
}

/// Child `i` of parent `P` at a level grouped by `dim` is `P/dim:i`
/// (`dim:i` on level 1), so ids change when a level's dimension changes.
pub fn child_id(parent: Option<&BreakdownId>, dimension: &str, index: usize) -> String {
    match parent {
        Some(parent) => format!("{parent}/{dimension}:{index}"),
        None => format!("{dimension}:{index}"),
    }
}

fn synthetic(
    fanout: Vec<usize>,
    report_count: bool,
) -> impl Fn(&BreakdownRequest) -> Result<Vec<Page>, EndpointError> + Send + Sync + 'static {
    move |request: &BreakdownRequest| {
        let dimension = request
            .dimension()
            .ok_or_else(|| EndpointError::request("level outside path"))?
            .to_string();
        let total = fanout.get(request.level - 1).copied().unwrap_or(0);
        let parents: Vec<Option<BreakdownId>> = if request.level == 1 {
            vec![None]
        } else {
            request.breakdown_page.iter().cloned().map(Some).collect()
        };
        let end = (request.offset + request.limit).min(total);
        Ok(parents
            .into_iter()
            .map(|parent| {
                let rows = (request.offset..end)
                    .map(|idx| {
                        let id = child_id(parent.as_ref(), &dimension, idx);
                        let mut stats = Stats::new();
                        stats.insert("name".into(), StatValue::new(id.clone()));
                        stats.insert("clicks".into(), StatValue::editable(idx as i64));
                        Row {
                            breakdown_id: BreakdownId::new(id),
                            stats,
                        }
                    })
                    .collect();
                let totals = (request.level == 1).then(|| {
                    let mut totals = Stats::new();
                    totals.insert("clicks".into(), StatValue::new(total as i64));
                    totals
                });
                Page {
                    breakdown_id: parent,
                    level: request.level,
                    rows,
                    pagination: PagePagination {
                        offset: request.offset,
                        limit: request.limit,
                        count: report_count.then_some(total as i64),
                    },
                    totals,
                }
            })
            .collect())
    }
}

pub fn path(dims: &[&str]) -> strata::BreakdownPath {
    dims.iter().copied().collect()
}

/// Ids of the materialized children of `node`, in order.
pub fn child_ids(node: &strata::Node) -> Vec<String> {
    node.children
        .as_ref()
        .map(|children| {
            children
                .iter()
                .filter_map(|child| child.breakdown_id.as_ref().map(|id| id.to_string()))
                .collect()
        })
        .unwrap_or_default()
}
