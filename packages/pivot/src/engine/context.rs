//! A pivot as a pipeline stage: rows in through the input port, a patched
//! tree and traversal view out.

use super::aggregate::{Aggregator, StandardAggregator};
use super::notify::notify_sparse_tree;
use super::pivot_tree::PivotTree;
use super::pool::{DataSignal, Stage};
use super::store::RowStore;
use super::strand::{GroupingStrandBuilder, StrandBuilder};
use super::traversal::{SortSpec, TraversalNode, TraversalView};
use super::types::{FastHashSet, NodeIdx, PivotPath, RowUpdate};
use super::update::{compute_view_hash, flat_rows, FlatRow, ViewDelta};
use crate::config::PivotConfig;
use crate::error::{PivotError, Result};
use smol_str::SmolStr;
use std::any::Any;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

/// Thread-safe queue of row updates feeding one context. Sending marks the
/// pool's data signal.
#[derive(Debug, Clone)]
pub struct InputPort {
    queue: Arc<Mutex<Vec<RowUpdate>>>,
    signal: DataSignal,
}

impl InputPort {
    pub fn new(signal: DataSignal) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            signal,
        }
    }

    pub fn send(&self, update: RowUpdate) -> Result<()> {
        self.send_batch(std::iter::once(update))
    }

    pub fn send_batch(&self, updates: impl IntoIterator<Item = RowUpdate>) -> Result<()> {
        let mut queue = self.lock()?;
        let before = queue.len();
        queue.extend(updates);
        if queue.len() > before {
            self.signal.mark();
        }
        Ok(())
    }

    /// Takes everything queued so far.
    pub fn drain(&self) -> Result<Vec<RowUpdate>> {
        Ok(std::mem::take(&mut *self.lock()?))
    }

    pub fn pending(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<RowUpdate>>> {
        self.queue.lock().map_err(|_| PivotError::Poisoned("input port"))
    }
}

pub struct PivotContext {
    name: SmolStr,
    config: PivotConfig,
    store: RowStore,
    tree: PivotTree,
    view: Option<TraversalView>,
    builder: Box<dyn StrandBuilder>,
    aggregator: Box<dyn Aggregator>,
    input: InputPort,
    output: Option<ViewDelta>,
}

impl std::fmt::Debug for PivotContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PivotContext")
            .field("name", &self.name)
            .field("nodes", &self.tree.len())
            .field("rows", &self.view.as_ref().map(TraversalView::len))
            .finish_non_exhaustive()
    }
}

impl PivotContext {
    pub fn new(name: impl Into<SmolStr>, config: PivotConfig, signal: DataSignal) -> Result<Self> {
        Self::with_components(
            name,
            config,
            signal,
            Box::new(GroupingStrandBuilder),
            Box::new(StandardAggregator),
        )
    }

    pub fn with_components(
        name: impl Into<SmolStr>,
        config: PivotConfig,
        signal: DataSignal,
        builder: Box<dyn StrandBuilder>,
        aggregator: Box<dyn Aggregator>,
    ) -> Result<Self> {
        config.validate()?;
        let tree = PivotTree::new(config.pivots.len(), config.aggregates.clone(), aggregator.as_ref());
        let view = if config.process_traversal {
            Some(TraversalView::new(&tree, config.expand_depth, &config.sort)?)
        } else {
            None
        };
        Ok(Self {
            name: name.into(),
            config,
            store: RowStore::new(),
            tree,
            view,
            builder,
            aggregator,
            input: InputPort::new(signal),
            output: None,
        })
    }

    /// Producer handle; clone it into other threads.
    pub fn input(&self) -> InputPort {
        self.input.clone()
    }

    /// Applies one batch and patches tree and view. On failure the store is
    /// rolled back and tree and view are left as they were.
    #[instrument(level = "debug", skip_all, fields(context = %self.name, updates = updates.len()))]
    pub fn step(&mut self, updates: Vec<RowUpdate>) -> Result<ViewDelta> {
        let changes = self.store.apply_batch(updates);
        let result = self
            .builder
            .build(&changes, &self.config)
            .and_then(|strands| {
                notify_sparse_tree(
                    &strands,
                    &mut self.tree,
                    self.view.as_mut(),
                    self.aggregator.as_ref(),
                    &self.store,
                )
            });
        if result.is_err() {
            self.store.revert(&changes);
        }
        result
    }

    // --- View operations ---

    /// Expands the row; returns the number of rows revealed.
    pub fn expand(&mut self, row: usize) -> usize {
        match self.view.as_mut() {
            Some(view) => view.expand(&self.tree, row),
            None => 0,
        }
    }

    pub fn collapse(&mut self, row: usize) -> usize {
        self.view.as_mut().map_or(0, |view| view.collapse(row))
    }

    pub fn set_depth(&mut self, depth: usize) {
        self.config.expand_depth = Some(depth);
        if let Some(view) = self.view.as_mut() {
            view.set_depth(&self.tree, depth);
        }
    }

    pub fn sort_by(&mut self, sort: Vec<SortSpec>) -> Result<()> {
        if let Some(view) = self.view.as_mut() {
            view.sort_by(&self.tree, &sort)?;
        }
        self.config.sort = sort;
        Ok(())
    }

    /// Pivot path shown at `row`; empty when the row does not exist.
    pub fn get_path(&self, row: usize) -> PivotPath {
        self.view
            .as_ref()
            .map(|view| view.path(&self.tree, row))
            .unwrap_or_default()
    }

    /// Paths of expanded nodes in row order. Survives node index reuse,
    /// unlike the raw index list.
    pub fn expansion_state(&self) -> Vec<PivotPath> {
        self.view
            .as_ref()
            .map(|view| {
                view.get_expanded()
                    .into_iter()
                    .map(|idx| self.tree.path(idx))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-expands exactly the nodes at `paths`; unknown paths are ignored.
    pub fn apply_expansion_state(&mut self, paths: &[PivotPath]) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        let expanded: FastHashSet<NodeIdx> = paths.iter().filter_map(|p| self.tree.find(p)).collect();
        view.set_expanded(&self.tree, &expanded);
    }

    /// Sets the view depth to `stop_depth`, applies `sort` if given, then
    /// returns the subtree of the node that was at `row`.
    pub fn get_flattened_tree(
        &mut self,
        row: usize,
        stop_depth: usize,
        sort: Option<Vec<SortSpec>>,
    ) -> Result<Vec<TraversalNode>> {
        let Some(tree_idx) = self.view.as_ref().and_then(|v| v.get_tree_index(row)) else {
            return Ok(Vec::new());
        };
        self.set_depth(stop_depth);
        if let Some(sort) = sort {
            self.sort_by(sort)?;
        }
        let Some(view) = self.view.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(match view.tree_index_lookup(tree_idx, row) {
            Some(row) => view.get_flattened_tree(row, Some(stop_depth)),
            None => Vec::new(),
        })
    }

    // --- Output ---

    pub fn has_deltas(&self) -> bool {
        self.tree.has_deltas()
    }

    pub fn take_has_deltas(&mut self) -> bool {
        self.tree.take_has_deltas()
    }

    pub fn view_hash(&self) -> Option<String> {
        self.view.as_ref().map(|view| compute_view_hash(view, &self.tree))
    }

    pub fn rows(&self) -> Vec<FlatRow> {
        self.view
            .as_ref()
            .map(|view| flat_rows(view, &self.tree))
            .unwrap_or_default()
    }

    /// Delta of the last processed cycle, until outputs are cleared.
    pub fn output(&self) -> Option<&ViewDelta> {
        self.output.as_ref()
    }

    // --- Accessors ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PivotConfig {
        &self.config
    }

    pub fn tree(&self) -> &PivotTree {
        &self.tree
    }

    pub fn view(&self) -> Option<&TraversalView> {
        self.view.as_ref()
    }

    pub fn store(&self) -> &RowStore {
        &self.store
    }
}

impl Stage for PivotContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self) -> anyhow::Result<()> {
        let updates = self.input.drain()?;
        if updates.is_empty() {
            return Ok(());
        }
        let delta = self.step(updates)?;
        debug!(context = %self.name, changes = delta.len(), "context processed");
        self.output = Some(delta);
        Ok(())
    }

    fn clear_output_ports(&mut self) {
        self.output = None;
    }

    fn has_pending(&self) -> bool {
        // a poisoned port reports pending so the next cycle surfaces the error
        self.input.pending().map_or(true, |n| n > 0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
