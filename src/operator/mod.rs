//! Incremental stage operators.
//!
//! Each stage of a compiled pipeline is one operator instance. Operators
//! receive signed deltas addressed by [`RowKey`], keep whatever state they
//! need to undo their own work exactly, and expose an effective-document
//! view so later stages can read transformed rows without materializing
//! a document array per stage.

mod count;
mod group;
mod lookup;
mod match_op;
mod project;
mod sort;
mod topk;
mod unwind;
mod window;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::delta::{Delta, RowKey};
use crate::error::{Error, Result};
use crate::store::{Rows, SideTables};

pub use count::CountOp;
pub use group::GroupOp;
pub use lookup::LookupOp;
pub use match_op::MatchOp;
pub use project::ProjectOp;
pub use sort::SortOp;
pub use topk::TopKOp;
pub use unwind::UnwindOp;
pub use window::WindowOp;

/// Identifier of one `execute` / `apply_deltas` invocation.
pub type RunId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub can_increment: bool,
    pub can_decrement: bool,
    /// One input row may produce several output rows.
    pub expands: bool,
    /// Output rows live in the group-key identifier space.
    pub aggregates: bool,
    /// Output depends on the order of the input.
    pub order_sensitive: bool,
}

impl Capabilities {
    pub(crate) fn incremental() -> Self {
        Self {
            can_increment: true,
            can_decrement: true,
            ..Self::default()
        }
    }
}

pub trait Operator: Send {
    fn name(&self) -> &'static str;

    /// Handle a `+1` delta. Deltas of the other sign are ignored.
    fn on_add(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>>;

    /// Handle a `-1` delta by undoing exactly what `on_add` did for the row,
    /// using stored state only.
    fn on_remove(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>>;

    /// Rebuild all state from the upstream active list and return this
    /// stage's output. Calling it twice yields the same output.
    fn snapshot(&mut self, input: Vec<RowKey>, ctx: &mut StageContext<'_>) -> Result<Vec<RowKey>>;

    /// Output list derived from maintained state, given the upstream list.
    fn active_rows(&mut self, input: Vec<RowKey>, ctx: &mut StageContext<'_>)
        -> Result<Vec<RowKey>>;

    /// This stage's view of `row`.
    fn effective_document(&self, row: &RowKey, upstream: &Resolver<'_>) -> Option<Arc<Value>>;

    fn capabilities(&self) -> Capabilities;

    fn reset(&mut self, tables: &mut SideTables);

    fn apply(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if delta.is_add() {
            self.on_add(delta, ctx)
        } else {
            self.on_remove(delta, ctx)
        }
    }
}

/// Effective-document lookup through the operators upstream of a stage,
/// ending at the row store.
#[derive(Clone, Copy)]
pub struct Resolver<'a> {
    ops: &'a [Box<dyn Operator>],
    rows: &'a Rows,
}

impl<'a> Resolver<'a> {
    pub fn new(ops: &'a [Box<dyn Operator>], rows: &'a Rows) -> Self {
        Self { ops, rows }
    }

    pub fn rows(&self) -> &'a Rows {
        self.rows
    }

    pub fn resolve(&self, row: &RowKey) -> Option<Arc<Value>> {
        match self.ops.split_last() {
            Some((last, rest)) => last.effective_document(row, &Resolver::new(rest, self.rows)),
            None => row.row_id().and_then(|id| self.rows.get(id)).cloned(),
        }
    }
}

/// Everything an operator may touch while handling one call.
pub struct StageContext<'a> {
    pub run: RunId,
    pub config: &'a EngineConfig,
    pub tables: &'a mut SideTables,
    pub upstream: Resolver<'a>,
    /// The stage reads base rows straight from the store.
    pub first_stage: bool,
}

impl StageContext<'_> {
    pub fn resolve(&self, row: &RowKey) -> Option<Arc<Value>> {
        self.upstream.resolve(row)
    }

    /// `Err(InvariantViolation)` in debug mode, `Ok` otherwise.
    pub fn check(&self, ok: bool, what: impl FnOnce() -> String) -> Result<()> {
        if !ok && self.config.debug_assertions {
            return Err(Error::InvariantViolation(what()));
        }
        Ok(())
    }
}

/// Scratch list reused across runs. Every write starts by clearing the
/// contents and re-tagging them with the writing run.
#[derive(Debug)]
pub struct RunBuffer<T> {
    run: Option<RunId>,
    items: Vec<T>,
}

impl<T> Default for RunBuffer<T> {
    fn default() -> Self {
        Self {
            run: None,
            items: Vec::new(),
        }
    }
}

impl<T: Clone> RunBuffer<T> {
    pub fn fill(&mut self, run: RunId, items: impl IntoIterator<Item = T>) {
        self.items.clear();
        self.items.extend(items);
        self.run = Some(run);
    }

    pub fn is_current(&self, run: RunId) -> bool {
        self.run == Some(run)
    }

    /// Contents written during `run`. Reading another run's contents is an
    /// invariant violation.
    pub fn read(&self, run: RunId) -> Result<&[T]> {
        match self.run {
            Some(tag) if tag == run => Ok(&self.items),
            tag => Err(Error::InvariantViolation(format!(
                "stale buffer: tagged {tag:?}, read in run {run}"
            ))),
        }
    }

    pub fn invalidate(&mut self) {
        self.items.clear();
        self.run = None;
    }
}
