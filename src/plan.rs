//! Compiled execution plans.
//!
//! A plan owns one operator per pipeline stage plus the set of base rows it
//! has been fed. Deltas are validated against that set before any of them
//! is applied, then pushed through the operator chain one at a time.
//! Materialization walks the chain again, asking every stage for its active
//! rows, and resolves the final list to documents.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::compile::ExprCache;
use crate::config::EngineConfig;
use crate::delta::{Delta, RowKey};
use crate::document::{is_virtual, RowId};
use crate::error::{Error, Result};
use crate::operator::{
    Capabilities, CountOp, GroupOp, LookupOp, MatchOp, Operator, ProjectOp, Resolver, RunBuffer,
    RunId, SortOp, StageContext, TopKOp, UnwindOp, WindowOp,
};
use crate::pipeline::{Pipeline, Stage};
use crate::store::{Rows, SideTables};

pub type PlanId = u64;

/// Dominant cost of a full snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ComplexityClass {
    Linear,
    LinearLogK,
    Linearithmic,
}

/// Diagnostic summary of a plan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInfo {
    pub id: PlanId,
    pub pipeline: String,
    pub stages: Vec<String>,
    pub capabilities: Vec<Capabilities>,
    pub can_increment: bool,
    pub can_decrement: bool,
    pub complexity: ComplexityClass,
    pub rows: usize,
}

#[derive(Clone, Copy)]
enum Pass {
    Snapshot,
    Active,
}

pub struct ExecutionPlan {
    id: PlanId,
    pipeline: String,
    ops: Vec<Box<dyn Operator>>,
    can_increment: bool,
    can_decrement: bool,
    complexity: ComplexityClass,
    /// Base rows currently fed into the first stage.
    members: BTreeSet<RowId>,
    /// Output list of each stage, tagged with the run that wrote it.
    buffers: Vec<RunBuffer<RowKey>>,
    results: Vec<Value>,
}

impl ExecutionPlan {
    /// Instantiate operators for `pipeline`. Group tables are named
    /// `{table_prefix}/stage{n}`.
    pub fn build(
        id: PlanId,
        table_prefix: &str,
        pipeline: &Pipeline,
        cache: &mut ExprCache,
        collections: &HashMap<String, Vec<Arc<Value>>>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let stages = pipeline.stages();
        let mut ops: Vec<Box<dyn Operator>> = Vec::with_capacity(stages.len());
        for (n, stage) in stages.iter().enumerate() {
            let reordered = stages[..n].iter().any(Stage::is_reordering);
            let op: Box<dyn Operator> = match stage {
                Stage::Match(body) => Box::new(MatchOp::new(body, cache)?),
                Stage::Group { key, accumulators } => Box::new(GroupOp::new(
                    format!("{table_prefix}/stage{n}"),
                    key,
                    accumulators,
                    reordered,
                    cache,
                )),
                Stage::Sort(keys) => Box::new(SortOp::new(keys.clone())),
                Stage::Skip(count) => Box::new(WindowOp::skip(*count)),
                Stage::Limit(count) => Box::new(WindowOp::limit(*count)),
                Stage::TopK { keys, k } => Box::new(TopKOp::new(keys.clone(), *k)),
                Stage::Project(fields) => Box::new(ProjectOp::project(fields, cache)),
                Stage::AddFields(fields) => Box::new(ProjectOp::add_fields(fields, cache)),
                Stage::Unwind(spec) => Box::new(UnwindOp::new(spec.clone())),
                Stage::Lookup(spec) => {
                    let foreign = collections.get(&spec.from).map_or(&[][..], Vec::as_slice);
                    Box::new(LookupOp::new(spec.clone(), foreign))
                }
                Stage::Count(field) => Box::new(CountOp::new(field.clone())),
            };
            ops.push(op);
        }

        let blocker = incremental_blocker(stages, &ops, config);
        if let Some(reason) = &blocker {
            if config.incremental {
                warn!(plan = id, %reason, "plan falls back to full recompute");
            }
        }
        let supported = |flag: fn(&Capabilities) -> bool| {
            blocker.is_none() && ops.iter().all(|op| flag(&op.capabilities()))
        };
        let can_increment = supported(|c: &Capabilities| c.can_increment);
        let can_decrement = supported(|c: &Capabilities| c.can_decrement);
        let complexity = complexity_of(stages);

        debug!(
            plan = id,
            stages = stages.len(),
            can_increment,
            can_decrement,
            ?complexity,
            "compiled pipeline"
        );
        Ok(Self {
            id,
            pipeline: pipeline.source().to_string(),
            buffers: (0..ops.len()).map(|_| RunBuffer::default()).collect(),
            ops,
            can_increment,
            can_decrement,
            complexity,
            members: BTreeSet::new(),
            results: Vec::new(),
        })
    }

    pub fn id(&self) -> PlanId {
        self.id
    }

    pub fn is_incremental(&self) -> bool {
        self.can_increment && self.can_decrement
    }

    pub fn complexity(&self) -> ComplexityClass {
        self.complexity
    }

    pub fn info(&self) -> PlanInfo {
        PlanInfo {
            id: self.id,
            pipeline: self.pipeline.clone(),
            stages: self.ops.iter().map(|op| op.name().to_string()).collect(),
            capabilities: self.ops.iter().map(|op| op.capabilities()).collect(),
            can_increment: self.can_increment,
            can_decrement: self.can_decrement,
            complexity: self.complexity,
            rows: self.members.len(),
        }
    }

    /// Last materialized output.
    pub fn results(&self) -> &[Value] {
        &self.results
    }

    /// Feed every live row of the store and take a full snapshot.
    pub fn bootstrap(
        &mut self,
        run: RunId,
        rows: &Rows,
        tables: &mut SideTables,
        config: &EngineConfig,
    ) -> Result<Vec<Value>> {
        self.members = rows.live_ids().collect();
        self.snapshot(run, rows, tables, config)
    }

    /// Rebuild every stage from the current members.
    pub fn snapshot(
        &mut self,
        run: RunId,
        rows: &Rows,
        tables: &mut SideTables,
        config: &EngineConfig,
    ) -> Result<Vec<Value>> {
        self.run_stages(Pass::Snapshot, run, rows, tables, config)?;
        self.materialize(run, rows, config)
    }

    /// Apply a delta set atomically: either every delta is valid for the
    /// current members and all are applied, or none is.
    pub fn apply(
        &mut self,
        run: RunId,
        deltas: &[Delta],
        rows: &Rows,
        tables: &mut SideTables,
        config: &EngineConfig,
    ) -> Result<Vec<Value>> {
        self.validate(deltas, rows)?;

        if !self.is_incremental() {
            for delta in deltas {
                self.track(delta);
            }
            debug!(plan = self.id, deltas = deltas.len(), "full recompute");
            return self.snapshot(run, rows, tables, config);
        }

        for delta in deltas {
            self.track(delta);
            self.propagate(run, delta, rows, tables, config)?;
        }
        self.run_stages(Pass::Active, run, rows, tables, config)?;
        self.materialize(run, rows, config)
    }

    pub fn reset(&mut self, tables: &mut SideTables) {
        for op in &mut self.ops {
            op.reset(tables);
        }
        for buffer in &mut self.buffers {
            buffer.invalidate();
        }
        self.members.clear();
        self.results.clear();
    }

    fn validate(&self, deltas: &[Delta], rows: &Rows) -> Result<()> {
        let mut overlay: HashMap<RowId, bool> = HashMap::new();
        for delta in deltas {
            let id = match delta.row.row_id() {
                Some(id) if !is_virtual(id) => id,
                _ => {
                    return Err(Error::InvalidDelta(format!(
                        "{} is not a stored document row",
                        delta.row
                    )));
                }
            };
            let present = overlay
                .get(&id)
                .copied()
                .unwrap_or_else(|| self.members.contains(&id));
            if delta.is_add() {
                if present {
                    return Err(Error::InvalidDelta(format!("row {id} is already present")));
                }
                if !rows.is_live(id) {
                    return Err(Error::InvalidDelta(format!("row {id} is not live")));
                }
            } else if !present {
                return Err(Error::InvalidDelta(format!("row {id} is not present")));
            }
            overlay.insert(id, delta.is_add());
        }
        Ok(())
    }

    fn track(&mut self, delta: &Delta) {
        if let Some(id) = delta.row.row_id() {
            if delta.is_add() {
                self.members.insert(id);
            } else {
                self.members.remove(&id);
            }
        }
    }

    fn propagate(
        &mut self,
        run: RunId,
        delta: &Delta,
        rows: &Rows,
        tables: &mut SideTables,
        config: &EngineConfig,
    ) -> Result<()> {
        let mut pending = vec![delta.clone()];
        for n in 0..self.ops.len() {
            if pending.is_empty() {
                break;
            }
            let (upstream, rest) = self.ops.split_at_mut(n);
            let Some(op) = rest.first_mut() else {
                break;
            };
            let mut ctx = StageContext {
                run,
                config,
                tables: &mut *tables,
                upstream: Resolver::new(upstream, rows),
                first_stage: n == 0,
            };
            let mut next = Vec::new();
            for d in &pending {
                trace!(
                    plan = self.id,
                    stage = n,
                    op = op.name(),
                    row = %d.row,
                    sign = d.sign.as_i32(),
                    "delta"
                );
                next.extend(op.apply(d, &mut ctx)?);
            }
            pending = next;
        }
        Ok(())
    }

    /// Walk the chain, writing each stage's output into its run buffer.
    fn run_stages(
        &mut self,
        pass: Pass,
        run: RunId,
        rows: &Rows,
        tables: &mut SideTables,
        config: &EngineConfig,
    ) -> Result<()> {
        for n in 0..self.ops.len() {
            let input = match n {
                0 => self.members.iter().map(|id| RowKey::Row(*id)).collect(),
                _ => self.buffers[n - 1].read(run)?.to_vec(),
            };
            let (upstream, rest) = self.ops.split_at_mut(n);
            let Some(op) = rest.first_mut() else {
                break;
            };
            let mut ctx = StageContext {
                run,
                config,
                tables: &mut *tables,
                upstream: Resolver::new(upstream, rows),
                first_stage: n == 0,
            };
            let output = match pass {
                Pass::Snapshot => op.snapshot(input, &mut ctx)?,
                Pass::Active => op.active_rows(input, &mut ctx)?,
            };
            self.buffers[n].fill(run, output);
        }
        Ok(())
    }

    fn materialize(&mut self, run: RunId, rows: &Rows, config: &EngineConfig) -> Result<Vec<Value>> {
        let listed: Vec<RowKey> = match self.buffers.last() {
            Some(buffer) => buffer.read(run)?.to_vec(),
            None => self.members.iter().map(|id| RowKey::Row(*id)).collect(),
        };
        let resolver = Resolver::new(&self.ops, rows);
        let mut out = Vec::with_capacity(listed.len());
        for row in &listed {
            match resolver.resolve(row) {
                Some(doc) => out.push(doc.as_ref().clone()),
                None if config.debug_assertions => {
                    return Err(Error::InvariantViolation(format!(
                        "plan {}: {row} is listed but does not resolve",
                        self.id
                    )));
                }
                None => {}
            }
        }
        self.results = out.clone();
        Ok(out)
    }
}

/// Why the plan has to be refreshed by full snapshot, if it has to.
fn incremental_blocker(
    stages: &[Stage],
    ops: &[Box<dyn Operator>],
    config: &EngineConfig,
) -> Option<String> {
    if !config.incremental {
        return Some("incremental maintenance disabled".to_string());
    }
    for (n, (stage, op)) in stages.iter().zip(ops).enumerate() {
        let upstream = &stages[..n];
        // Aggregates keep their own output list, which ignores any window
        // applied upstream.
        if stage.is_aggregating() && upstream.iter().any(Stage::is_windowing) {
            return Some(format!("{} downstream of a window", stage.name()));
        }
        if matches!(stage, Stage::Group { .. })
            && op.capabilities().order_sensitive
            && upstream.iter().any(Stage::is_reordering)
        {
            return Some("order-sensitive accumulator downstream of a reordering stage".to_string());
        }
    }
    None
}

fn complexity_of(stages: &[Stage]) -> ComplexityClass {
    stages
        .iter()
        .map(|stage| match stage {
            Stage::Sort(_) | Stage::Group { .. } => ComplexityClass::Linearithmic,
            Stage::TopK { .. } => ComplexityClass::LinearLogK,
            _ => ComplexityClass::Linear,
        })
        .max()
        .unwrap_or(ComplexityClass::Linear)
}
