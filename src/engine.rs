use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::compile::{CacheStats, ExprCache};
use crate::config::EngineConfig;
use crate::delta::Delta;
use crate::document::RowId;
use crate::error::{Error, Result};
use crate::operator::RunId;
use crate::pipeline::Pipeline;
use crate::plan::{ExecutionPlan, PlanId, PlanInfo};
use crate::store::RowStore;

/// The main oxiview engine: one source collection, any number of compiled
/// pipelines maintained over it, and static foreign collections for
/// `$lookup`.
///
/// Single writer: every method that touches documents or plans takes
/// `&mut self`. Mutating the store does not touch any plan; callers feed the
/// resulting deltas to the plans they want kept current via
/// [`Engine::apply_deltas`].
pub struct Engine {
    config: EngineConfig,
    store: RowStore,
    cache: ExprCache,
    plans: HashMap<PlanId, ExecutionPlan>,
    /// Canonical pipeline text → compiled plan.
    plan_ids: HashMap<String, PlanId>,
    collections: HashMap<String, Vec<Arc<Value>>>,
    next_plan: PlanId,
    last_run: RunId,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            cache: ExprCache::new(config.compile_expressions),
            config,
            store: RowStore::new(),
            plans: HashMap::new(),
            plan_ids: HashMap::new(),
            collections: HashMap::new(),
            next_plan: 1,
            last_run: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn next_run(&mut self) -> RunId {
        self.last_run += 1;
        self.last_run
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    /// Store a document and return its row id. Feed `Delta::insert(id)` to
    /// plans that should see it.
    pub fn add_document(&mut self, doc: Value) -> Result<RowId> {
        self.store.insert(doc)
    }

    /// Remove a document from the store. Plans still holding the row expect
    /// `Delta::delete(id)`.
    pub fn remove_document(&mut self, id: RowId) -> Result<()> {
        self.store.remove(id)?;
        Ok(())
    }

    /// Replace a document in place and return the deltas that move plans
    /// from the old version to the new one.
    pub fn update_document(&mut self, id: RowId, doc: Value) -> Result<Vec<Delta>> {
        self.store.replace(id, doc)?;
        Ok(vec![Delta::delete(id), Delta::insert(id)])
    }

    pub fn get_document(&self, id: RowId) -> Option<Value> {
        self.store.get(id).map(|doc| doc.as_ref().clone())
    }

    /// Number of live documents.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Register (or replace) a static foreign collection for `$lookup`.
    /// Plans compiled earlier keep the version they were built with.
    pub fn register_collection(&mut self, name: &str, docs: Vec<Value>) {
        let docs: Vec<Arc<Value>> = docs.into_iter().map(Arc::new).collect();
        debug!(collection = name, docs = docs.len(), "registered collection");
        self.collections.insert(name.to_string(), docs);
    }

    // -----------------------------------------------------------------------
    // Pipelines
    // -----------------------------------------------------------------------

    /// Compile a pipeline and bootstrap it from the current live rows.
    /// Structurally identical pipelines share one plan.
    pub fn compile_pipeline(&mut self, stages: &Value) -> Result<PlanId> {
        let pipeline = Pipeline::parse(stages)?;
        if let Some(id) = self.plan_ids.get(pipeline.source()) {
            return Ok(*id);
        }

        let id = self.next_plan;
        self.next_plan += 1;
        let prefix = format!("plan{id}");
        let mut plan = ExecutionPlan::build(
            id,
            &prefix,
            &pipeline,
            &mut self.cache,
            &self.collections,
            &self.config,
        )?;

        let run = self.next_run();
        let (rows, tables) = self.store.parts();
        if let Err(e) = plan.bootstrap(run, rows, tables, &self.config) {
            self.store.drop_group_tables(&format!("{prefix}/"));
            return Err(e);
        }
        self.plan_ids.insert(pipeline.source().to_string(), id);
        self.plans.insert(id, plan);
        Ok(id)
    }

    /// Forget a compiled plan and its group tables.
    pub fn drop_pipeline(&mut self, id: PlanId) -> Result<()> {
        self.plans.remove(&id).ok_or(Error::PlanNotFound(id))?;
        self.plan_ids.retain(|_, plan| *plan != id);
        self.store.drop_group_tables(&format!("plan{id}/"));
        Ok(())
    }

    /// Apply a delta set to one plan and return its refreshed output. The
    /// whole set is rejected with `InvalidDelta` if any delta does not fit
    /// the plan's current rows; nothing is applied in that case.
    pub fn apply_deltas(&mut self, deltas: &[Delta], id: PlanId) -> Result<Vec<Value>> {
        let run = self.next_run();
        let plan = self.plans.get_mut(&id).ok_or(Error::PlanNotFound(id))?;
        let (rows, tables) = self.store.parts();
        plan.apply(run, deltas, rows, tables, &self.config)
    }

    /// Run a pipeline from scratch over the live rows with fresh operators.
    /// Independent of every compiled plan: expressions compile into a
    /// throwaway cache, and group tables and dimensions created for the run
    /// are dropped afterwards.
    pub fn execute(&mut self, stages: &Value) -> Result<Vec<Value>> {
        let pipeline = Pipeline::parse(stages)?;
        let run = self.next_run();
        let prefix = format!("execute{run}");
        let mut cache = ExprCache::new(self.config.compile_expressions);
        let mut plan = ExecutionPlan::build(
            0,
            &prefix,
            &pipeline,
            &mut cache,
            &self.collections,
            &self.config,
        )?;
        let (rows, tables) = self.store.parts();
        let dimensions = tables.dimension_fields();
        let result = plan.bootstrap(run, rows, tables, &self.config);
        tables.retain_dimensions(&dimensions);
        tables.drop_group_tables(&format!("{prefix}/"));
        result
    }

    /// Output of the plan as of its last run.
    pub fn results(&self, id: PlanId) -> Result<Vec<Value>> {
        let plan = self.plans.get(&id).ok_or(Error::PlanNotFound(id))?;
        Ok(plan.results().to_vec())
    }

    /// Drop every document and reset every plan to empty. Compiled plans
    /// stay valid.
    pub fn clear(&mut self) {
        let (_, tables) = self.store.parts();
        for plan in self.plans.values_mut() {
            plan.reset(tables);
        }
        self.store.clear();
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub fn plan_info(&self, id: PlanId) -> Result<PlanInfo> {
        self.plans
            .get(&id)
            .map(ExecutionPlan::info)
            .ok_or(Error::PlanNotFound(id))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
