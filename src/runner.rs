use std::collections::BTreeSet;
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::domain::{QueryDefinition, QueryResult, ScanId};
use crate::engine::{QueryEngine, QueryTable, SCAN_COLUMN};
use crate::error::KiraError;

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Passed through to the engine as its own per-scan parallelism flag.
    pub engine_parallel: bool,
    /// Upper bound on queries dispatched at once; `None` uses the rayon default.
    pub concurrency: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            engine_parallel: true,
            concurrency: None,
        }
    }
}

pub struct QueryRunner<'e> {
    engine: &'e dyn QueryEngine,
    options: RunOptions,
}

impl<'e> QueryRunner<'e> {
    pub fn new(engine: &'e dyn QueryEngine, options: RunOptions) -> Self {
        Self { engine, options }
    }

    /// One result per query, in input order. A failing query yields an empty
    /// match set; only an unreachable engine fails the batch.
    pub fn run(
        &self,
        source: &Path,
        queries: &[QueryDefinition],
    ) -> Result<Vec<QueryResult>, KiraError> {
        info!(queries = queries.len(), source = %source.display(), "running query batch");
        let outcomes = match self.options.concurrency {
            Some(1) => queries
                .iter()
                .map(|query| self.run_one(source, query))
                .collect::<Vec<_>>(),
            Some(threads) => match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
                Ok(pool) => pool.install(|| self.run_parallel(source, queries)),
                Err(err) => {
                    warn!("falling back to the global thread pool: {err}");
                    self.run_parallel(source, queries)
                }
            },
            None => self.run_parallel(source, queries),
        };
        outcomes.into_iter().collect()
    }

    fn run_parallel(
        &self,
        source: &Path,
        queries: &[QueryDefinition],
    ) -> Vec<Result<QueryResult, KiraError>> {
        queries
            .par_iter()
            .map(|query| self.run_one(source, query))
            .collect()
    }

    fn run_one(&self, source: &Path, query: &QueryDefinition) -> Result<QueryResult, KiraError> {
        info!("Running query: {}", query.name);
        match self
            .engine
            .execute(&query.pattern, source, self.options.engine_parallel)
        {
            Ok(table) => Ok(QueryResult {
                query_name: query.name.clone(),
                matched_scan_ids: matched_scans(&query.name, &table),
            }),
            Err(err @ KiraError::EngineUnavailable(_)) => Err(err),
            Err(err) => {
                warn!(query = %query.name, "query failed, recording no matches: {err}");
                Ok(QueryResult::empty(&query.name))
            }
        }
    }
}

fn matched_scans(query_name: &str, table: &QueryTable) -> BTreeSet<ScanId> {
    if table.is_empty() {
        return BTreeSet::new();
    }
    let Some(values) = table.column(SCAN_COLUMN) else {
        warn!(query = %query_name, "result has no {SCAN_COLUMN} column, recording no matches");
        return BTreeSet::new();
    };
    values
        .into_iter()
        .filter_map(|value| match value.parse::<ScanId>() {
            Ok(id) => Some(id),
            Err(_) => {
                debug!(query = %query_name, "skipping unusable scan value {value:?}");
                None
            }
        })
        .collect()
}
