//! Two-stage query pipeline: stage-1 pruning, then the full catalog over the
//! surviving scans.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;
use tempfile::TempDir;
use tracing::info;

use crate::catalog::QueryCatalog;
use crate::domain::{QueryDefinition, QueryResult, QuerySubset, ScanId};
use crate::error::KiraError;
use crate::mgf::{MaterializedSource, ScanStore};
use crate::runner::QueryRunner;

/// Per-run scratch space and stage results. Every file materialized for the
/// run lives under `work_dir` and is removed when the context is dropped.
#[derive(Debug)]
pub struct PipelineContext {
    work_dir: TempDir,
    stage1_results: Vec<QueryResult>,
}

impl PipelineContext {
    pub fn new() -> Result<Self, KiraError> {
        let work_dir = tempfile::Builder::new()
            .prefix("kira-ba-run")
            .tempdir()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(Self {
            work_dir,
            stage1_results: Vec::new(),
        })
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn stage1_results(&self) -> &[QueryResult] {
        &self.stage1_results
    }
}

/// Scans that passed at least one stage-1 query, in memory and on disk.
#[derive(Debug)]
pub struct ReducedSource {
    store: ScanStore,
    source: MaterializedSource,
}

impl ReducedSource {
    pub fn store(&self) -> &ScanStore {
        &self.store
    }

    pub fn path(&self) -> &Path {
        self.source.path()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub stage1_results: Vec<QueryResult>,
    pub kept_ids: BTreeSet<ScanId>,
    pub reduced_scan_count: usize,
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reduce { queries: usize, scans: usize },
    Full { queries: usize, scans: usize },
}

pub struct StagedPipeline<'e> {
    runner: QueryRunner<'e>,
}

impl<'e> StagedPipeline<'e> {
    pub fn new(runner: QueryRunner<'e>) -> Self {
        Self { runner }
    }

    pub fn stage1_reduce(
        &self,
        ctx: &mut PipelineContext,
        full: &ScanStore,
        stage1_queries: &[QueryDefinition],
    ) -> Result<(ReducedSource, BTreeSet<ScanId>), KiraError> {
        let results = if full.is_empty() {
            empty_results(stage1_queries)
        } else {
            let full_source = full.materialize(ctx.work_dir(), "full")?;
            self.runner.run(full_source.path(), stage1_queries)?
        };

        let kept_ids = results
            .iter()
            .flat_map(|result| result.matched_scan_ids.iter().cloned())
            .collect::<BTreeSet<_>>();
        let store = full.filter(&kept_ids);
        let source = store.materialize(ctx.work_dir(), "stage1-passed")?;
        info!(
            passed = store.len(),
            excluded = full.len() - store.len(),
            "stage 1 complete"
        );
        ctx.stage1_results = results;
        Ok((ReducedSource { store, source }, kept_ids))
    }

    /// Runs every query, stage-1 included, over the reduced source so each
    /// surviving scan records exactly which queries it satisfies.
    pub fn full_classify(
        &self,
        reduced: &ReducedSource,
        all_queries: &[QueryDefinition],
    ) -> Result<Vec<QueryResult>, KiraError> {
        if reduced.is_empty() {
            info!("no scans passed stage 1, skipping full catalog");
            return Ok(empty_results(all_queries));
        }
        self.runner.run(reduced.path(), all_queries)
    }

    /// Stage-1 reduction followed by the full catalog. `on_stage` is called
    /// before each stage starts.
    pub fn run(
        &self,
        ctx: &mut PipelineContext,
        full: &ScanStore,
        catalog: &QueryCatalog,
        mut on_stage: impl FnMut(Stage),
    ) -> Result<PipelineOutcome, KiraError> {
        let stage1 = catalog.subset(QuerySubset::Stage1);
        on_stage(Stage::Reduce {
            queries: stage1.len(),
            scans: full.len(),
        });
        let (reduced, kept_ids) = self.stage1_reduce(ctx, full, &stage1)?;
        on_stage(Stage::Full {
            queries: catalog.len(),
            scans: reduced.store().len(),
        });
        let results = self.full_classify(&reduced, catalog.all())?;
        Ok(PipelineOutcome {
            stage1_results: ctx.stage1_results().to_vec(),
            kept_ids,
            reduced_scan_count: reduced.store().len(),
            results,
        })
    }
}

fn empty_results(queries: &[QueryDefinition]) -> Vec<QueryResult> {
    queries
        .iter()
        .map(|query| QueryResult::empty(&query.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::engine::{QueryEngine, QueryTable};
    use crate::runner::RunOptions;

    /// Matches a scan when its block text contains the query pattern.
    #[derive(Default)]
    struct ContainsEngine {
        calls: Mutex<Vec<String>>,
    }

    impl QueryEngine for ContainsEngine {
        fn execute(
            &self,
            pattern: &str,
            source: &Path,
            _parallel: bool,
        ) -> Result<QueryTable, KiraError> {
            self.calls.lock().unwrap().push(pattern.to_string());
            let raw = std::fs::read(source).unwrap();
            let store = ScanStore::parse(&raw);
            let Ok(store) = store else {
                return Ok(QueryTable::empty());
            };
            let scans = store
                .blocks()
                .filter(|block| {
                    block
                        .lines()
                        .iter()
                        .any(|line| String::from_utf8_lossy(line).contains(pattern))
                })
                .filter_map(|block| block.id().map(|id| id.to_string()))
                .collect::<Vec<_>>();
            Ok(QueryTable::with_scans(scans))
        }
    }

    const MGF: &str = "\
BEGIN IONS
SCANS=1
TAG=alpha beta
10 20
END IONS
BEGIN IONS
SCANS=2
TAG=gamma
10 20
END IONS
BEGIN IONS
SCANS=3
TAG=alpha
10 20
END IONS
";

    fn catalog() -> QueryCatalog {
        QueryCatalog::new(vec![
            QueryDefinition::new("first_stage1", "alpha"),
            QueryDefinition::new("second_stage1", "nothing"),
            QueryDefinition::new("first_stage2", "beta"),
        ])
        .unwrap()
    }

    #[test]
    fn stage1_keeps_union_and_full_run_reuses_stage1_queries() {
        let engine = ContainsEngine::default();
        let pipeline = StagedPipeline::new(QueryRunner::new(&engine, RunOptions::default()));
        let mut ctx = PipelineContext::new().unwrap();
        let store = ScanStore::parse(MGF.as_bytes()).unwrap();

        let mut stages = Vec::new();
        let outcome = pipeline
            .run(&mut ctx, &store, &catalog(), |stage| stages.push(stage))
            .unwrap();

        assert_eq!(
            stages,
            vec![
                Stage::Reduce {
                    queries: 2,
                    scans: 3
                },
                Stage::Full {
                    queries: 3,
                    scans: 2
                },
            ]
        );

        let kept = outcome
            .kept_ids
            .iter()
            .map(ScanId::as_str)
            .collect::<Vec<_>>();
        assert_eq!(kept, vec!["1", "3"]);
        assert_eq!(outcome.reduced_scan_count, 2);
        assert_eq!(outcome.stage1_results.len(), 2);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.results[0].matched_scan_ids.len(), 2);
        assert_eq!(outcome.results[2].matched_scan_ids.len(), 1);
        assert_eq!(engine.calls.lock().unwrap().len(), 5);
    }

    #[test]
    fn nothing_passing_stage1_is_not_an_error() {
        let engine = ContainsEngine::default();
        let pipeline = StagedPipeline::new(QueryRunner::new(&engine, RunOptions::default()));
        let mut ctx = PipelineContext::new().unwrap();
        let store = ScanStore::parse(MGF.as_bytes()).unwrap();
        let stage1 = vec![QueryDefinition::new("x_stage1", "absent")];

        let (reduced, kept) = pipeline.stage1_reduce(&mut ctx, &store, &stage1).unwrap();
        assert!(kept.is_empty());
        assert!(reduced.is_empty());
        assert!(reduced.path().exists());

        let results = pipeline
            .full_classify(&reduced, catalog().all())
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.matched_scan_ids.is_empty()));
    }

    #[test]
    fn context_removes_materialized_files() {
        let engine = ContainsEngine::default();
        let pipeline = StagedPipeline::new(QueryRunner::new(&engine, RunOptions::default()));
        let mut ctx = PipelineContext::new().unwrap();
        let work_dir = ctx.work_dir().to_path_buf();
        let store = ScanStore::parse(MGF.as_bytes()).unwrap();
        let (reduced, _) = pipeline
            .stage1_reduce(&mut ctx, &store, &catalog().subset(QuerySubset::Stage1))
            .unwrap();
        drop(reduced);
        drop(ctx);
        assert!(!work_dir.exists());
    }
}
