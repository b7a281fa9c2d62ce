use std::fs::File;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::aggregate::{
    self, Aggregation, ClassifiedRecord, LibraryMatches, classified_records, feature_list,
};
use crate::classify::TreeMatcher;
use crate::config::ResolvedConfig;
use crate::domain::{QueryDefinition, QuerySubset, ScanId, TaskId};
use crate::engine::QueryEngine;
use crate::error::KiraError;
use crate::gnps::{LocalSourceProvider, RawTaskData, SourceProvider};
use crate::mgf::ScanStore;
use crate::pipeline::{PipelineContext, PipelineOutcome, Stage, StagedPipeline};
use crate::runner::QueryRunner;
use crate::store::{Metadata, Store};
use crate::taxonomy::ClassificationPath;

#[derive(Debug, Clone)]
pub enum AnnotateSource {
    Task(TaskId),
    Files {
        spectra: PathBuf,
        library: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct AnnotateOptions {
    pub no_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotateResult {
    pub source: String,
    pub action: String,
    pub total_scans: usize,
    pub stage1_passed: usize,
    pub outcome: PipelineOutcome,
    pub aggregation: Aggregation,
    pub classified: Vec<ClassifiedRecord>,
    pub features: Vec<(String, ScanId)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifyResult {
    pub table: String,
    pub total_records: usize,
    pub library_columns: Vec<String>,
    pub classified: Vec<ClassifiedRecord>,
    pub features: Vec<(String, ScanId)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueriesResult {
    pub subset: Option<String>,
    pub queries: Vec<QueryDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathsResult {
    pub categories: Vec<String>,
    pub paths: Vec<ClassificationPath>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheListResult {
    pub tasks: Vec<Metadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub cleared: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<P: SourceProvider, E: QueryEngine> {
    store: Store,
    provider: P,
    engine: E,
    config: ResolvedConfig,
}

impl<P: SourceProvider, E: QueryEngine> App<P, E> {
    pub fn new(store: Store, provider: P, engine: E, config: ResolvedConfig) -> Self {
        Self {
            store,
            provider,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Fetches one task's artifacts, runs both query stages and classifies
    /// every surviving scan.
    pub fn annotate(
        &self,
        source: AnnotateSource,
        options: AnnotateOptions,
        sink: &dyn ProgressSink,
    ) -> Result<AnnotateResult, KiraError> {
        let started = Instant::now();
        let (label, action, raw) = match source {
            AnnotateSource::Task(task) => {
                let (action, raw) = self.fetch_task(&task, &options, sink)?;
                (task.to_string(), action, raw)
            }
            AnnotateSource::Files { spectra, library } => {
                sink.event(ProgressEvent {
                    message: format!("phase=Resolve; reading {}", spectra.display()),
                    elapsed: None,
                });
                let label = spectra.display().to_string();
                let raw = LocalSourceProvider::new(spectra, library).read()?;
                (label, "local".to_string(), raw)
            }
        };

        sink.event(ProgressEvent {
            message: "phase=Parse; reading spectra and library matches".to_string(),
            elapsed: Some(started.elapsed()),
        });
        let scans = ScanStore::parse(&raw.spectra)?;
        let library = LibraryMatches::from_tsv(raw.library_matches.as_slice())?;

        let runner = QueryRunner::new(&self.engine, self.config.run_options);
        let pipeline = StagedPipeline::new(runner);
        let mut ctx = PipelineContext::new()?;

        let outcome = pipeline.run(&mut ctx, &scans, &self.config.catalog, |stage| {
            let message = match stage {
                Stage::Reduce { queries, scans: count } => {
                    format!("phase=Stage1; {queries} queries over {count} scans")
                }
                Stage::Full { queries, scans: count } => {
                    format!("phase=Classify; {queries} queries over {count} scans")
                }
            };
            sink.event(ProgressEvent {
                message,
                elapsed: Some(started.elapsed()),
            });
        })?;

        sink.event(ProgressEvent {
            message: "phase=Aggregate; joining library matches".to_string(),
            elapsed: Some(started.elapsed()),
        });
        let aggregation = aggregate::aggregate(&scans.scan_ids(), &library, &outcome.results);
        let matcher = TreeMatcher::new(&self.config.taxonomy);
        let classified = classified_records(&aggregation.full_table, &matcher);
        let features = feature_list(&classified);

        sink.event(ProgressEvent {
            message: format!("phase=Done; {} scans classified", classified.len()),
            elapsed: Some(started.elapsed()),
        });

        Ok(AnnotateResult {
            source: label,
            action,
            total_scans: scans.len(),
            stage1_passed: outcome.reduced_scan_count,
            outcome,
            aggregation,
            classified,
            features,
        })
    }

    /// Classifies a previously exported full table without running queries.
    pub fn classify_table(
        &self,
        path: PathBuf,
        sink: &dyn ProgressSink,
    ) -> Result<ClassifyResult, KiraError> {
        sink.event(ProgressEvent {
            message: format!("phase=Parse; reading {}", path.display()),
            elapsed: None,
        });
        let file = File::open(&path)
            .map_err(|err| KiraError::SourceUnreadable(format!("{}: {err}", path.display())))?;
        let (library_columns, records) = aggregate::read_records(file)?;
        let matcher = TreeMatcher::new(&self.config.taxonomy);
        let classified = classified_records(&records, &matcher);
        let features = feature_list(&classified);
        Ok(ClassifyResult {
            table: path.display().to_string(),
            total_records: records.len(),
            library_columns,
            classified,
            features,
        })
    }

    pub fn queries(&self, subset: Option<QuerySubset>) -> QueriesResult {
        let queries = match subset {
            Some(subset) => self.config.catalog.subset(subset),
            None => self.config.catalog.all().to_vec(),
        };
        QueriesResult {
            subset: subset.map(|subset| subset.to_string()),
            queries,
        }
    }

    pub fn paths(&self) -> PathsResult {
        PathsResult {
            categories: self
                .config
                .taxonomy
                .categories()
                .map(str::to_string)
                .collect(),
            paths: self.config.taxonomy.paths(),
        }
    }

    pub fn cache_list(&self, sink: &dyn ProgressSink) -> Result<CacheListResult, KiraError> {
        sink.event(ProgressEvent {
            message: "phase=Resolve; scanning task cache".to_string(),
            elapsed: None,
        });
        Ok(CacheListResult {
            tasks: self.store.list_metadata()?,
        })
    }

    pub fn cache_clear(&self, sink: &dyn ProgressSink) -> Result<ClearResult, KiraError> {
        sink.event(ProgressEvent {
            message: "phase=Store; clearing task cache".to_string(),
            elapsed: None,
        });
        self.store.clear()?;
        Ok(ClearResult { cleared: true })
    }

    fn fetch_task(
        &self,
        task: &TaskId,
        options: &AnnotateOptions,
        sink: &dyn ProgressSink,
    ) -> Result<(String, RawTaskData), KiraError> {
        let use_cache = self.config.cache && !options.no_cache;
        if use_cache && let Some(raw) = self.store.load(task)? {
            sink.event(ProgressEvent {
                message: format!("phase=Store; using cached task {task}"),
                elapsed: None,
            });
            return Ok(("cache".to_string(), raw));
        }

        sink.event(ProgressEvent {
            message: format!("phase=Download; task {task}"),
            elapsed: None,
        });
        let raw = self.provider.fetch(task)?;
        if use_cache {
            self.store.save(task, &raw)?;
        }
        Ok(("download".to_string(), raw))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::config::{Config, ConfigLoader};
    use crate::engine::QueryTable;
    use crate::output::JsonOutput;

    #[derive(Default)]
    struct MockProvider {
        calls: Mutex<usize>,
    }

    impl SourceProvider for MockProvider {
        fn fetch(&self, _task: &TaskId) -> Result<RawTaskData, KiraError> {
            *self.calls.lock().unwrap() += 1;
            Ok(RawTaskData {
                spectra: b"BEGIN IONS\nSCANS=1\n100 5\nEND IONS\n".to_vec(),
                library_matches: b"#Scan#\tCompound_Name\n1\tCholic acid\n".to_vec(),
            })
        }
    }

    struct NoMatchEngine;

    impl QueryEngine for NoMatchEngine {
        fn execute(&self, _: &str, _: &Path, _: bool) -> Result<QueryTable, KiraError> {
            Ok(QueryTable::empty())
        }
    }

    #[test]
    fn second_annotate_uses_cache() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let config = ConfigLoader::resolve_config(Config::default()).unwrap();
        let app = App::new(
            Store::new_with_paths(root),
            MockProvider::default(),
            NoMatchEngine,
            config,
        );
        let task: TaskId = "0123456789abcdef0123456789abcdef".parse().unwrap();

        let first = app
            .annotate(AnnotateSource::Task(task.clone()), AnnotateOptions::default(), &JsonOutput)
            .unwrap();
        let second = app
            .annotate(AnnotateSource::Task(task), AnnotateOptions::default(), &JsonOutput)
            .unwrap();

        assert_eq!(first.action, "download");
        assert_eq!(second.action, "cache");
        assert_eq!(*app.provider.calls.lock().unwrap(), 1);
        assert_eq!(second.aggregation.full_table[0].compound_name, "Cholic acid");
        assert!(second.classified.is_empty());
    }

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<String>>,
    }

    impl ProgressSink for RecordingSink {
        fn event(&self, event: ProgressEvent) {
            self.messages.lock().unwrap().push(event.message);
        }
    }

    #[test]
    fn annotate_reports_each_pipeline_stage() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let config = ConfigLoader::resolve_config(Config::default()).unwrap();
        let app = App::new(
            Store::new_with_paths(root),
            MockProvider::default(),
            NoMatchEngine,
            config,
        );
        let task: TaskId = "0123456789abcdef0123456789abcdef".parse().unwrap();
        let sink = RecordingSink::default();

        let result = app
            .annotate(AnnotateSource::Task(task), AnnotateOptions::default(), &sink)
            .unwrap();

        let phases = sink
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|message| message.split(';').next().map(str::to_string))
            .collect::<Vec<_>>();
        assert_eq!(
            phases,
            vec![
                "phase=Download",
                "phase=Parse",
                "phase=Stage1",
                "phase=Classify",
                "phase=Aggregate",
                "phase=Done",
            ]
        );
        assert_eq!(result.outcome.stage1_results.len(), 3);
        assert_eq!(result.outcome.results.len(), 17);
        assert_eq!(result.stage1_passed, 0);
    }
}
