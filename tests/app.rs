use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use kira_bile_acids::aggregate::EXCLUDED_AT_STAGE1;
use kira_bile_acids::app::{AnnotateOptions, AnnotateSource, App};
use kira_bile_acids::catalog::QueryCatalog;
use kira_bile_acids::config::{Config, ConfigLoader};
use kira_bile_acids::domain::{ScanId, TaskId};
use kira_bile_acids::engine::{MassqlCliEngine, QueryEngine, QueryTable};
use kira_bile_acids::error::KiraError;
use kira_bile_acids::gnps::{RawTaskData, SourceProvider};
use kira_bile_acids::mgf::ScanStore;
use kira_bile_acids::output::{JsonOutput, write_annotation_tables};
use kira_bile_acids::store::Store;

struct OfflineProvider;

impl SourceProvider for OfflineProvider {
    fn fetch(&self, _task: &TaskId) -> Result<RawTaskData, KiraError> {
        Err(KiraError::GnpsHttp("offline".to_string()))
    }
}

/// Answers each query pattern with a fixed set of scans, limited to the scans
/// present in the source it is pointed at.
struct ScriptedEngine {
    by_pattern: HashMap<String, Vec<ScanId>>,
    calls: Mutex<usize>,
}

impl ScriptedEngine {
    fn new(catalog: &QueryCatalog, script: &[(&str, &[u64])]) -> Self {
        let by_pattern = script
            .iter()
            .map(|(name, scans)| {
                let query = catalog.get(name).unwrap();
                (
                    query.pattern.clone(),
                    scans.iter().copied().map(ScanId::from).collect(),
                )
            })
            .collect();
        Self {
            by_pattern,
            calls: Mutex::new(0),
        }
    }
}

impl QueryEngine for ScriptedEngine {
    fn execute(&self, pattern: &str, source: &Path, _parallel: bool) -> Result<QueryTable, KiraError> {
        *self.calls.lock().unwrap() += 1;
        let present = ScanStore::parse(&std::fs::read(source).unwrap())
            .map(|store| store.scan_ids().into_iter().collect::<BTreeSet<_>>())
            .unwrap_or_default();
        let scans = self
            .by_pattern
            .get(pattern)
            .into_iter()
            .flatten()
            .filter(|scan| present.contains(*scan))
            .map(|scan| scan.to_string())
            .collect::<Vec<_>>();
        Ok(QueryTable::with_scans(scans))
    }
}

const MGF: &str = "\
BEGIN IONS
PEPMASS=391.28
SCANS=1
355.26 100
END IONS
BEGIN IONS
PEPMASS=407.28
SCANS=2
371.26 80
END IONS
BEGIN IONS
SCANS=3
200.1 10
END IONS
BEGIN IONS
SCANS=4
357.28 40
END IONS
BEGIN IONS
SCANS=5
339.27 55
END IONS
";

const LIBRARY: &str = "#Scan#\tCompound_Name\tMQScore
1\tDeoxycholic acid\t0.91
2\tCholic acid\t0.84
7\tUnknown\t0.52
";

const SCRIPT: &[(&str, &[u64])] = &[
    ("Monohydroxy_stage1", &[5]),
    ("Dihydroxy_stage1", &[1, 2]),
    ("Dihydroxy_stage2", &[1, 2]),
    ("Dihydroxy_stage3a", &[1]),
    ("Di-3,12a-OH", &[1, 2]),
    ("Di-3,6-OH", &[2]),
    ("Trihydroxy_stage1", &[2]),
    ("Trihydroxy_stage2", &[2]),
    ("Mono-3-OH", &[4]),
];

const MONO_ONLY: &[(&str, &[u64])] = &[("Mono-3-OH", &[4])];

fn write_inputs(dir: &Path) -> (PathBuf, PathBuf) {
    let spectra = dir.join("specs_ms.mgf");
    let library = dir.join("merged_results_with_gnps.tsv");
    std::fs::write(&spectra, MGF).unwrap();
    std::fs::write(&library, LIBRARY).unwrap();
    (spectra, library)
}

fn store(dir: &Path) -> Store {
    Store::new_with_paths(Utf8PathBuf::from_path_buf(dir.join("cache")).unwrap())
}

#[test]
fn annotate_local_files_end_to_end() {
    let temp = tempfile::tempdir().unwrap();
    let (spectra, library) = write_inputs(temp.path());
    let config = ConfigLoader::resolve_config(Config::default()).unwrap();
    let engine = ScriptedEngine::new(&config.catalog, SCRIPT);
    let app = App::new(store(temp.path()), OfflineProvider, engine, config);

    let result = app
        .annotate(
            AnnotateSource::Files {
                spectra,
                library: Some(library),
            },
            AnnotateOptions::default(),
            &JsonOutput,
        )
        .unwrap();

    assert_eq!(result.action, "local");
    assert_eq!(result.total_scans, 5);
    assert_eq!(result.stage1_passed, 3);
    let kept = result
        .outcome
        .kept_ids
        .iter()
        .map(ScanId::as_str)
        .collect::<Vec<_>>();
    assert_eq!(kept, vec!["1", "2", "5"]);

    let full = &result.aggregation.full_table;
    assert_eq!(full.len(), 5);
    assert_eq!(
        full[0].query_validation,
        "Di-3,12a-OH;Dihydroxy_stage1;Dihydroxy_stage2;Dihydroxy_stage3a"
    );
    assert_eq!(full[2].query_validation, EXCLUDED_AT_STAGE1);
    // Scan 4 only satisfies a non stage-1 query, so it never reaches the full run.
    assert_eq!(full[3].query_validation, EXCLUDED_AT_STAGE1);
    assert_eq!(full[4].compound_name, "No match");

    let library_only = &result.aggregation.library_only;
    assert_eq!(library_only.len(), 3);
    assert_eq!(library_only[2].compound_name, "Unknown");
    assert_eq!(library_only[2].query_validation, EXCLUDED_AT_STAGE1);

    assert_eq!(result.classified.len(), 3);
    let chimeric = result
        .classified
        .iter()
        .find(|item| item.record.scan_id == ScanId::from(2))
        .unwrap();
    assert!(chimeric.classification.is_chimeric());
    assert_eq!(
        chimeric.classification.satisfied_paths,
        vec![
            vec!["Dihydroxy", "Dihydroxy_stage1", "Dihydroxy_stage2"],
            vec!["Trihydroxy", "Trihydroxy_stage1", "Trihydroxy_stage2"],
        ]
    );

    let features = result
        .features
        .iter()
        .map(|(compound, scan)| (compound.as_str(), scan.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        features,
        vec![
            ("Cholic acid", "2"),
            ("Deoxycholic acid", "1"),
            ("No match", "5"),
        ]
    );

    // Three stage-1 queries over the full file, then the whole catalog.
    assert_eq!(*app_engine_calls(&app), 3 + 17);
}

fn app_engine_calls(app: &App<OfflineProvider, ScriptedEngine>) -> std::sync::MutexGuard<'_, usize> {
    app.engine().calls.lock().unwrap()
}

#[test]
fn nothing_passing_stage1_skips_the_full_run() {
    let temp = tempfile::tempdir().unwrap();
    let (spectra, library) = write_inputs(temp.path());
    let config = ConfigLoader::resolve_config(Config::default()).unwrap();
    let engine = ScriptedEngine::new(&config.catalog, MONO_ONLY);
    let app = App::new(store(temp.path()), OfflineProvider, engine, config);

    let result = app
        .annotate(
            AnnotateSource::Files {
                spectra,
                library: Some(library),
            },
            AnnotateOptions::default(),
            &JsonOutput,
        )
        .unwrap();

    assert_eq!(result.stage1_passed, 0);
    assert!(result.classified.is_empty());
    assert!(
        result
            .aggregation
            .full_table
            .iter()
            .all(|record| record.query_validation == EXCLUDED_AT_STAGE1)
    );
    assert_eq!(*app_engine_calls(&app), 3);
}

#[test]
fn missing_engine_is_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let (spectra, _) = write_inputs(temp.path());
    let config = ConfigLoader::resolve_config(Config::default()).unwrap();
    let engine = MassqlCliEngine::new("kira-ba-no-such-engine");
    let app = App::new(store(temp.path()), OfflineProvider, engine, config);

    let err = app
        .annotate(
            AnnotateSource::Files {
                spectra,
                library: None,
            },
            AnnotateOptions::default(),
            &JsonOutput,
        )
        .unwrap_err();
    assert_matches!(err, KiraError::EngineUnavailable(_));
}

#[test]
fn spectra_without_blocks_are_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let spectra = temp.path().join("empty.mgf");
    std::fs::write(&spectra, "PEPMASS=1\n").unwrap();
    let config = ConfigLoader::resolve_config(Config::default()).unwrap();
    let engine = ScriptedEngine::new(&config.catalog, &[]);
    let app = App::new(store(temp.path()), OfflineProvider, engine, config);

    let err = app
        .annotate(
            AnnotateSource::Files {
                spectra,
                library: None,
            },
            AnnotateOptions::default(),
            &JsonOutput,
        )
        .unwrap_err();
    assert_matches!(err, KiraError::Format(_));
}

#[test]
fn unreachable_remote_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let config = ConfigLoader::resolve_config(Config::default()).unwrap();
    let engine = ScriptedEngine::new(&config.catalog, &[]);
    let app = App::new(store(temp.path()), OfflineProvider, engine, config);
    let task: TaskId = "0123456789abcdef0123456789abcdef".parse().unwrap();

    let err = app
        .annotate(AnnotateSource::Task(task), AnnotateOptions::default(), &JsonOutput)
        .unwrap_err();
    assert_matches!(err, KiraError::GnpsHttp(_));
}

#[test]
fn exported_full_table_reclassifies_identically() {
    let temp = tempfile::tempdir().unwrap();
    let (spectra, library) = write_inputs(temp.path());
    let config = ConfigLoader::resolve_config(Config::default()).unwrap();
    let engine = ScriptedEngine::new(&config.catalog, SCRIPT);
    let app = App::new(store(temp.path()), OfflineProvider, engine, config);
    let result = app
        .annotate(
            AnnotateSource::Files {
                spectra,
                library: Some(library),
            },
            AnnotateOptions::default(),
            &JsonOutput,
        )
        .unwrap();

    let out = temp.path().join("out");
    let written = write_annotation_tables(&out, &result).unwrap();
    assert_eq!(written.len(), 4);
    assert!(written.iter().all(|path| path.exists()));

    let reclassified = app
        .classify_table(out.join("full_table.csv"), &JsonOutput)
        .unwrap();
    assert_eq!(reclassified.total_records, 5);
    assert_eq!(reclassified.library_columns, vec!["MQScore"]);
    assert_eq!(reclassified.features, result.features);
}

#[test]
fn missing_table_is_unreadable() {
    let temp = tempfile::tempdir().unwrap();
    let config = ConfigLoader::resolve_config(Config::default()).unwrap();
    let engine = ScriptedEngine::new(&config.catalog, &[]);
    let app = App::new(store(temp.path()), OfflineProvider, engine, config);
    let err = app
        .classify_table(temp.path().join("absent.csv"), &JsonOutput)
        .unwrap_err();
    assert_matches!(err, KiraError::SourceUnreadable(_));
}
