use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::aggregate::{
    AggregatedRecord, ClassifiedRecord, COMPOUND_COLUMN, SCAN_COLUMN, VALIDATION_COLUMN, explode,
};
use crate::app::{
    AnnotateResult, CacheListResult, ClassifyResult, ClearResult, PathsResult, ProgressEvent,
    ProgressSink, QueriesResult,
};
use crate::error::KiraError;
use crate::taxonomy::ClassificationPath;

pub const PATH_SEPARATOR: &str = " > ";

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_annotate(result: &AnnotateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_classify(result: &ClassifyResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_queries(result: &QueriesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_paths(result: &PathsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_cache_list(result: &CacheListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress lines on stderr for interactive runs.
pub struct TextProgress;

impl ProgressSink for TextProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("[{:>6.1}s] {}", elapsed.as_secs_f64(), event.message),
            None => eprintln!("          {}", event.message),
        }
    }
}

pub fn format_path(path: &ClassificationPath) -> String {
    path.join(PATH_SEPARATOR)
}

/// Writes the four result tables of an annotation run into `dir`.
pub fn write_annotation_tables(dir: &Path, result: &AnnotateResult) -> Result<Vec<PathBuf>, KiraError> {
    fs::create_dir_all(dir).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let columns = &result.aggregation.library_columns;

    let library_path = dir.join("library_matches.csv");
    write_records(&library_path, columns, &result.aggregation.library_only)?;

    let full_path = dir.join("full_table.csv");
    write_records(&full_path, columns, &result.aggregation.full_table)?;

    let classified_path = dir.join("classified.csv");
    write_classified(&classified_path, columns, &result.classified)?;

    let results_path = dir.join("query_results.csv");
    let mut writer = csv_writer(&results_path)?;
    write_row(&mut writer, ["query_name", SCAN_COLUMN])?;
    for (scan, query) in explode(&result.outcome.results) {
        write_row(&mut writer, [query.as_str(), scan.as_str()])?;
    }
    flush(writer)?;

    Ok(vec![library_path, full_path, classified_path, results_path])
}

pub fn write_records(
    path: &Path,
    library_columns: &[String],
    records: &[AggregatedRecord],
) -> Result<(), KiraError> {
    let mut writer = csv_writer(path)?;
    write_row(&mut writer, record_header(library_columns))?;
    for record in records {
        write_row(&mut writer, record_cells(record, library_columns.len()))?;
    }
    flush(writer)
}

pub fn write_classified(
    path: &Path,
    library_columns: &[String],
    classified: &[ClassifiedRecord],
) -> Result<(), KiraError> {
    let mut writer = csv_writer(path)?;
    let mut header = record_header(library_columns);
    header.extend(
        ["bile_acid_category", "most_specific_path", "path_length", "satisfied_paths"]
            .map(str::to_string),
    );
    write_row(&mut writer, header)?;
    for item in classified {
        let classification = &item.classification;
        let mut cells = record_cells(&item.record, library_columns.len());
        cells.push(classification.bile_acid_category.clone().unwrap_or_default());
        cells.push(
            classification
                .most_specific_path
                .as_ref()
                .map(format_path)
                .unwrap_or_default(),
        );
        cells.push(classification.path_length.to_string());
        cells.push(
            classification
                .satisfied_paths
                .iter()
                .map(format_path)
                .collect::<Vec<_>>()
                .join(" | "),
        );
        write_row(&mut writer, cells)?;
    }
    flush(writer)
}

fn record_header(library_columns: &[String]) -> Vec<String> {
    let mut header = vec![SCAN_COLUMN.to_string(), COMPOUND_COLUMN.to_string()];
    header.extend(library_columns.iter().cloned());
    header.push(VALIDATION_COLUMN.to_string());
    header
}

fn record_cells(record: &AggregatedRecord, library_width: usize) -> Vec<String> {
    let mut cells = vec![record.scan_id.to_string(), record.compound_name.clone()];
    match &record.library {
        Some(values) => cells.extend(values.iter().cloned()),
        None => cells.extend(std::iter::repeat_n(String::new(), library_width)),
    }
    cells.push(record.query_validation.clone());
    cells
}

fn csv_writer(path: &Path) -> Result<csv::Writer<fs::File>, KiraError> {
    csv::Writer::from_path(path).map_err(|err| KiraError::Filesystem(err.to_string()))
}

fn write_row<I, T>(writer: &mut csv::Writer<fs::File>, row: I) -> Result<(), KiraError>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    writer
        .write_record(row)
        .map_err(|err| KiraError::Filesystem(err.to_string()))
}

fn flush(mut writer: csv::Writer<fs::File>) -> Result<(), KiraError> {
    writer
        .flush()
        .map_err(|err| KiraError::Filesystem(err.to_string()))
}
