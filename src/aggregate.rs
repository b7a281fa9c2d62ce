use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Read;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::classify::{ClassificationResult, MATCH_DELIMITER, TreeMatcher};
use crate::domain::{QueryResult, ScanId};
use crate::error::KiraError;

pub const SCAN_COLUMN: &str = "#Scan#";
pub const COMPOUND_COLUMN: &str = "Compound_Name";
pub const VALIDATION_COLUMN: &str = "query_validation";
pub const EXCLUDED_AT_STAGE1: &str = "Did not pass any selected query";
pub const NO_MATCH: &str = "No match";

#[derive(Debug, Clone, PartialEq, Eq)]
struct LibraryRow {
    scan_id: ScanId,
    compound_name: Option<String>,
    values: Vec<String>,
}

/// GNPS library-match table keyed by `#Scan#`. Columns other than the scan
/// and compound columns are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryMatches {
    columns: Vec<String>,
    rows: Vec<LibraryRow>,
}

impl LibraryMatches {
    pub fn from_tsv<R: Read>(reader: R) -> Result<Self, KiraError> {
        Self::from_reader(reader, b'\t')
    }

    pub fn from_reader<R: Read>(reader: R, delimiter: u8) -> Result<Self, KiraError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(reader);
        let header = reader
            .headers()
            .map_err(|err| KiraError::Table(err.to_string()))?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| KiraError::Table(err.to_string()))?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Self::new(header, rows)
    }

    pub fn new(header: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, KiraError> {
        let scan_index = header
            .iter()
            .position(|column| column == SCAN_COLUMN)
            .ok_or_else(|| KiraError::Table(format!("library matches lack a {SCAN_COLUMN} column")))?;
        let compound_index = header.iter().position(|column| column == COMPOUND_COLUMN);
        let kept = |index: usize| index != scan_index && Some(index) != compound_index;
        let columns = header
            .iter()
            .enumerate()
            .filter(|(index, _)| kept(*index))
            .map(|(_, column)| column.clone())
            .collect();

        let mut parsed = Vec::with_capacity(rows.len());
        for row in rows {
            let cell = |index: usize| row.get(index).cloned().unwrap_or_default();
            let Ok(scan_id) = cell(scan_index).parse::<ScanId>() else {
                warn!("library match row without a scan id skipped");
                continue;
            };
            let compound_name = compound_index
                .map(cell)
                .filter(|name| !name.trim().is_empty());
            let values = (0..header.len()).filter(|index| kept(*index)).map(cell).collect();
            parsed.push(LibraryRow {
                scan_id,
                compound_name,
                values,
            });
        }
        Ok(Self {
            columns,
            rows: parsed,
        })
    }

    /// Library columns other than `#Scan#` and `Compound_Name`.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn scan_ids(&self) -> impl Iterator<Item = &ScanId> {
        self.rows.iter().map(|row| &row.scan_id)
    }

    /// First row per scan.
    fn index(&self) -> HashMap<&ScanId, &LibraryRow> {
        let mut index = HashMap::new();
        for row in &self.rows {
            if index.contains_key(&row.scan_id) {
                debug!(scan = %row.scan_id, "extra library match row ignored");
                continue;
            }
            index.insert(&row.scan_id, row);
        }
        index
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedRecord {
    pub scan_id: ScanId,
    pub compound_name: String,
    pub query_validation: String,
    /// Values aligned with `Aggregation::library_columns`; `None` without a
    /// library match.
    pub library: Option<Vec<String>>,
}

impl AggregatedRecord {
    pub fn passed_stage1(&self) -> bool {
        self.query_validation != EXCLUDED_AT_STAGE1
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Aggregation {
    pub library_columns: Vec<String>,
    pub library_only: Vec<AggregatedRecord>,
    pub full_table: Vec<AggregatedRecord>,
}

/// One `(scan, query)` pair per matched scan of every query.
pub fn explode(results: &[QueryResult]) -> Vec<(ScanId, String)> {
    results
        .iter()
        .flat_map(|result| {
            result
                .matched_scan_ids
                .iter()
                .map(|scan| (scan.clone(), result.query_name.clone()))
        })
        .collect()
}

/// Sorted, `;`-joined query names, or the stage-1 sentinel when empty.
pub fn join_validation(names: &BTreeSet<String>) -> String {
    if names.is_empty() {
        return EXCLUDED_AT_STAGE1.to_string();
    }
    let delimiter = MATCH_DELIMITER.to_string();
    names
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(delimiter.as_str())
}

/// Joins the scan universe with library and query evidence. `full_table` holds
/// exactly one record per distinct scan id of `all_scan_ids`, in input order.
pub fn aggregate(
    all_scan_ids: &[ScanId],
    library: &LibraryMatches,
    results: &[QueryResult],
) -> Aggregation {
    let mut evidence: HashMap<ScanId, BTreeSet<String>> = HashMap::new();
    for (scan, query) in explode(results) {
        evidence.entry(scan).or_default().insert(query);
    }
    let library_index = library.index();

    let build = |scan_id: &ScanId| {
        let row = library_index.get(scan_id);
        let names = evidence.get(scan_id).cloned().unwrap_or_default();
        AggregatedRecord {
            scan_id: scan_id.clone(),
            compound_name: row
                .and_then(|row| row.compound_name.clone())
                .unwrap_or_else(|| NO_MATCH.to_string()),
            query_validation: join_validation(&names),
            library: row.map(|row| row.values.clone()),
        }
    };

    let mut seen = HashSet::new();
    let full_table = all_scan_ids
        .iter()
        .filter(|scan_id| seen.insert(*scan_id))
        .map(build)
        .collect::<Vec<_>>();

    let mut seen = HashSet::new();
    let library_only = library
        .scan_ids()
        .filter(|scan_id| seen.insert(*scan_id))
        .map(build)
        .collect::<Vec<_>>();

    Aggregation {
        library_columns: library.columns().to_vec(),
        library_only,
        full_table,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedRecord {
    pub record: AggregatedRecord,
    pub classification: ClassificationResult,
}

/// Records that passed stage 1 and map onto at least one taxonomy path.
pub fn classified_records(records: &[AggregatedRecord], matcher: &TreeMatcher) -> Vec<ClassifiedRecord> {
    records
        .par_iter()
        .filter(|record| record.passed_stage1())
        .filter_map(|record| {
            let classification = matcher.classify_validation(&record.query_validation);
            classification.is_classified().then(|| ClassifiedRecord {
                record: record.clone(),
                classification,
            })
        })
        .collect()
}

/// `(compound, scan)` pairs of classified records, sorted by compound name.
pub fn feature_list(classified: &[ClassifiedRecord]) -> Vec<(String, ScanId)> {
    let mut features = classified
        .iter()
        .map(|item| (item.record.compound_name.clone(), item.record.scan_id.clone()))
        .collect::<Vec<_>>();
    features.sort();
    features
}

/// Reads a full table previously exported as CSV. Columns other than
/// `#Scan#`, `Compound_Name` and `query_validation` become library columns.
pub fn read_records<R: Read>(reader: R) -> Result<(Vec<String>, Vec<AggregatedRecord>), KiraError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let header = reader
        .headers()
        .map_err(|err| KiraError::Table(err.to_string()))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let find = |name: &str| {
        header
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| KiraError::Table(format!("missing column {name}")))
    };
    let scan_index = find(SCAN_COLUMN)?;
    let compound_index = find(COMPOUND_COLUMN)?;
    let validation_index = find(VALIDATION_COLUMN)?;
    let reserved = [scan_index, compound_index, validation_index];
    let library_indices = (0..header.len())
        .filter(|index| !reserved.contains(index))
        .collect::<Vec<_>>();
    let library_columns = library_indices
        .iter()
        .map(|&index| header[index].clone())
        .collect::<Vec<_>>();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|err| KiraError::Table(err.to_string()))?;
        let cell = |index: usize| row.get(index).unwrap_or("").to_string();
        let scan_id = cell(scan_index).parse::<ScanId>()?;
        let compound_name = Some(cell(compound_index))
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| NO_MATCH.to_string());
        let query_validation = Some(cell(validation_index))
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| EXCLUDED_AT_STAGE1.to_string());
        let values = library_indices.iter().map(|&index| cell(index)).collect::<Vec<_>>();
        // The CSV has no marker for a library match, so a matched row whose
        // library cells are all empty (or a table without library columns)
        // reads back as `None`. Classification only needs the validation.
        let library = values.iter().any(|value| !value.is_empty()).then_some(values);
        records.push(AggregatedRecord {
            scan_id,
            compound_name,
            query_validation,
            library,
        });
    }
    Ok((library_columns, records))
}
