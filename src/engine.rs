use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::KiraError;

pub const SCAN_COLUMN: &str = "scan";

/// Tabular query output. Only the `scan` column is read downstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl QueryTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_scans<I, S>(scans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: vec![SCAN_COLUMN.to_string()],
            rows: scans.into_iter().map(|scan| vec![scan.into()]).collect(),
        }
    }

    pub fn from_tsv<R: Read>(reader: R) -> Result<Self, KiraError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_reader(reader);
        let columns = reader
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
        Ok(Self { columns, rows })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let index = self.columns.iter().position(|column| column == name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(index).map(String::as_str).unwrap_or(""))
                .collect(),
        )
    }
}

/// Executes one MassQL pattern against a spectral file.
///
/// `Err(KiraError::EngineUnavailable)` means the engine itself cannot be
/// reached and aborts a run; any other error is scoped to that query.
pub trait QueryEngine: Send + Sync {
    fn execute(&self, pattern: &str, source: &Path, parallel: bool) -> Result<QueryTable, KiraError>;
}

/// Runs the `massql` command line tool.
#[derive(Debug, Clone)]
pub struct MassqlCliEngine {
    name: String,
    program: Option<PathBuf>,
}

impl MassqlCliEngine {
    pub fn new(program: &str) -> Self {
        let direct = PathBuf::from(program);
        let resolved = if direct.components().count() > 1 {
            direct.exists().then_some(direct)
        } else {
            find_in_path(program)
        };
        Self {
            name: program.to_string(),
            program: resolved,
        }
    }

    pub fn is_available(&self) -> bool {
        self.program.is_some()
    }

    fn require_program(&self) -> Result<&PathBuf, KiraError> {
        self.program
            .as_ref()
            .ok_or_else(|| KiraError::EngineUnavailable(format!("{} not found in PATH", self.name)))
    }
}

impl QueryEngine for MassqlCliEngine {
    fn execute(&self, pattern: &str, source: &Path, parallel: bool) -> Result<QueryTable, KiraError> {
        let program = self.require_program()?;
        let work_dir = tempfile::Builder::new()
            .prefix("kira-ba-query")
            .tempdir()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let output_path = work_dir.path().join("results.tsv");
        let args = vec![
            source.to_string_lossy().to_string(),
            pattern.to_string(),
            "--output_file".to_string(),
            output_path.to_string_lossy().to_string(),
            "--parallel_query".to_string(),
            if parallel { "YES" } else { "NO" }.to_string(),
        ];

        let output = Command::new(program).args(&args).output().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                KiraError::EngineUnavailable(err.to_string())
            } else {
                KiraError::QueryFailed(err.to_string())
            }
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("command failed: {}", program.display())
            } else {
                stderr
            };
            return Err(KiraError::QueryFailed(message));
        }

        if !output_path.exists() {
            debug!("massql produced no output file");
            return Ok(QueryTable::empty());
        }
        let file = fs::File::open(&output_path)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if file.metadata().map(|meta| meta.len() == 0).unwrap_or(true) {
            return Ok(QueryTable::empty());
        }
        QueryTable::from_tsv(file)
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn reads_scan_column_from_tsv() {
        let tsv = "scan\tprecmz\tms1scan\n12\t391.28\t11\n15.0\t391.28\t14\n";
        let table = QueryTable::from_tsv(tsv.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column(SCAN_COLUMN).unwrap(), vec!["12", "15.0"]);
        assert!(table.column("missing").is_none());
    }

    #[test]
    fn missing_program_is_unavailable() {
        let engine = MassqlCliEngine::new("kira-ba-definitely-not-installed");
        assert!(!engine.is_available());
        let err = engine
            .execute("QUERY scaninfo(MS2DATA)", Path::new("x.mgf"), true)
            .unwrap_err();
        assert_matches!(err, KiraError::EngineUnavailable(_));
    }
}
