use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

static TASK_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{32}$").unwrap());

/// Spectrum identifier as written on a `SCANS=` line or in a `#Scan#` column.
///
/// Integer-looking identifiers are canonicalised to their plain decimal form so
/// that `"007"`, `"7"` and `"7.0"` all name the same scan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScanId {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(KiraError::InvalidScanId(value.to_string()));
        }
        Ok(Self(canonical_scan(trimmed)))
    }
}

impl From<u64> for ScanId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

fn canonical_scan(value: &str) -> String {
    if let Ok(number) = value.parse::<u64>() {
        return number.to_string();
    }
    if let Some((whole, fraction)) = value.split_once('.') {
        if !whole.is_empty()
            && fraction.chars().all(|ch| ch == '0')
            && let Ok(number) = whole.parse::<u64>()
        {
            return number.to_string();
        }
    }
    value.to_string()
}

/// GNPS2 task identifier (32 hex digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        if !TASK_ID_RE.is_match(&normalized) {
            return Err(KiraError::InvalidTaskId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Named subsets of the query catalog. Membership is derived from the query
/// name, so one query can sit in several subsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QuerySubset {
    Stage1,
    Stage2,
    Mono,
    Di,
    Tri,
}

impl QuerySubset {
    pub fn needle(self) -> &'static str {
        match self {
            QuerySubset::Stage1 => "stage1",
            QuerySubset::Stage2 => "stage2",
            QuerySubset::Mono => "mono",
            QuerySubset::Di => "di",
            QuerySubset::Tri => "tri",
        }
    }

    pub fn contains(self, query_name: &str) -> bool {
        query_name.to_lowercase().contains(self.needle())
    }
}

impl fmt::Display for QuerySubset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.needle())
    }
}

impl FromStr for QuerySubset {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "stage1" => Ok(QuerySubset::Stage1),
            "stage2" => Ok(QuerySubset::Stage2),
            "mono" => Ok(QuerySubset::Mono),
            "di" => Ok(QuerySubset::Di),
            "tri" => Ok(QuerySubset::Tri),
            _ => Err(KiraError::InvalidSubset(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryDefinition {
    pub name: String,
    pub pattern: String,
}

impl QueryDefinition {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }

    pub fn in_subset(&self, subset: QuerySubset) -> bool {
        subset.contains(&self.name)
    }
}

/// Scans matched by one query execution. An engine failure for that query is
/// recorded as an empty set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub query_name: String,
    pub matched_scan_ids: BTreeSet<ScanId>,
}

impl QueryResult {
    pub fn empty(query_name: impl Into<String>) -> Self {
        Self {
            query_name: query_name.into(),
            matched_scan_ids: BTreeSet::new(),
        }
    }
}
