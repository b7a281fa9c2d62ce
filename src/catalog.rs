use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::domain::{QueryDefinition, QuerySubset};
use crate::error::KiraError;

const BUILTIN_CATALOG: &str = include_str!("../data/massql_queries.json");

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(rename = "ALL_MASSQL_QUERIES")]
    all_queries: Map<String, Value>,
}

/// Ordered query name -> MassQL pattern mapping.
#[derive(Debug, Clone)]
pub struct QueryCatalog {
    queries: Vec<QueryDefinition>,
}

impl QueryCatalog {
    pub fn builtin() -> Result<Self, KiraError> {
        Self::from_json_str(BUILTIN_CATALOG)
    }

    pub fn load(path: &Path) -> Result<Self, KiraError> {
        let content = fs::read_to_string(path)
            .map_err(|err| KiraError::CatalogParse(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, KiraError> {
        let file: CatalogFile = serde_json::from_str(content)
            .map_err(|err| KiraError::CatalogParse(err.to_string()))?;
        let queries = file
            .all_queries
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(pattern) => Ok(QueryDefinition::new(name, pattern)),
                other => Err(KiraError::CatalogParse(format!(
                    "query {name} must be a string, got {other}"
                ))),
            })
            .collect::<Result<Vec<_>, KiraError>>()?;
        Self::new(queries)
    }

    pub fn new(queries: Vec<QueryDefinition>) -> Result<Self, KiraError> {
        if queries.is_empty() {
            return Err(KiraError::CatalogParse("catalog has no queries".to_string()));
        }
        Ok(Self { queries })
    }

    pub fn all(&self) -> &[QueryDefinition] {
        &self.queries
    }

    pub fn subset(&self, subset: QuerySubset) -> Vec<QueryDefinition> {
        self.queries
            .iter()
            .filter(|query| query.in_subset(subset))
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&QueryDefinition> {
        self.queries.iter().find(|query| query.name == name)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}
