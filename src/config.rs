use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::catalog::QueryCatalog;
use crate::error::KiraError;
use crate::runner::RunOptions;
use crate::taxonomy::ClassificationTree;

pub const DEFAULT_CONFIG_FILE: &str = "kira-ba.json";
pub const DEFAULT_ENGINE_PROGRAM: &str = "massql";

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    #[serde(default)]
    pub taxonomy: Option<PathBuf>,
    #[serde(default)]
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub cache: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default)]
    pub parallel: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub catalog: QueryCatalog,
    pub taxonomy: ClassificationTree,
    pub engine_program: PathBuf,
    pub run_options: RunOptions,
    pub cache: bool,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `kira-ba.json` from the working directory when no
    /// path is given. Only the default file may be absent.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(KiraError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let catalog = match &config.catalog {
            Some(path) => QueryCatalog::load(path)?,
            None => QueryCatalog::builtin()?,
        };
        let taxonomy = match &config.taxonomy {
            Some(path) => ClassificationTree::load(path)?,
            None => ClassificationTree::builtin()?,
        };

        let engine = config.engine.unwrap_or_default();
        if config.concurrency == Some(0) {
            return Err(KiraError::ConfigParse(
                "concurrency must be at least 1".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version,
            catalog,
            taxonomy,
            engine_program: engine
                .program
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_PROGRAM)),
            run_options: RunOptions {
                engine_parallel: engine.parallel.unwrap_or(true),
                concurrency: config.concurrency,
            },
            cache: config.cache.unwrap_or(true),
        })
    }
}
