use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid GNPS task id: {0}")]
    InvalidTaskId(String),

    #[error("invalid scan id: {0}")]
    InvalidScanId(String),

    #[error("invalid query subset: {0}")]
    InvalidSubset(String),

    #[error("invalid spectral file: {0}")]
    Format(String),

    #[error("query engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("GNPS request failed: {0}")]
    GnpsHttp(String),

    #[error("GNPS returned status {status}: {message}")]
    GnpsStatus { status: u16, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to parse query catalog: {0}")]
    CatalogParse(String),

    #[error("failed to parse classification taxonomy: {0}")]
    TaxonomyParse(String),

    #[error("invalid table: {0}")]
    Table(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
