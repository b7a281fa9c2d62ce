use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::info;

use crate::aggregate;
use crate::domain::TaskId;
use crate::error::KiraError;

const SPECTRA_FILE: &str = "nf_output/clustering/specs_ms.mgf";
const LIBRARY_FILE: &str = "nf_output/library/merged_results_with_gnps.tsv";

/// Raw artifacts of one FBMN task: the MGF and the library-match TSV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTaskData {
    pub spectra: Vec<u8>,
    pub library_matches: Vec<u8>,
}

pub trait SourceProvider: Send + Sync {
    fn fetch(&self, task: &TaskId) -> Result<RawTaskData, KiraError>;
}

#[derive(Clone)]
pub struct GnpsHttpClient {
    client: Client,
    base_url: String,
}

impl GnpsHttpClient {
    pub fn new() -> Result<Self, KiraError> {
        Self::with_base_url("https://gnps2.org")
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-ba/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::GnpsHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| KiraError::GnpsHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn result_file_url(&self, task: &TaskId, file: &str) -> String {
        format!(
            "{}/resultfile?task={}&file={}",
            self.base_url,
            task.as_str(),
            file
        )
    }

    fn download(&self, task: &TaskId, file: &str) -> Result<Vec<u8>, KiraError> {
        let url = self.result_file_url(task, file);
        info!(%url, "downloading task file");
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "GNPS request failed".to_string());
            return Err(KiraError::GnpsStatus { status, message });
        }
        let bytes = response
            .bytes()
            .map_err(|err| KiraError::GnpsHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, KiraError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    if attempt < MAX_RETRIES && is_retryable_status(resp.status().as_u16()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::GnpsHttp(err.to_string()));
                }
            }
        }
    }
}

impl SourceProvider for GnpsHttpClient {
    fn fetch(&self, task: &TaskId) -> Result<RawTaskData, KiraError> {
        let library_matches = self.download(task, LIBRARY_FILE)?;
        let spectra = self.download(task, SPECTRA_FILE)?;
        Ok(RawTaskData {
            spectra,
            library_matches,
        })
    }
}

/// Reads the two task artifacts from disk. Without a library file the task is
/// treated as having no library matches.
#[derive(Debug, Clone)]
pub struct LocalSourceProvider {
    spectra: PathBuf,
    library: Option<PathBuf>,
}

impl LocalSourceProvider {
    pub fn new(spectra: PathBuf, library: Option<PathBuf>) -> Self {
        Self { spectra, library }
    }

    pub fn read(&self) -> Result<RawTaskData, KiraError> {
        let spectra = read_file(&self.spectra)?;
        let library_matches = match &self.library {
            Some(path) => read_file(path)?,
            None => format!("{}\t{}\n", aggregate::SCAN_COLUMN, aggregate::COMPOUND_COLUMN)
                .into_bytes(),
        };
        Ok(RawTaskData {
            spectra,
            library_matches,
        })
    }
}

impl SourceProvider for LocalSourceProvider {
    fn fetch(&self, _task: &TaskId) -> Result<RawTaskData, KiraError> {
        self.read()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, KiraError> {
    std::fs::read(path)
        .map_err(|err| KiraError::SourceUnreadable(format!("{}: {err}", path.display())))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
