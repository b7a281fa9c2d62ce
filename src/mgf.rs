//! MGF scan store.
//!
//! A store is the cleaned form of an MGF file: every `BEGIN IONS` / `END IONS`
//! block that carries at least one numeric two-column peak line, kept verbatim
//! and in file order. Stores are re-materialized on disk because the query
//! engine consumes sources by path.

use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::domain::ScanId;
use crate::error::KiraError;

pub const BLOCK_START: &str = "BEGIN IONS";
pub const BLOCK_END: &str = "END IONS";
const SCANS_PREFIX: &str = "SCANS=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanBlock {
    id: Option<ScanId>,
    lines: Vec<Vec<u8>>,
}

impl ScanBlock {
    fn from_lines(lines: Vec<Vec<u8>>) -> Option<Self> {
        if !lines.iter().any(|line| is_peak_bytes(line)) {
            return None;
        }
        let id = lines
            .iter()
            .find_map(|line| line.trim_ascii().strip_prefix(SCANS_PREFIX.as_bytes()))
            .and_then(|value| std::str::from_utf8(value).ok())
            .and_then(|value| value.parse::<ScanId>().ok());
        Some(Self { id, lines })
    }

    /// `None` when the block has no `SCANS=` line.
    pub fn id(&self) -> Option<&ScanId> {
        self.id.as_ref()
    }

    /// Raw lines including their terminators, byte for byte as read.
    pub fn lines(&self) -> &[Vec<u8>] {
        &self.lines
    }

    pub fn peak_count(&self) -> usize {
        self.lines.iter().filter(|line| is_peak_bytes(line)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Loose(Vec<u8>),
    Block(ScanBlock),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStore {
    segments: Vec<Segment>,
}

impl ScanStore {
    /// Parses raw MGF bytes. Blocks without a usable peak line, blocks still
    /// open at end of input and blocks repeating an earlier scan id are dropped.
    pub fn parse(raw: &[u8]) -> Result<Self, KiraError> {
        let mut segments = Vec::new();
        let mut current: Option<Vec<Vec<u8>>> = None;
        let mut seen_ids = HashSet::new();
        let mut block_count = 0usize;
        let mut dropped = 0usize;

        for line in raw.split_inclusive(|&byte| byte == b'\n') {
            let marker = line.trim_ascii();
            if marker == BLOCK_START.as_bytes() {
                if current.is_some() {
                    dropped += 1;
                }
                block_count += 1;
                current = Some(vec![line.to_vec()]);
            } else if marker == BLOCK_END.as_bytes() {
                let Some(mut lines) = current.take() else {
                    segments.push(Segment::Loose(line.to_vec()));
                    continue;
                };
                lines.push(line.to_vec());
                match ScanBlock::from_lines(lines) {
                    Some(block) => {
                        if let Some(id) = block.id() {
                            if !seen_ids.insert(id.clone()) {
                                debug!(scan = %id, "duplicate scan id dropped");
                                dropped += 1;
                                continue;
                            }
                        }
                        segments.push(Segment::Block(block));
                    }
                    None => dropped += 1,
                }
            } else if let Some(lines) = current.as_mut() {
                lines.push(line.to_vec());
            } else {
                segments.push(Segment::Loose(line.to_vec()));
            }
        }
        if current.is_some() {
            dropped += 1;
        }

        if block_count == 0 {
            return Err(KiraError::Format(format!(
                "no {BLOCK_START} blocks found"
            )));
        }
        let store = Self { segments };
        debug!(blocks = block_count, kept = store.len(), dropped, "parsed MGF");
        Ok(store)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &ScanBlock> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Block(block) => Some(block),
            Segment::Loose(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.blocks().count()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks().next().is_none()
    }

    /// Identifiers of the retained blocks, in file order.
    pub fn scan_ids(&self) -> Vec<ScanId> {
        self.blocks()
            .filter_map(|block| block.id().cloned())
            .collect()
    }

    /// Whole blocks whose id is in `keep`, in original order. Lines outside
    /// blocks and blocks without an id are not carried over.
    pub fn filter(&self, keep: &BTreeSet<ScanId>) -> ScanStore {
        let segments = self
            .blocks()
            .filter(|block| block.id().is_some_and(|id| keep.contains(id)))
            .cloned()
            .map(Segment::Block)
            .collect::<Vec<_>>();
        let total = self.len();
        info!(
            "Total Scans: {total} ** Kept: {} scans ** Excluded: {}",
            segments.len(),
            total - segments.len()
        );
        ScanStore { segments }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Loose(line) => out.extend_from_slice(line),
                Segment::Block(block) => {
                    for line in &block.lines {
                        out.extend_from_slice(line);
                    }
                }
            }
        }
        out
    }

    /// Writes the store to a fresh file in `dir`. The file lives as long as the
    /// returned handle.
    pub fn materialize(&self, dir: &Path, label: &str) -> Result<MaterializedSource, KiraError> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("kira-ba-{label}-"))
            .suffix(".mgf")
            .tempfile_in(dir)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        file.write_all(&self.to_bytes())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        file.flush()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        debug!(path = %file.path().display(), scans = self.len(), "materialized scan source");
        Ok(MaterializedSource {
            file,
            scan_count: self.len(),
        })
    }
}

/// A store written to disk for the query engine; deleted on drop.
#[derive(Debug)]
pub struct MaterializedSource {
    file: NamedTempFile,
    scan_count: usize,
}

impl MaterializedSource {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn scan_count(&self) -> usize {
        self.scan_count
    }
}

pub fn is_peak_line(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(mz), Some(intensity), None) => is_numeric_token(mz) && is_numeric_token(intensity),
        _ => false,
    }
}

/// Peak test for a raw line. Lines that are not valid UTF-8 are never peaks.
fn is_peak_bytes(line: &[u8]) -> bool {
    std::str::from_utf8(line).is_ok_and(is_peak_line)
}

fn is_numeric_token(token: &str) -> bool {
    let mut dots = 0;
    let mut digits = 0;
    for ch in token.chars() {
        match ch {
            '.' => dots += 1,
            '0'..='9' => digits += 1,
            _ => return false,
        }
    }
    dots <= 1 && digits > 0
}
