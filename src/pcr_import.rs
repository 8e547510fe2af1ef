//! Reads per-plate PCR instrument exports into canonical [`SampleRecord`]s.
//!
//! Both supported instrument families write a free-text preamble followed by
//! a CSV results table whose header line starts with `Well`. The table holds
//! one row per well and detector; rows are reordered into column-major plate
//! order and pivoted to one record per well.

use crate::config::PoolingParameters;
use crate::error::{PoolingError, Result};
use crate::sample::{BatchId, CtValue, SampleRecord, Well};
use csv::ReaderBuilder;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

lazy_static! {
    static ref BATCH_ID: Regex =
        Regex::new(r"(?:^|\D)(\d{5})(?:\D|$)").expect("valid batch id pattern");
}

const WELL_ALIASES: [&str; 2] = ["Well Position", "Well"];
const SAMPLE_ALIASES: [&str; 1] = ["Sample Name"];
const DETECTOR_ALIASES: [&str; 2] = ["Detector", "Target Name"];
const CT_ALIASES: [&str; 2] = ["Ct", "CT"];

pub type BatchTable = BTreeMap<BatchId, Vec<SampleRecord>>;

#[derive(Debug, Clone)]
struct DetectorRow {
    well: Well,
    sample_name: String,
    detector: String,
    ct: CtValue,
}

pub fn batch_id_from_file_name(name: &str) -> Result<BatchId> {
    BATCH_ID
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<BatchId>().ok())
        .ok_or_else(|| {
            PoolingError::malformed(format!("No five-digit batch id in file name '{name}'"))
        })
}

fn find_column(headers: &csv::StringRecord, aliases: &[&str]) -> Result<usize> {
    aliases
        .iter()
        .find_map(|alias| headers.iter().position(|h| h.trim() == *alias))
        .ok_or_else(|| {
            PoolingError::malformed(format!("Results table has no '{}' column", aliases[0]))
        })
}

fn normalize_sample_name(name: &str) -> String {
    let name = name.trim();
    if name == "UNKNOWN" {
        "Unknown".to_string()
    } else {
        name.to_string()
    }
}

fn read_detector_rows(text: &str) -> Result<Vec<DetectorRow>> {
    let start = text
        .split_inclusive('\n')
        .scan(0usize, |offset, line| {
            let here = *offset;
            *offset += line.len();
            Some((here, line))
        })
        .find(|(_, line)| line.starts_with("Well"))
        .map(|(offset, _)| offset)
        .ok_or_else(|| PoolingError::malformed("No results header line starting with 'Well'"))?;

    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .from_reader(text[start..].as_bytes());
    let headers = rdr.headers()?.clone();
    let well_idx = find_column(&headers, &WELL_ALIASES)?;
    let sample_idx = find_column(&headers, &SAMPLE_ALIASES)?;
    let detector_idx = find_column(&headers, &DETECTOR_ALIASES)?;
    let ct_idx = find_column(&headers, &CT_ALIASES)?;

    let mut rows = vec![];
    for record in rdr.records() {
        let record = record?;
        let cell = |idx: usize| record.get(idx).unwrap_or("").trim();
        if cell(well_idx).is_empty() {
            // the results block ends at the first row without a well
            break;
        }
        let well = Well::parse(cell(well_idx)).ok_or_else(|| {
            PoolingError::malformed(format!("Unreadable well '{}'", cell(well_idx)))
        })?;
        let ct = CtValue::parse(cell(ct_idx)).ok_or_else(|| {
            PoolingError::malformed(format!("Well {well}: unreadable Ct '{}'", cell(ct_idx)))
        })?;
        let detector = cell(detector_idx).to_string();
        if detector.is_empty() {
            return Err(PoolingError::malformed(format!("Well {well}: empty detector name")));
        }
        rows.push(DetectorRow {
            well,
            sample_name: normalize_sample_name(cell(sample_idx)),
            detector,
            ct,
        });
    }
    Ok(rows)
}

/// Parses one instrument export into per-well records in plate order.
pub fn parse_pcr_export(
    batch_id: BatchId,
    text: &str,
    params: &PoolingParameters,
) -> Result<Vec<SampleRecord>> {
    let mut rows = read_detector_rows(text)?;
    if rows.is_empty() {
        return Err(PoolingError::malformed(format!("Batch {batch_id}: results table is empty")));
    }
    if rows.len() % params.num_detectors != 0 {
        return Err(PoolingError::malformed(format!(
            "Batch {batch_id}: {} detector rows is not a multiple of {}",
            rows.len(),
            params.num_detectors
        )));
    }
    rows.sort_by_key(|r| r.well.column_major_key());

    rows.chunks(params.num_detectors)
        .enumerate()
        .map(|(idx, chunk)| {
            let first = &chunk[0];
            let mut detector_values = BTreeMap::new();
            for row in chunk {
                if row.well != first.well || row.sample_name != first.sample_name {
                    return Err(PoolingError::malformed(format!(
                        "Batch {batch_id}: well {} does not carry exactly {} detector rows",
                        first.well, params.num_detectors
                    )));
                }
                if detector_values.insert(row.detector.clone(), row.ct).is_some() {
                    return Err(PoolingError::malformed(format!(
                        "Batch {batch_id}: well {} reports '{}' twice",
                        row.well, row.detector
                    )));
                }
            }
            Ok(SampleRecord {
                batch_id,
                position: idx as u32 + 1,
                well: first.well,
                sample_name: first.sample_name.clone(),
                detector_values,
            })
        })
        .collect()
}

/// Instrument exports in `dir`, sorted by file name.
pub fn discover_pcr_exports(dir: &Path, params: &PoolingParameters) -> Result<Vec<PathBuf>> {
    let mut ret = vec![];
    for entry in fs::read_dir(dir).map_err(|e| {
        PoolingError::io(format!("Could not list input directory '{}': {e}", dir.display()))
    })? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(&params.pcr_file_prefix) {
            continue;
        }
        if !entry.file_type()?.is_file() {
            warn!(file = %name, "skipping non-file PCR export entry");
            continue;
        }
        ret.push(entry.path());
    }
    ret.sort();
    Ok(ret)
}

pub fn import_pcr_exports(paths: &[PathBuf], params: &PoolingParameters) -> Result<BatchTable> {
    let mut batches = BatchTable::new();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let batch_id = batch_id_from_file_name(&name)?;
        let bytes = fs::read(path).map_err(|e| {
            PoolingError::io(format!("Could not read PCR export '{}': {e}", path.display()))
        })?;
        // exports occasionally carry stray non-UTF-8 bytes in the preamble
        let text = String::from_utf8_lossy(&bytes);
        let samples = parse_pcr_export(batch_id, &text, params)?;
        info!(batch = batch_id, file = %name, samples = samples.len(), "imported PCR export");
        if batches.insert(batch_id, samples).is_some() {
            return Err(PoolingError::malformed(format!(
                "Batch {batch_id} appears in more than one PCR export"
            )));
        }
    }
    Ok(batches)
}
