//! The append-only plate ledger: one row per sample placed on a sequencing
//! plate, carried from run to run.

use crate::config::PoolingParameters;
use crate::error::{PoolingError, Result};
use crate::sample::BatchId;
use csv::{ReaderBuilder, WriterBuilder};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub const COL_PLATE_ID: &str = "PlateID";
pub const COL_DESTINATION_SLOT: &str = "DestinationSlot";
pub const COL_SOURCE_SLOT: &str = "SourceSlot";
pub const COL_SAMPLE_NAME: &str = "SampleName";
pub const COL_SOURCE_BATCH: &str = "SourceBatch";

const LEDGER_COLUMNS: [&str; 5] = [
    COL_PLATE_ID,
    COL_DESTINATION_SLOT,
    COL_SOURCE_SLOT,
    COL_SAMPLE_NAME,
    COL_SOURCE_BATCH,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEntry {
    #[serde(rename = "PlateID")]
    pub plate_id: String,
    #[serde(rename = "DestinationSlot")]
    pub destination_slot: u32,
    #[serde(rename = "SourceSlot")]
    pub source_slot: u32,
    #[serde(rename = "SampleName")]
    pub sample_name: String,
    #[serde(rename = "SourceBatch")]
    pub source_batch: BatchId,
}

/// Where the previous run left off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateContinuation {
    pub last_plate_id: Option<String>,
    pub filled: u32,
    pub last_filled_slot: Option<u32>,
    pub next_plate_number: u32,
}

impl PlateContinuation {
    pub fn is_open(&self, capacity: u32) -> bool {
        self.last_plate_id.is_some() && self.filled < capacity
    }
}

/// Numeric suffix of a plate id such as `COVSEQ_17`.
pub fn plate_number(plate_id: &str, prefix: &str) -> Option<u32> {
    let suffix = plate_id.strip_prefix(prefix)?;
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

pub fn format_plate_id(prefix: &str, number: u32) -> String {
    format!("{prefix}{number}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    entries: Vec<AllocationEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<AllocationEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[AllocationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, entry: AllocationEntry) {
        self.entries.push(entry);
    }

    /// Plate ids in order of first appearance.
    pub fn plate_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.plate_id.clone())
            .unique()
            .collect()
    }

    pub fn entries_for_plate(&self, plate_id: &str) -> Vec<AllocationEntry> {
        self.entries
            .iter()
            .filter(|e| e.plate_id == plate_id)
            .cloned()
            .collect()
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = rdr.headers()?.clone();
        let mut index = HashMap::new();
        for column in LEDGER_COLUMNS {
            let idx = headers
                .iter()
                .position(|h| h.trim() == column)
                .ok_or_else(|| {
                    PoolingError::malformed(format!("Ledger is missing the '{column}' column"))
                })?;
            index.insert(column, idx);
        }

        let mut entries = vec![];
        for (row_idx, record) in rdr.records().enumerate() {
            let record = record?;
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            let line = row_idx + 2;
            let text = |column: &str| -> Result<String> {
                let value = record.get(index[column]).unwrap_or("").trim();
                if value.is_empty() {
                    return Err(PoolingError::malformed(format!(
                        "Ledger line {line}: empty '{column}'"
                    )));
                }
                Ok(value.to_string())
            };
            let number = |column: &str| -> Result<u32> {
                let value = text(column)?;
                parse_location(&value).ok_or_else(|| {
                    PoolingError::malformed(format!(
                        "Ledger line {line}: '{column}' is not an integer: '{value}'"
                    ))
                })
            };
            entries.push(AllocationEntry {
                plate_id: text(COL_PLATE_ID)?,
                destination_slot: number(COL_DESTINATION_SLOT)?,
                source_slot: number(COL_SOURCE_SLOT)?,
                sample_name: text(COL_SAMPLE_NAME)?,
                source_batch: number(COL_SOURCE_BATCH)?,
            });
        }
        Ok(Self { entries })
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PoolingError::io(format!("Could not read ledger '{}': {e}", path.display()))
        })?;
        Self::from_csv_reader(file)
    }

    pub fn to_csv_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(writer);
        wtr.write_record(LEDGER_COLUMNS)?;
        for entry in &self.entries {
            wtr.serialize(entry)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Writes the complete ledger to a temporary file in the directory of
    /// `path`, ready to be renamed over it.
    pub fn stage_next_to(&self, path: &Path) -> Result<NamedTempFile> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        self.to_csv_writer(&mut tmp)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    /// Replaces `path` with this ledger; readers see either the old or the
    /// new file, never a partial one.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let tmp = self.stage_next_to(path)?;
        tmp.persist(path).map_err(|e| {
            PoolingError::io(format!("Could not replace ledger '{}': {e}", path.display()))
        })?;
        Ok(())
    }

    pub fn validate(&self, params: &PoolingParameters) -> Result<()> {
        let capacity = params.capacity() as usize;
        let mut finished: HashSet<&str> = HashSet::new();
        let mut current: Option<&str> = None;
        let mut slots: HashMap<&str, BTreeSet<u32>> = HashMap::new();

        for entry in &self.entries {
            let plate = entry.plate_id.as_str();
            if plate_number(plate, &params.plate_prefix).is_none() {
                return Err(PoolingError::malformed(format!(
                    "Plate id '{plate}' does not match '{}<number>'",
                    params.plate_prefix
                )));
            }
            if current != Some(plate) {
                if finished.contains(plate) {
                    return Err(PoolingError::malformed(format!(
                        "Plate '{plate}' rows are interleaved with another plate"
                    )));
                }
                if let Some(prev) = current {
                    finished.insert(prev);
                }
                current = Some(plate);
            }
            if !(params.slot_low..=params.slot_high).contains(&entry.destination_slot) {
                return Err(PoolingError::malformed(format!(
                    "Plate '{plate}' uses slot {} outside {}..={}",
                    entry.destination_slot, params.slot_low, params.slot_high
                )));
            }
            let used = slots.entry(plate).or_default();
            if !used.insert(entry.destination_slot) {
                return Err(PoolingError::malformed(format!(
                    "Plate '{plate}' uses slot {} twice",
                    entry.destination_slot
                )));
            }
            if used.len() > capacity {
                return Err(PoolingError::malformed(format!(
                    "Plate '{plate}' holds more than {capacity} samples"
                )));
            }
        }
        Ok(())
    }

    pub fn continuation(&self, params: &PoolingParameters) -> Result<PlateContinuation> {
        self.validate(params)?;
        let highest = self
            .entries
            .iter()
            .filter_map(|e| plate_number(&e.plate_id, &params.plate_prefix))
            .max();
        let next_plate_number = match highest {
            Some(n) => n.checked_add(1).ok_or_else(|| {
                PoolingError::malformed(format!("Plate number {n} cannot be continued"))
            })?,
            None => params.first_plate_number,
        };

        let Some(last) = self.entries.last() else {
            return Ok(PlateContinuation {
                last_plate_id: None,
                filled: 0,
                last_filled_slot: None,
                next_plate_number,
            });
        };
        let last_slots: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.plate_id == last.plate_id)
            .map(|e| e.destination_slot)
            .collect();
        let filled = last_slots.len() as u32;
        let max_slot = last_slots.iter().copied().max().unwrap_or(params.slot_low);
        if filled < params.capacity() && max_slot != params.slot_low + filled - 1 {
            return Err(PoolingError::malformed(format!(
                "Open plate '{}' has {filled} samples but its highest slot is {max_slot}",
                last.plate_id
            )));
        }
        Ok(PlateContinuation {
            last_plate_id: Some(last.plate_id.clone()),
            filled,
            last_filled_slot: Some(last.destination_slot),
            next_plate_number,
        })
    }
}

fn parse_location(value: &str) -> Option<u32> {
    if let Ok(v) = value.parse::<u32>() {
        return Some(v);
    }
    // spreadsheet round-trips turn integer columns into "93.0"
    let v = value.parse::<f64>().ok()?;
    (v.fract() == 0.0 && v >= 0.0 && v <= u32::MAX as f64).then_some(v as u32)
}
