//! Canonical per-well PCR records shared by every pooling stage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type BatchId = u32;

pub const UNDETERMINED: &str = "Undetermined";

/// A Ct reading. `Undetermined` means no detection and never passes a cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CtValue {
    Detected(f64),
    Undetermined,
}

impl CtValue {
    pub fn is_below(&self, cutoff: f64) -> bool {
        match self {
            CtValue::Detected(ct) => *ct < cutoff,
            CtValue::Undetermined => false,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case(UNDETERMINED) {
            return Some(CtValue::Undetermined);
        }
        text.parse::<f64>()
            .ok()
            .filter(|ct| ct.is_finite())
            .map(CtValue::Detected)
    }
}

impl fmt::Display for CtValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtValue::Detected(ct) => write!(f, "{ct}"),
            CtValue::Undetermined => write!(f, "{UNDETERMINED}"),
        }
    }
}

/// Physical well address on a source plate, e.g. `B7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Well {
    pub row: char,
    pub column: u32,
}

impl Well {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let mut chars = text.chars();
        let row = chars.next()?.to_ascii_uppercase();
        if !('A'..='P').contains(&row) {
            return None;
        }
        let column = chars.as_str().parse::<u32>().ok().filter(|c| *c > 0)?;
        Some(Self { row, column })
    }

    /// Sort key for plate order: down each column, then across.
    pub fn column_major_key(&self) -> (u32, char) {
        (self.column, self.row)
    }
}

impl fmt::Display for Well {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row, self.column)
    }
}

/// One physical sample at one well of one source batch, after pivoting the
/// detector rows into columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub batch_id: BatchId,
    /// 1-based position in column-major plate order.
    pub position: u32,
    pub well: Well,
    pub sample_name: String,
    pub detector_values: BTreeMap<String, CtValue>,
}

impl SampleRecord {
    pub fn ct(&self, detector: &str) -> Option<CtValue> {
        self.detector_values.get(detector).copied()
    }
}
