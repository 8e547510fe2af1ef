use crate::config::PoolingParameters;
use crate::error::{ErrorCode, PoolingError, Result};
use crate::ledger::{AllocationEntry, Ledger};
use crate::sample::BatchId;
use csv::WriterBuilder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::{debug, info};

/// One liquid-handler transfer, serialized in the handler's column layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    #[serde(rename = "Source Labware Label")]
    pub source_label: String,
    #[serde(rename = "Sample Location")]
    pub source_slot: u32,
    #[serde(rename = "Destination Labware Label")]
    pub destination_label: String,
    #[serde(rename = "Destination Location")]
    pub destination_slot: u32,
    #[serde(rename = "Volume")]
    pub volume_ul: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAssignment {
    pub label: String,
    pub batch: BatchId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateWorklist {
    pub plate_id: String,
    pub sources: Vec<SourceAssignment>,
    pub transfers: Vec<TransferRecord>,
}

impl PlateWorklist {
    /// `{plate}_{batch}_{batch}….csv`, batches in source-label order.
    pub fn file_name(&self) -> String {
        let batches = self.sources.iter().map(|s| s.batch.to_string()).join("_");
        format!("{}_{batches}.csv", self.plate_id)
    }

    pub fn to_csv_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = WriterBuilder::new().from_writer(writer);
        for transfer in &self.transfers {
            wtr.serialize(transfer)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Source labels for the distinct batches on a plate, by first appearance.
pub fn assign_source_labels(
    entries: &[AllocationEntry],
    label_prefix: &str,
) -> Vec<SourceAssignment> {
    entries
        .iter()
        .map(|e| e.source_batch)
        .unique()
        .enumerate()
        .map(|(idx, batch)| SourceAssignment {
            label: format!("{label_prefix}{}", idx + 1),
            batch,
        })
        .collect()
}

/// Builds the transfer list for one plate. Returns `None` while the plate is
/// below capacity; such a plate waits for a later run.
pub fn compile_worklist(
    plate_id: &str,
    entries: &[AllocationEntry],
    params: &PoolingParameters,
) -> Result<Option<PlateWorklist>> {
    let capacity = params.capacity() as usize;
    if entries.iter().any(|e| e.plate_id != plate_id) {
        return Err(PoolingError::new(
            ErrorCode::Internal,
            format!("Worklist for '{plate_id}' was given rows of another plate"),
        ));
    }
    if entries.len() < capacity {
        debug!(plate = plate_id, filled = entries.len(), capacity, "plate incomplete, no worklist");
        return Ok(None);
    }
    if entries.len() > capacity {
        return Err(PoolingError::capacity(format!(
            "Plate '{plate_id}' holds {} samples, capacity is {capacity}",
            entries.len()
        )));
    }

    let mut ordered = entries.to_vec();
    ordered.sort_by_key(|e| e.destination_slot);
    if let Some(pair) = ordered
        .windows(2)
        .find(|w| w[0].destination_slot == w[1].destination_slot)
    {
        return Err(PoolingError::capacity(format!(
            "Plate '{plate_id}' has slot {} twice",
            pair[0].destination_slot
        )));
    }

    let sources = assign_source_labels(&ordered, &params.source_label_prefix);
    let transfers = ordered
        .iter()
        .map(|e| {
            let label = sources
                .iter()
                .find(|s| s.batch == e.source_batch)
                .map(|s| s.label.clone())
                .unwrap_or_default();
            TransferRecord {
                source_label: label,
                source_slot: e.source_slot,
                destination_label: params.destination_label.clone(),
                destination_slot: e.destination_slot,
                volume_ul: params.transfer_volume_ul,
            }
        })
        .collect();

    info!(plate = plate_id, sources = sources.len(), "compiled worklist");
    Ok(Some(PlateWorklist {
        plate_id: plate_id.to_string(),
        sources,
        transfers,
    }))
}

/// Worklists for every listed plate that is now full.
pub fn compile_worklists(
    ledger: &Ledger,
    plate_ids: &[String],
    params: &PoolingParameters,
) -> Result<Vec<PlateWorklist>> {
    let mut ret = vec![];
    for plate_id in plate_ids {
        let entries = ledger.entries_for_plate(plate_id);
        if let Some(worklist) = compile_worklist(plate_id, &entries, params)? {
            ret.push(worklist);
        }
    }
    Ok(ret)
}
