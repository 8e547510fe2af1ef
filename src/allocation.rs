//! Placement of eligible samples onto sequencing plates.
//!
//! Placement is a two-state machine. A plate is `Open` while it has free
//! usable slots; crossing the capacity boundary closes it, and the next
//! sample mints a fresh plate id. Slot arithmetic lives in
//! [`PlateState::place`] so it can be exercised without any file I/O.

use crate::config::PoolingParameters;
use crate::error::{PoolingError, Result};
use crate::ledger::{AllocationEntry, Ledger, PlateContinuation, format_plate_id};
use crate::sample::{BatchId, SampleRecord};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Usable slot window of one destination plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlateLayout {
    pub slot_low: u32,
    pub capacity: u32,
}

impl PlateLayout {
    pub fn from_parameters(params: &PoolingParameters) -> Self {
        Self {
            slot_low: params.slot_low,
            capacity: params.capacity(),
        }
    }

    /// Destination slot for the `cursor`-th sample on a plate.
    pub fn slot_for(&self, cursor: u32) -> u32 {
        (cursor % self.capacity) + self.slot_low
    }
}

/// Hands out consecutive plate ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateIdMinter {
    prefix: String,
    next_number: u32,
}

impl PlateIdMinter {
    pub fn new(prefix: &str, next_number: u32) -> Self {
        Self {
            prefix: prefix.to_string(),
            next_number,
        }
    }

    pub fn mint(&mut self) -> Result<String> {
        let id = format_plate_id(&self.prefix, self.next_number);
        self.next_number = self.next_number.checked_add(1).ok_or_else(|| {
            PoolingError::capacity(format!("Plate numbering overflowed after '{id}'"))
        })?;
        Ok(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlateState {
    NoOpenPlate,
    Open { plate_id: String, filled: u32 },
}

/// Result of placing one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub plate_id: String,
    pub destination_slot: u32,
    /// The sample took the last usable slot of its plate.
    pub closed_plate: bool,
    /// The sample started a freshly minted plate.
    pub minted_plate: bool,
}

impl PlateState {
    pub fn from_continuation(cont: &PlateContinuation, layout: &PlateLayout) -> Self {
        match &cont.last_plate_id {
            Some(plate_id) if cont.filled < layout.capacity => PlateState::Open {
                plate_id: plate_id.clone(),
                filled: cont.filled,
            },
            _ => PlateState::NoOpenPlate,
        }
    }

    /// Transition for one sample: returns the successor state and where the
    /// sample goes.
    pub fn place(
        self,
        layout: &PlateLayout,
        minter: &mut PlateIdMinter,
    ) -> Result<(PlateState, Placement)> {
        let (plate_id, cursor, minted_plate) = match self {
            // an "open" plate that is already full must never be appended to
            PlateState::Open { plate_id, filled } if filled < layout.capacity => {
                (plate_id, filled, false)
            }
            _ => (minter.mint()?, 0, true),
        };
        let destination_slot = layout.slot_for(cursor);
        let filled = cursor + 1;
        let closed_plate = filled == layout.capacity;
        let next = if closed_plate {
            PlateState::NoOpenPlate
        } else {
            PlateState::Open {
                plate_id: plate_id.clone(),
                filled,
            }
        };
        Ok((
            next,
            Placement {
                plate_id,
                destination_slot,
                closed_plate,
                minted_plate,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub ledger: Ledger,
    /// Distinct plates that received at least one sample, in placement order.
    pub touched_plates: Vec<String>,
    pub placed: usize,
}

/// Drives [`PlateState`] over a run's samples and guards the slot
/// uniqueness invariant per plate.
#[derive(Debug, Clone)]
pub struct PlateAllocator {
    layout: PlateLayout,
    state: PlateState,
    minter: PlateIdMinter,
    occupied: HashMap<String, BTreeSet<u32>>,
    ledger: Ledger,
    touched: Vec<String>,
    placed: usize,
}

impl PlateAllocator {
    pub fn resume(params: &PoolingParameters, prior: Ledger) -> Result<Self> {
        let layout = PlateLayout::from_parameters(params);
        let cont = prior.continuation(params)?;
        let state = PlateState::from_continuation(&cont, &layout);
        match &state {
            PlateState::Open { plate_id, filled } => {
                info!(
                    plate = %plate_id,
                    filled,
                    capacity = layout.capacity,
                    "continuing open plate"
                )
            }
            PlateState::NoOpenPlate => {
                if let Some(plate_id) = &cont.last_plate_id {
                    info!(plate = %plate_id, "last plate in ledger is already full");
                }
            }
        }
        let mut occupied: HashMap<String, BTreeSet<u32>> = HashMap::new();
        if let PlateState::Open { plate_id, .. } = &state {
            occupied.insert(
                plate_id.clone(),
                prior
                    .entries()
                    .iter()
                    .filter(|e| &e.plate_id == plate_id)
                    .map(|e| e.destination_slot)
                    .collect(),
            );
        }
        Ok(Self {
            layout,
            state,
            minter: PlateIdMinter::new(&params.plate_prefix, cont.next_plate_number),
            occupied,
            ledger: prior,
            touched: vec![],
            placed: 0,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_state(mut self, state: PlateState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &PlateState {
        &self.state
    }

    pub fn place(&mut self, batch_id: BatchId, sample: &SampleRecord) -> Result<AllocationEntry> {
        let state = std::mem::replace(&mut self.state, PlateState::NoOpenPlate);
        let (next, placement) = state.place(&self.layout, &mut self.minter)?;

        let used = self.occupied.entry(placement.plate_id.clone()).or_default();
        if !used.insert(placement.destination_slot) {
            return Err(PoolingError::capacity(format!(
                "Slot {} on plate '{}' was assigned twice",
                placement.destination_slot, placement.plate_id
            )));
        }
        if used.len() > self.layout.capacity as usize {
            return Err(PoolingError::capacity(format!(
                "Plate '{}' exceeds its capacity of {}",
                placement.plate_id, self.layout.capacity
            )));
        }

        if self.touched.last() != Some(&placement.plate_id) {
            self.touched.push(placement.plate_id.clone());
        }
        if placement.minted_plate {
            info!(plate = %placement.plate_id, "opened new plate");
        }
        if placement.closed_plate {
            info!(plate = %placement.plate_id, "plate filled");
        }
        debug!(
            plate = %placement.plate_id,
            slot = placement.destination_slot,
            batch = batch_id,
            sample = %sample.sample_name,
            "placed sample"
        );

        let entry = AllocationEntry {
            plate_id: placement.plate_id,
            destination_slot: placement.destination_slot,
            source_slot: sample.position,
            sample_name: sample.sample_name.clone(),
            source_batch: batch_id,
        };
        self.ledger.push(entry.clone());
        self.placed += 1;
        self.state = next;
        Ok(entry)
    }

    pub fn finish(self) -> AllocationOutcome {
        AllocationOutcome {
            ledger: self.ledger,
            touched_plates: self.touched,
            placed: self.placed,
        }
    }
}

/// Places every eligible sample, batch by batch in the given order, after the
/// prior ledger's last plate.
pub fn allocate<'a, I>(
    params: &PoolingParameters,
    prior: Ledger,
    batches: I,
) -> Result<AllocationOutcome>
where
    I: IntoIterator<Item = (BatchId, &'a [SampleRecord])>,
{
    let mut allocator = PlateAllocator::resume(params, prior)?;
    for (batch_id, samples) in batches {
        for sample in samples {
            allocator.place(batch_id, sample)?;
        }
    }
    Ok(allocator.finish())
}
