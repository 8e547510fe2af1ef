//! One pooling run: qualify, allocate, compile worklists, report unsat
//! samples, then commit all outputs at once.

use crate::allocation::allocate;
use crate::config::PoolingParameters;
use crate::error::{PoolingError, Result};
use crate::ledger::Ledger;
use crate::pcr_import::BatchTable;
use crate::qualification::{QualifiedBatch, qualify_batch};
use crate::sample::BatchId;
use crate::unsat::{UnsatRecord, collect_unsat, unsat_detectors, write_unsat_csv};
use crate::worklist::{PlateWorklist, compile_worklists};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlateStatus {
    Complete,
    /// Below capacity; continued by a later run.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateSummary {
    pub plate_id: String,
    pub filled: usize,
    pub capacity: u32,
    pub status: PlateStatus,
    pub worklist: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub batches: Vec<BatchId>,
    pub samples: usize,
    pub controls: usize,
    pub eligible: usize,
    pub unsat: usize,
    pub placed: usize,
    pub plates: Vec<PlateSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub ledger: Ledger,
    pub worklists: Vec<PlateWorklist>,
    pub unsat: Vec<UnsatRecord>,
    /// Detector columns of the UNSAT report.
    pub unsat_detectors: Vec<String>,
    pub summary: RunSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    pub output_dir: String,
    pub ledger: String,
    pub files: Vec<String>,
}

pub struct PoolingRun<'a> {
    params: &'a PoolingParameters,
}

impl<'a> PoolingRun<'a> {
    pub fn new(params: &'a PoolingParameters) -> Self {
        Self { params }
    }

    /// Computes the whole run in memory. Nothing is written.
    pub fn execute(&self, prior: Ledger, batches: &BatchTable) -> Result<RunReport> {
        let params = self.params;
        params.validate()?;

        let mut qualified: BTreeMap<BatchId, QualifiedBatch> = BTreeMap::new();
        let mut summary = RunSummary::default();
        for (batch_id, samples) in batches {
            if let Some(stray) = samples.iter().find(|s| s.batch_id != *batch_id) {
                return Err(PoolingError::malformed(format!(
                    "Batch {batch_id} table holds well {} of batch {}",
                    stray.well, stray.batch_id
                )));
            }
            let q = qualify_batch(samples, params)?;
            info!(
                batch = batch_id,
                eligible = q.eligible.len(),
                rejected = q.rejected.len(),
                "qualified batch"
            );
            summary.batches.push(*batch_id);
            summary.samples += samples.len();
            summary.controls += samples
                .iter()
                .filter(|s| params.is_control(&s.sample_name))
                .count();
            summary.eligible += q.eligible.len();
            qualified.insert(*batch_id, q);
        }

        let outcome = allocate(
            params,
            prior,
            qualified.iter().map(|(id, q)| (*id, q.eligible.as_slice())),
        )?;
        let worklists = compile_worklists(&outcome.ledger, &outcome.touched_plates, params)?;
        let unsat = collect_unsat(
            qualified.iter().map(|(id, q)| (*id, q.rejected.as_slice())),
            params,
        );

        let detectors = unsat_detectors(batches.values().flatten(), params);
        summary.unsat = unsat.len();
        summary.placed = outcome.placed;
        summary.plates = outcome
            .touched_plates
            .iter()
            .map(|plate_id| {
                let worklist = worklists.iter().find(|w| &w.plate_id == plate_id);
                PlateSummary {
                    plate_id: plate_id.clone(),
                    filled: outcome.ledger.entries_for_plate(plate_id).len(),
                    capacity: params.capacity(),
                    status: if worklist.is_some() {
                        PlateStatus::Complete
                    } else {
                        PlateStatus::Incomplete
                    },
                    worklist: worklist.map(PlateWorklist::file_name),
                }
            })
            .collect();
        info!(
            placed = summary.placed,
            plates = summary.plates.len(),
            worklists = worklists.len(),
            unsat = summary.unsat,
            "run computed"
        );

        Ok(RunReport {
            ledger: outcome.ledger,
            worklists,
            unsat,
            unsat_detectors: detectors,
            summary,
        })
    }
}

pub fn ledger_snapshot_name(date: &str) -> String {
    format!("BatchSmash {date}.csv")
}

pub fn unsat_report_name(date: &str) -> String {
    format!("UNSAT {date}.csv")
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Puts the outputs parked in `backup` back at `output_dir`, first removing
/// the new outputs if they were already `swapped_in`. When the restore fails
/// the backup directory is kept on disk and named in the returned error.
fn restore_previous(
    backup: TempDir,
    output_dir: &Path,
    swapped_in: bool,
    cause: String,
) -> PoolingError {
    match swap_back(&backup.path().join("outputs"), output_dir, swapped_in) {
        Ok(()) => PoolingError::io(cause),
        Err(e) => {
            let kept = backup.keep();
            warn!(backup = %kept.display(), "could not restore previous outputs: {e}");
            PoolingError::io(format!(
                "{cause}; previous outputs could not be restored ({e}) and are kept in '{}'",
                kept.join("outputs").display()
            ))
        }
    }
}

fn swap_back(previous: &Path, output_dir: &Path, swapped_in: bool) -> std::io::Result<()> {
    if swapped_in {
        fs::remove_dir_all(output_dir)?;
    }
    if previous.exists() {
        fs::rename(previous, output_dir)?;
    }
    Ok(())
}

impl RunReport {
    fn write_outputs(&self, dir: &Path, date: &str) -> Result<Vec<String>> {
        let mut files = vec![];

        let name = ledger_snapshot_name(date);
        self.ledger
            .to_csv_writer(BufWriter::new(File::create(dir.join(&name))?))?;
        files.push(name);

        for worklist in &self.worklists {
            let name = worklist.file_name();
            worklist.to_csv_writer(BufWriter::new(File::create(dir.join(&name))?))?;
            files.push(name);
        }

        let name = unsat_report_name(date);
        write_unsat_csv(
            &self.unsat,
            &self.unsat_detectors,
            BufWriter::new(File::create(dir.join(&name))?),
        )?;
        files.push(name);
        Ok(files)
    }

    /// Persists the run. `output_dir` is replaced as a whole and the ledger
    /// file is renamed into place last; if any step fails, the previous
    /// outputs and ledger are left as they were.
    pub fn commit(
        &self,
        output_dir: &Path,
        ledger_path: &Path,
        date: &str,
    ) -> Result<CommitReport> {
        let parent = parent_dir(output_dir);
        fs::create_dir_all(&parent)?;

        let staging = tempfile::Builder::new()
            .prefix(".covseq-staging-")
            .tempdir_in(&parent)?;
        let files = self.write_outputs(staging.path(), date)?;
        let staged_ledger = self.ledger.stage_next_to(ledger_path)?;

        let backup = tempfile::Builder::new()
            .prefix(".covseq-previous-")
            .tempdir_in(&parent)?;
        let previous = backup.path().join("outputs");
        if output_dir.exists() {
            fs::rename(output_dir, &previous)?;
        }
        if let Err(e) = fs::rename(staging.path(), output_dir) {
            return Err(restore_previous(
                backup,
                output_dir,
                false,
                format!("Could not move outputs into '{}': {e}", output_dir.display()),
            ));
        }
        if let Err(e) = staged_ledger.persist(ledger_path) {
            warn!(
                ledger = %ledger_path.display(),
                "ledger replace failed, restoring previous outputs"
            );
            return Err(restore_previous(
                backup,
                output_dir,
                true,
                format!("Could not replace ledger '{}': {e}", ledger_path.display()),
            ));
        }

        info!(output = %output_dir.display(), files = files.len(), "outputs committed");
        Ok(CommitReport {
            output_dir: output_dir.display().to_string(),
            ledger: ledger_path.display().to_string(),
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::ledger::AllocationEntry;
    use crate::sample::{CtValue, SampleRecord, Well};
    use tempfile::tempdir;

    fn params() -> PoolingParameters {
        PoolingParameters {
            slot_low: 2,
            slot_high: 6,
            ..PoolingParameters::default()
        }
    }

    fn sample(batch_id: BatchId, position: u32, name: &str, n: f64) -> SampleRecord {
        let mut detector_values = BTreeMap::new();
        detector_values.insert("MS2 gene".to_string(), CtValue::Detected(24.0));
        detector_values.insert("N gene".to_string(), CtValue::Detected(n));
        detector_values.insert("ORF1ab".to_string(), CtValue::Detected(n + 1.0));
        detector_values.insert("S gene".to_string(), CtValue::Detected(n));
        SampleRecord {
            batch_id,
            position,
            well: Well {
                row: (b'A' + ((position - 1) % 8) as u8) as char,
                column: (position - 1) / 8 + 1,
            },
            sample_name: name.to_string(),
            detector_values,
        }
    }

    fn batches() -> BatchTable {
        let mut table = BatchTable::new();
        table.insert(
            10024,
            vec![
                sample(10024, 1, "PC", 18.0),
                sample(10024, 2, "B2", 21.0),
                sample(10024, 3, "B3", 35.0),
                sample(10024, 4, "NC", 40.0),
            ],
        );
        table.insert(
            10023,
            vec![
                sample(10023, 1, "A1", 20.0),
                sample(10023, 2, "A2", 31.0),
                sample(10023, 3, "A3", 22.0),
            ],
        );
        table
    }

    fn prior() -> Ledger {
        Ledger::from_entries(
            (2..=4)
                .map(|slot| AllocationEntry {
                    plate_id: "COVSEQ_11".to_string(),
                    destination_slot: slot,
                    source_slot: slot,
                    sample_name: format!("old{slot}"),
                    source_batch: 10020,
                })
                .collect(),
        )
    }

    #[test]
    fn test_execute_end_to_end() {
        let params = params();
        let report = PoolingRun::new(&params).execute(prior(), &batches()).unwrap();
        let placed: Vec<(String, u32, BatchId, u32)> = report.ledger.entries()[3..]
            .iter()
            .map(|e| (e.plate_id.clone(), e.destination_slot, e.source_batch, e.source_slot))
            .collect();
        assert_eq!(
            placed,
            vec![
                ("COVSEQ_11".to_string(), 5, 10023, 1),
                ("COVSEQ_11".to_string(), 6, 10023, 3),
                ("COVSEQ_12".to_string(), 2, 10024, 2),
            ]
        );
        assert_eq!(report.worklists.len(), 1);
        assert_eq!(report.worklists[0].file_name(), "COVSEQ_11_10020_10023.csv");
        let unsat: Vec<&str> = report.unsat.iter().map(|u| u.sample.sample_name.as_str()).collect();
        assert_eq!(unsat, vec!["A2", "B3"]);
        assert_eq!(report.summary.batches, vec![10023, 10024]);
        assert_eq!(report.summary.samples, 7);
        assert_eq!(report.summary.controls, 2);
        assert_eq!(report.summary.eligible, 3);
        assert_eq!(
            report.summary.plates.iter().map(|p| p.status).collect::<Vec<_>>(),
            vec![PlateStatus::Complete, PlateStatus::Incomplete]
        );
    }

    #[test]
    fn test_commit_writes_all_outputs() {
        let td = tempdir().unwrap();
        let ledger_path = td.path().join("BatchSmash.csv");
        let output = td.path().join("Output");
        prior().save_to_path(&ledger_path).unwrap();
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("stale.csv"), "old").unwrap();

        let params = params();
        let report = PoolingRun::new(&params).execute(prior(), &batches()).unwrap();
        let commit = report.commit(&output, &ledger_path, "2021-03-01").unwrap();
        assert_eq!(
            commit.files,
            vec![
                "BatchSmash 2021-03-01.csv".to_string(),
                "COVSEQ_11_10020_10023.csv".to_string(),
                "UNSAT 2021-03-01.csv".to_string(),
            ]
        );
        assert!(!output.join("stale.csv").exists());
        for name in &commit.files {
            assert!(output.join(name).exists(), "{name}");
        }
        assert_eq!(Ledger::load_from_path(&ledger_path).unwrap(), report.ledger);
        let leftovers: Vec<_> = fs::read_dir(td.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with(".covseq"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_failed_commit_keeps_previous_state() {
        let td = tempdir().unwrap();
        let ledger_path = td.path().join("missing-dir").join("BatchSmash.csv");
        let output = td.path().join("Output");
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("previous.csv"), "old").unwrap();

        let params = params();
        let report = PoolingRun::new(&params).execute(prior(), &batches()).unwrap();
        let err = report.commit(&output, &ledger_path, "2021-03-01").unwrap_err();
        assert_eq!(err.code, ErrorCode::Io);
        assert!(output.join("previous.csv").exists());
        assert!(!output.join("UNSAT 2021-03-01.csv").exists());
    }

    fn entry_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_ledger_replace_failure_restores_outputs() {
        let td = tempdir().unwrap();
        let ledger_path = td.path().join("ledger_is_dir");
        fs::create_dir_all(&ledger_path).unwrap();
        let output = td.path().join("Output");
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("previous.csv"), "old").unwrap();

        let params = params();
        let report = PoolingRun::new(&params).execute(prior(), &batches()).unwrap();
        let err = report.commit(&output, &ledger_path, "2021-03-01").unwrap_err();
        assert_eq!(err.code, ErrorCode::Io);
        assert!(err.message.contains("Could not replace ledger"), "{}", err.message);
        assert_eq!(fs::read_to_string(output.join("previous.csv")).unwrap(), "old");
        assert_eq!(entry_names(&output), vec!["previous.csv".to_string()]);
        assert_eq!(
            entry_names(td.path()),
            vec!["Output".to_string(), "ledger_is_dir".to_string()]
        );
    }

    #[test]
    fn test_failed_restore_keeps_backup_on_disk() {
        let td = tempdir().unwrap();
        let backup = tempfile::Builder::new()
            .prefix(".covseq-previous-")
            .tempdir_in(td.path())
            .unwrap();
        let parked = backup.path().join("outputs");
        fs::create_dir_all(&parked).unwrap();
        fs::write(parked.join("previous.csv"), "old").unwrap();

        let unreachable = td.path().join("gone").join("Output");
        let err = restore_previous(backup, &unreachable, false, "swap failed".to_string());
        assert_eq!(err.code, ErrorCode::Io);
        assert!(err.message.starts_with("swap failed;"));
        assert!(err.message.contains(&parked.display().to_string()), "{}", err.message);
        assert_eq!(fs::read_to_string(parked.join("previous.csv")).unwrap(), "old");
    }

    #[test]
    fn test_unsat_report_keeps_columns_when_all_pass() {
        let td = tempdir().unwrap();
        let ledger_path = td.path().join("BatchSmash.csv");
        let output = td.path().join("Output");
        let mut table = BatchTable::new();
        table.insert(10023, vec![sample(10023, 1, "A1", 20.0)]);

        let params = params();
        let report = PoolingRun::new(&params).execute(Ledger::new(), &table).unwrap();
        assert!(report.unsat.is_empty());
        report.commit(&output, &ledger_path, "2021-03-01").unwrap();
        let text = fs::read_to_string(output.join("UNSAT 2021-03-01.csv")).unwrap();
        assert_eq!(text, "Position,Well,Sample Name,MS2 gene,N gene,ORF1ab,S gene,SourceBatch\n");
    }

    #[test]
    fn test_malformed_ledger_aborts_before_outputs() {
        let params = params();
        let mut entries = prior().entries().to_vec();
        entries[1].destination_slot = 9;
        let err = PoolingRun::new(&params)
            .execute(Ledger::from_entries(entries), &batches())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
    }

    #[test]
    fn test_batch_key_mismatch_is_malformed() {
        let params = params();
        let mut table = BatchTable::new();
        table.insert(10030, vec![sample(10031, 1, "X", 20.0)]);
        let err = PoolingRun::new(&params).execute(Ledger::new(), &table).unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
    }
}
