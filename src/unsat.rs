use crate::config::PoolingParameters;
use crate::error::Result;
use crate::sample::{BatchId, SampleRecord};
use csv::WriterBuilder;
use std::collections::BTreeSet;
use std::io::Write;

/// A sample that did not qualify for pooling.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsatRecord {
    pub sample: SampleRecord,
    pub source_batch: BatchId,
}

/// Non-eligible samples of every batch, controls dropped. Batches are taken in
/// the order given; well order within a batch is preserved.
pub fn collect_unsat<'a, I>(rejected_by_batch: I, params: &PoolingParameters) -> Vec<UnsatRecord>
where
    I: IntoIterator<Item = (BatchId, &'a [SampleRecord])>,
{
    rejected_by_batch
        .into_iter()
        .flat_map(|(batch, samples)| {
            samples
                .iter()
                .filter(|s| !params.is_control(&s.sample_name))
                .map(move |s| UnsatRecord {
                    sample: s.clone(),
                    source_batch: batch,
                })
        })
        .collect()
}

/// Detector columns of the report: the required detectors plus every detector
/// read in the run, sorted. The layout does not depend on which samples failed.
pub fn unsat_detectors<'a, I>(samples: I, params: &PoolingParameters) -> Vec<String>
where
    I: IntoIterator<Item = &'a SampleRecord>,
{
    let mut detectors: BTreeSet<String> = params.required_detectors.iter().cloned().collect();
    for sample in samples {
        detectors.extend(sample.detector_values.keys().cloned());
    }
    detectors.into_iter().collect()
}

/// Writes `Position, Well, Sample Name, <detectors…>, SourceBatch`.
pub fn write_unsat_csv<W: Write>(
    records: &[UnsatRecord],
    detectors: &[String],
    writer: W,
) -> Result<()> {
    let mut wtr = WriterBuilder::new().from_writer(writer);
    let mut header = vec!["Position", "Well", "Sample Name"];
    header.extend(detectors.iter().map(String::as_str));
    header.push("SourceBatch");
    wtr.write_record(&header)?;

    for record in records {
        let sample = &record.sample;
        let mut row = vec![
            sample.position.to_string(),
            sample.well.to_string(),
            sample.sample_name.clone(),
        ];
        row.extend(detectors.iter().map(|d| {
            sample
                .ct(d)
                .map(|ct| ct.to_string())
                .unwrap_or_default()
        }));
        row.push(record.source_batch.to_string());
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{CtValue, Well};
    use std::collections::BTreeMap;

    fn sample(batch_id: BatchId, position: u32, name: &str) -> SampleRecord {
        let mut detector_values = BTreeMap::new();
        detector_values.insert("N gene".to_string(), CtValue::Detected(33.5));
        detector_values.insert("ORF1ab".to_string(), CtValue::Undetermined);
        SampleRecord {
            batch_id,
            position,
            well: Well { row: 'A', column: position },
            sample_name: name.to_string(),
            detector_values,
        }
    }

    #[test]
    fn test_controls_dropped_and_order_kept() {
        let params = PoolingParameters::default();
        let a = vec![sample(10023, 1, "PC"), sample(10023, 2, "S2"), sample(10023, 5, "S5")];
        let b = vec![sample(10024, 1, "S1"), sample(10024, 2, "NC")];
        let unsat = collect_unsat([(10023, a.as_slice()), (10024, b.as_slice())], &params);
        let got: Vec<(BatchId, &str)> = unsat
            .iter()
            .map(|r| (r.source_batch, r.sample.sample_name.as_str()))
            .collect();
        assert_eq!(got, vec![(10023, "S2"), (10023, "S5"), (10024, "S1")]);
    }

    #[test]
    fn test_unsat_csv() {
        let records = vec![UnsatRecord {
            sample: sample(10023, 3, "S3"),
            source_batch: 10023,
        }];
        let params = PoolingParameters::default();
        let detectors = unsat_detectors(records.iter().map(|r| &r.sample), &params);
        let mut out = vec![];
        write_unsat_csv(&records, &detectors, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Position,Well,Sample Name,N gene,ORF1ab,SourceBatch\n3,A3,S3,33.5,Undetermined,10023\n"
        );
    }

    #[test]
    fn test_empty_report_keeps_detector_columns() {
        let params = PoolingParameters::default();
        let passed = [sample(10023, 1, "S1")];
        let detectors = unsat_detectors(passed.iter(), &params);
        assert_eq!(detectors, vec!["N gene".to_string(), "ORF1ab".to_string()]);
        let mut out = vec![];
        write_unsat_csv(&[], &detectors, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Position,Well,Sample Name,N gene,ORF1ab,SourceBatch\n"
        );
        let none = unsat_detectors(std::iter::empty(), &params);
        assert_eq!(none, vec!["N gene".to_string(), "ORF1ab".to_string()]);
    }
}
