use crate::config::PoolingParameters;
use crate::error::{PoolingError, Result};
use crate::sample::SampleRecord;

/// One batch split into pooling-eligible and rejected samples. Both halves
/// keep the input (physical plate) order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualifiedBatch {
    pub eligible: Vec<SampleRecord>,
    pub rejected: Vec<SampleRecord>,
}

pub fn is_eligible(sample: &SampleRecord, params: &PoolingParameters) -> bool {
    if params.is_control(&sample.sample_name) {
        return false;
    }
    params.required_detectors.iter().all(|detector| {
        sample
            .ct(detector)
            .map(|ct| ct.is_below(params.ct_cutoff))
            .unwrap_or(false)
    })
}

pub fn qualify_batch(
    samples: &[SampleRecord],
    params: &PoolingParameters,
) -> Result<QualifiedBatch> {
    let mut ret = QualifiedBatch::default();
    for sample in samples {
        if let Some(missing) = params
            .required_detectors
            .iter()
            .find(|d| !sample.detector_values.contains_key(d.as_str()))
        {
            return Err(PoolingError::malformed(format!(
                "Batch {} well {} has no '{missing}' column",
                sample.batch_id, sample.well
            )));
        }
        if is_eligible(sample, params) {
            ret.eligible.push(sample.clone());
        } else {
            ret.rejected.push(sample.clone());
        }
    }
    Ok(ret)
}
