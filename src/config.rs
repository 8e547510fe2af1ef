use crate::error::{ErrorCode, PoolingError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingParameters {
    /// Detector rows reported per physical well in an instrument export.
    pub num_detectors: usize,
    pub ct_cutoff: f64,
    /// Detectors that must all be detected below `ct_cutoff`.
    pub required_detectors: Vec<String>,
    pub control_names: Vec<String>,
    pub transfer_volume_ul: u32,
    /// First usable destination slot; slots below are reserved.
    pub slot_low: u32,
    /// Last usable destination slot; slots above are reserved.
    pub slot_high: u32,
    pub plate_prefix: String,
    pub first_plate_number: u32,
    pub destination_label: String,
    pub source_label_prefix: String,
    pub pcr_file_prefix: String,
}

impl Default for PoolingParameters {
    fn default() -> Self {
        Self {
            num_detectors: 4,
            ct_cutoff: 30.0,
            required_detectors: vec!["N gene".to_string(), "ORF1ab".to_string()],
            control_names: vec!["NC".to_string(), "PC".to_string()],
            transfer_volume_ul: 50,
            slot_low: 2,
            slot_high: 95,
            plate_prefix: "COVSEQ_".to_string(),
            first_plate_number: 1,
            destination_label: "Destination".to_string(),
            source_label_prefix: "Source".to_string(),
            pcr_file_prefix: "nCoV".to_string(),
        }
    }
}

impl PoolingParameters {
    pub fn capacity(&self) -> u32 {
        self.slot_high.saturating_sub(self.slot_low) + 1
    }

    pub fn is_control(&self, sample_name: &str) -> bool {
        self.control_names.iter().any(|c| c == sample_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_detectors == 0 {
            return Err(PoolingError::parameter("num_detectors must be >= 1"));
        }
        if !self.ct_cutoff.is_finite() || self.ct_cutoff <= 0.0 {
            return Err(PoolingError::parameter(format!(
                "ct_cutoff must be a positive number, got {}",
                self.ct_cutoff
            )));
        }
        if self.required_detectors.is_empty() {
            return Err(PoolingError::parameter(
                "required_detectors must name at least one detector",
            ));
        }
        if self.required_detectors.len() > self.num_detectors {
            return Err(PoolingError::parameter(format!(
                "{} required detectors but only {} detectors per well",
                self.required_detectors.len(),
                self.num_detectors
            )));
        }
        if self.slot_low == 0 || self.slot_high < self.slot_low {
            return Err(PoolingError::parameter(format!(
                "usable slot range {}..={} is empty or starts at 0",
                self.slot_low, self.slot_high
            )));
        }
        if self.plate_prefix.is_empty() {
            return Err(PoolingError::parameter("plate_prefix must not be empty"));
        }
        if self.plate_prefix.ends_with(|c: char| c.is_ascii_digit()) {
            return Err(PoolingError::parameter(
                "plate_prefix must not end in a digit",
            ));
        }
        Ok(())
    }

    pub fn load_from_path(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PoolingError::io(format!("Could not read parameter file '{path}': {e}"))
        })?;
        let params: Self = serde_json::from_str(&text).map_err(|e| {
            PoolingError::parameter(format!("Could not parse parameter JSON '{path}': {e}"))
        })?;
        params.validate()?;
        Ok(params)
    }

    /// Overrides a single option by name.
    pub fn set_parameter(&mut self, name: &str, value: &Value) -> Result<()> {
        let mut next = self.clone();
        match name {
            "num_detectors" => next.num_detectors = positive_u64(name, value)? as usize,
            "ct_cutoff" => {
                next.ct_cutoff = value.as_f64().ok_or_else(|| {
                    PoolingError::parameter("ct_cutoff requires a number")
                })?
            }
            "required_detectors" => next.required_detectors = string_list(name, value)?,
            "control_names" => next.control_names = string_list(name, value)?,
            "transfer_volume_ul" => next.transfer_volume_ul = narrow(name, value)?,
            "slot_low" => next.slot_low = narrow(name, value)?,
            "slot_high" => next.slot_high = narrow(name, value)?,
            "plate_prefix" => next.plate_prefix = string(name, value)?,
            "first_plate_number" => next.first_plate_number = narrow(name, value)?,
            "destination_label" => next.destination_label = string(name, value)?,
            "source_label_prefix" => next.source_label_prefix = string(name, value)?,
            "pcr_file_prefix" => next.pcr_file_prefix = string(name, value)?,
            _ => {
                return Err(PoolingError::new(
                    ErrorCode::InvalidParameter,
                    format!("Unknown parameter '{name}'"),
                ));
            }
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

fn positive_u64(name: &str, value: &Value) -> Result<u64> {
    match value.as_u64() {
        Some(v) if v > 0 => Ok(v),
        _ => Err(PoolingError::parameter(format!(
            "{name} requires a positive integer"
        ))),
    }
}

fn narrow(name: &str, value: &Value) -> Result<u32> {
    u32::try_from(positive_u64(name, value)?)
        .map_err(|_| PoolingError::parameter(format!("{name} is out of range")))
}

fn string(name: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PoolingError::parameter(format!("{name} requires a string")))
}

fn string_list(name: &str, value: &Value) -> Result<Vec<String>> {
    value
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| PoolingError::parameter(format!("{name} requires an array of strings")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_capacity() {
        let params = PoolingParameters::default();
        assert_eq!(params.capacity(), 94);
        assert!(params.validate().is_ok());
        assert!(params.is_control("NC"));
        assert!(!params.is_control("12345"));
    }

    #[test]
    fn test_set_parameter() {
        let mut params = PoolingParameters::default();
        params.set_parameter("ct_cutoff", &json!(35.5)).unwrap();
        params
            .set_parameter("required_detectors", &json!(["N gene"]))
            .unwrap();
        assert_eq!(params.ct_cutoff, 35.5);
        assert_eq!(params.required_detectors, vec!["N gene".to_string()]);
    }

    #[test]
    fn test_set_parameter_rejects_unknown_and_invalid() {
        let mut params = PoolingParameters::default();
        let err = params.set_parameter("wells", &json!(96)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
        assert!(params.set_parameter("slot_high", &json!(1)).is_err());
        assert_eq!(params.slot_high, 95);
        assert!(params.set_parameter("ct_cutoff", &json!("thirty")).is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let params: PoolingParameters = serde_json::from_str(r#"{"ct_cutoff": 28}"#).unwrap();
        assert_eq!(params.ct_cutoff, 28.0);
        assert_eq!(params.slot_low, 2);
        assert_eq!(params.transfer_volume_ul, 50);
    }
}
