use crate::error::TransportError;
use crate::register_map::{DeviceRegisterMap, MeterField};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Why a decoded value is suspicious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// NaN or infinite; the value is left out of the sample
    NotFinite,
    /// Finite but physically implausible; the value is kept
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeAnomaly {
    pub field: MeterField,
    pub kind: AnomalyKind,
    pub raw_registers: [u16; 2],
}

/// Result of polling one meter once.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub device_id: String,
    pub slave_id: u8,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(flatten)]
    pub fields: BTreeMap<MeterField, f64>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<DecodeAnomaly>,
    #[serde(skip)]
    pub failure: Option<TransportError>,
}

impl Sample {
    pub fn succeeded(
        map: &DeviceRegisterMap,
        fields: BTreeMap<MeterField, f64>,
        anomalies: Vec<DecodeAnomaly>,
    ) -> Self {
        Self {
            device_id: map.device_id.clone(),
            slave_id: map.slave_id,
            timestamp: Utc::now(),
            success: true,
            fields,
            error_message: None,
            anomalies,
            failure: None,
        }
    }

    pub fn failed(map: &DeviceRegisterMap, field: MeterField, error: TransportError) -> Self {
        Self {
            device_id: map.device_id.clone(),
            slave_id: map.slave_id,
            timestamp: Utc::now(),
            success: false,
            fields: BTreeMap::new(),
            error_message: Some(format!("reading {field}: {error}")),
            anomalies: Vec::new(),
            failure: Some(error),
        }
    }

    /// True when the failure means the bus itself is gone.
    pub fn is_link_failure(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(TransportError::is_link_level)
    }

    pub fn get(&self, field: MeterField) -> Option<f64> {
        self.fields.get(&field).copied()
    }
}
