use crate::register_codec::{decode_float32, round_to};
use crate::register_map::{DeviceRegisterMap, MeterField};
use crate::sample::{AnomalyKind, DecodeAnomaly, Sample};
use crate::transport::BusTransport;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Settle times meters need between consecutive requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub inter_field_delay: Duration,
    pub inter_device_delay: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            inter_field_delay: Duration::from_millis(100),
            inter_device_delay: Duration::from_millis(300),
        }
    }
}

impl PollTiming {
    pub fn immediate() -> Self {
        Self {
            inter_field_delay: Duration::ZERO,
            inter_device_delay: Duration::ZERO,
        }
    }
}

/// Reads every mapped field of one meter, one two-register request per field.
///
/// The first failed read ends the cycle with a failed sample.
pub async fn poll_device<B>(bus: &mut B, map: &DeviceRegisterMap, timing: &PollTiming) -> Sample
where
    B: BusTransport + ?Sized,
{
    let mut fields = BTreeMap::new();
    let mut anomalies = Vec::new();

    for (index, (field, address)) in map.read_plan().enumerate() {
        if index > 0 && !timing.inter_field_delay.is_zero() {
            sleep(timing.inter_field_delay).await;
        }
        let registers = match bus
            .read_register_block(map.slave_id, map.register_kind, address, 2)
            .await
        {
            Ok(registers) => registers,
            Err(e) => {
                warn!(slave_id = map.slave_id, field = %field, address, error = %e, "Field read failed");
                return Sample::failed(map, field, e);
            }
        };

        let raw = decode_float32(registers[0], registers[1], map.word_order);
        let raw_registers = [registers[0], registers[1]];
        if !raw.is_finite() {
            warn!(slave_id = map.slave_id, field = %field, ?raw_registers, "Decoded value is not finite");
            anomalies.push(DecodeAnomaly {
                field,
                kind: AnomalyKind::NotFinite,
                raw_registers,
            });
            continue;
        }

        let value = round_to(raw, field.decimals());
        let (low, high) = field.sane_range();
        if value < low || value > high {
            warn!(
                slave_id = map.slave_id,
                field = %field,
                value,
                unit = field.unit(),
                "Decoded value outside plausible range"
            );
            anomalies.push(DecodeAnomaly {
                field,
                kind: AnomalyKind::OutOfRange,
                raw_registers,
            });
        }
        fields.insert(field, value);
    }

    for (&alias, &target) in &map.aliases {
        if let Some(value) = fields.get(&target).copied() {
            fields.insert(alias, value);
        }
    }

    debug!(
        slave_id = map.slave_id,
        voltage = fields.get(&MeterField::Voltage),
        current = fields.get(&MeterField::Current),
        active_power = fields.get(&MeterField::ActivePower),
        "Device polled"
    );
    Sample::succeeded(map, fields, anomalies)
}
