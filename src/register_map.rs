use crate::error::MapError;
use crate::register_codec::WordOrder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Measured quantities a meter exposes.
///
/// Declaration order is the read order within one device cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterField {
    Voltage,
    Current,
    ActivePower,
    ApparentPower,
    ReactivePower,
    PowerFactor,
    Frequency,
    ImportActiveEnergy,
    ExportActiveEnergy,
    ImportReactiveEnergy,
    ExportReactiveEnergy,
    EnergyTotal,
}

impl MeterField {
    pub const ALL: [MeterField; 12] = [
        MeterField::Voltage,
        MeterField::Current,
        MeterField::ActivePower,
        MeterField::ApparentPower,
        MeterField::ReactivePower,
        MeterField::PowerFactor,
        MeterField::Frequency,
        MeterField::ImportActiveEnergy,
        MeterField::ExportActiveEnergy,
        MeterField::ImportReactiveEnergy,
        MeterField::ExportReactiveEnergy,
        MeterField::EnergyTotal,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MeterField::Voltage => "voltage",
            MeterField::Current => "current",
            MeterField::ActivePower => "active_power",
            MeterField::ApparentPower => "apparent_power",
            MeterField::ReactivePower => "reactive_power",
            MeterField::PowerFactor => "power_factor",
            MeterField::Frequency => "frequency",
            MeterField::ImportActiveEnergy => "import_active_energy",
            MeterField::ExportActiveEnergy => "export_active_energy",
            MeterField::ImportReactiveEnergy => "import_reactive_energy",
            MeterField::ExportReactiveEnergy => "export_reactive_energy",
            MeterField::EnergyTotal => "energy_total",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            MeterField::Voltage => "V",
            MeterField::Current => "A",
            MeterField::ActivePower => "W",
            MeterField::ApparentPower => "VA",
            MeterField::ReactivePower => "var",
            MeterField::PowerFactor => "",
            MeterField::Frequency => "Hz",
            MeterField::ImportActiveEnergy
            | MeterField::ExportActiveEnergy
            | MeterField::EnergyTotal => "kWh",
            MeterField::ImportReactiveEnergy | MeterField::ExportReactiveEnergy => "kvarh",
        }
    }

    /// Decimal places kept after decoding.
    pub fn decimals(self) -> u32 {
        match self {
            MeterField::Voltage | MeterField::Frequency => 2,
            MeterField::Current | MeterField::PowerFactor => 3,
            MeterField::ActivePower | MeterField::ApparentPower | MeterField::ReactivePower => 1,
            MeterField::ImportActiveEnergy
            | MeterField::ExportActiveEnergy
            | MeterField::ImportReactiveEnergy
            | MeterField::ExportReactiveEnergy
            | MeterField::EnergyTotal => 4,
        }
    }

    /// Physically plausible bounds; anything outside is reported as an anomaly.
    pub fn sane_range(self) -> (f64, f64) {
        match self {
            MeterField::Voltage => (0.0, 1_000.0),
            MeterField::Current => (-10_000.0, 10_000.0),
            MeterField::ActivePower | MeterField::ApparentPower | MeterField::ReactivePower => {
                (-10_000_000.0, 10_000_000.0)
            }
            MeterField::PowerFactor => (-1.0, 1.0),
            MeterField::Frequency => (0.0, 100.0),
            MeterField::ImportActiveEnergy
            | MeterField::ExportActiveEnergy
            | MeterField::ImportReactiveEnergy
            | MeterField::ExportReactiveEnergy
            | MeterField::EnergyTotal => (0.0, f64::MAX),
        }
    }
}

impl fmt::Display for MeterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which Modbus table the meter exposes its measurements in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// Function code 0x04
    #[default]
    Input,
    /// Function code 0x03
    Holding,
}

/// Where each field of one meter lives inside its contiguous register window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegisterMap {
    pub slave_id: u8,
    #[serde(default)]
    pub device_id: String,
    pub start_address: u16,
    pub register_count: u16,
    #[serde(default)]
    pub word_order: WordOrder,
    #[serde(default)]
    pub register_kind: RegisterKind,
    /// Field to register offset relative to `start_address`.
    pub register_map: BTreeMap<MeterField, u16>,
    /// Fields that are reported with another field's value instead of being read.
    #[serde(default)]
    pub aliases: BTreeMap<MeterField, MeterField>,
}

impl DeviceRegisterMap {
    /// TEM015XP three-phase meter, input registers 30001..30044.
    pub fn tem015xp(slave_id: u8, word_order: WordOrder) -> Self {
        let register_map = BTreeMap::from([
            (MeterField::Voltage, 0),              // 30001
            (MeterField::Current, 3),              // 30004
            (MeterField::ActivePower, 6),          // 30007
            (MeterField::ApparentPower, 9),        // 30010
            (MeterField::ReactivePower, 12),       // 30013
            (MeterField::PowerFactor, 15),         // 30016
            (MeterField::Frequency, 18),           // 30019
            (MeterField::ImportActiveEnergy, 36),  // 30037
            (MeterField::ExportActiveEnergy, 38),  // 30039
            (MeterField::ImportReactiveEnergy, 40), // 30041
            (MeterField::ExportReactiveEnergy, 42), // 30043
        ]);
        Self {
            slave_id,
            device_id: default_device_id(slave_id),
            start_address: 0,
            register_count: 44,
            word_order,
            register_kind: RegisterKind::Input,
            register_map,
            aliases: BTreeMap::from([(MeterField::EnergyTotal, MeterField::ImportActiveEnergy)]),
        }
    }

    /// Absolute register address of a mapped field.
    pub fn address_of(&self, field: MeterField) -> Option<u16> {
        self.register_map
            .get(&field)
            .map(|offset| self.start_address.saturating_add(*offset))
    }

    /// One past the last register of the window.
    pub fn window_end(&self) -> u32 {
        u32::from(self.start_address) + u32::from(self.register_count)
    }

    /// Fields that are actually read from the bus, in read order.
    pub fn read_plan(&self) -> impl Iterator<Item = (MeterField, u16)> + '_ {
        self.register_map
            .iter()
            .map(|(field, offset)| (*field, self.start_address.saturating_add(*offset)))
    }

    pub fn validate(&self) -> Result<(), MapError> {
        let slave_id = self.slave_id;
        if !(1..=247).contains(&slave_id) {
            return Err(MapError::InvalidSlaveId(slave_id));
        }
        if self.register_count < 2 {
            return Err(MapError::WindowTooSmall {
                slave_id,
                register_count: self.register_count,
            });
        }
        if self.window_end() > u32::from(u16::MAX) + 1 {
            return Err(MapError::WindowOverflow {
                slave_id,
                start_address: self.start_address,
                register_count: self.register_count,
            });
        }
        if self.register_map.is_empty() {
            return Err(MapError::NoFields { slave_id });
        }

        let mut seen: BTreeMap<u16, MeterField> = BTreeMap::new();
        for (&field, &offset) in &self.register_map {
            if offset > self.register_count - 2 {
                return Err(MapError::OffsetOutOfWindow {
                    slave_id,
                    field,
                    offset,
                    register_count: self.register_count,
                });
            }
            if let Some(&first) = seen.get(&offset) {
                return Err(MapError::ImplicitAlias {
                    slave_id,
                    first,
                    second: field,
                    offset,
                });
            }
            seen.insert(offset, field);
        }

        for (&alias, &target) in &self.aliases {
            if self.register_map.contains_key(&alias) {
                return Err(MapError::AliasShadowsField { slave_id, alias });
            }
            if !self.register_map.contains_key(&target) {
                return Err(MapError::UnknownAliasTarget {
                    slave_id,
                    alias,
                    target,
                });
            }
        }
        Ok(())
    }
}

pub fn default_device_id(slave_id: u8) -> String {
    format!("TEM015XP_{slave_id}")
}

#[derive(Debug, Deserialize)]
struct RegisterMapDocument {
    devices: Vec<DeviceRegisterMap>,
}

/// Validated, immutable set of device maps in poll order.
#[derive(Debug, Clone)]
pub struct RegisterMapRegistry {
    devices: Vec<DeviceRegisterMap>,
}

impl RegisterMapRegistry {
    pub fn new(mut devices: Vec<DeviceRegisterMap>) -> Result<Self, MapError> {
        if devices.is_empty() {
            return Err(MapError::NoDevices);
        }
        let mut slave_ids = HashSet::new();
        for device in &mut devices {
            device.validate()?;
            if !slave_ids.insert(device.slave_id) {
                return Err(MapError::DuplicateSlaveId(device.slave_id));
            }
            if device.device_id.is_empty() {
                device.device_id = default_device_id(device.slave_id);
            }
        }
        Ok(Self { devices })
    }

    /// Built-in TEM015XP map for every slave id, polled in the given order.
    pub fn from_slave_ids(slave_ids: &[u8], word_order: WordOrder) -> Result<Self, MapError> {
        Self::new(
            slave_ids
                .iter()
                .map(|&slave_id| DeviceRegisterMap::tem015xp(slave_id, word_order))
                .collect(),
        )
    }

    /// Parses a `{"devices": [...]}` document.
    pub fn from_json(document: &str) -> Result<Self, MapError> {
        let document: RegisterMapDocument = serde_json::from_str(document)?;
        Self::new(document.devices)
    }

    pub fn get(&self, slave_id: u8) -> Option<&DeviceRegisterMap> {
        self.devices.iter().find(|d| d.slave_id == slave_id)
    }

    pub fn devices(&self) -> &[DeviceRegisterMap] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tem015xp_map_is_valid() {
        let map = DeviceRegisterMap::tem015xp(5, WordOrder::BigEndianWords);
        map.validate().unwrap();
        assert_eq!(map.device_id, "TEM015XP_5");
        assert_eq!(map.address_of(MeterField::ExportReactiveEnergy), Some(42));
        assert_eq!(map.address_of(MeterField::EnergyTotal), None);
        assert_eq!(map.read_plan().count(), 11);
        for (_, address) in map.read_plan() {
            assert!(u32::from(address) + 1 < map.window_end());
        }
    }

    #[test]
    fn test_offset_must_leave_room_for_second_register() {
        let mut map = DeviceRegisterMap::tem015xp(1, WordOrder::BigEndianWords);
        map.register_map.insert(MeterField::ExportReactiveEnergy, 43);
        assert!(matches!(
            map.validate(),
            Err(MapError::OffsetOutOfWindow { offset: 43, .. })
        ));
    }

    #[test]
    fn test_shared_offset_requires_explicit_alias() {
        let mut map = DeviceRegisterMap::tem015xp(1, WordOrder::BigEndianWords);
        map.aliases.clear();
        map.register_map.insert(MeterField::EnergyTotal, 36);
        assert!(matches!(
            map.validate(),
            Err(MapError::ImplicitAlias {
                first: MeterField::ImportActiveEnergy,
                second: MeterField::EnergyTotal,
                offset: 36,
                ..
            })
        ));
    }

    #[test]
    fn test_alias_rules() {
        let mut map = DeviceRegisterMap::tem015xp(1, WordOrder::BigEndianWords);
        map.aliases
            .insert(MeterField::Voltage, MeterField::Current);
        assert!(matches!(
            map.validate(),
            Err(MapError::AliasShadowsField {
                alias: MeterField::Voltage,
                ..
            })
        ));

        let mut map = DeviceRegisterMap::tem015xp(1, WordOrder::BigEndianWords);
        map.register_map.remove(&MeterField::ImportActiveEnergy);
        assert!(matches!(
            map.validate(),
            Err(MapError::UnknownAliasTarget { .. })
        ));
    }

    #[test]
    fn test_slave_id_bounds() {
        let map = DeviceRegisterMap::tem015xp(0, WordOrder::BigEndianWords);
        assert!(matches!(map.validate(), Err(MapError::InvalidSlaveId(0))));
        let map = DeviceRegisterMap::tem015xp(248, WordOrder::BigEndianWords);
        assert!(matches!(map.validate(), Err(MapError::InvalidSlaveId(248))));
    }

    #[test]
    fn test_registry_rejects_duplicate_slave_ids() {
        let result = RegisterMapRegistry::from_slave_ids(&[5, 2, 5], WordOrder::BigEndianWords);
        assert!(matches!(result, Err(MapError::DuplicateSlaveId(5))));
    }

    #[test]
    fn test_energy_fields_share_units() {
        assert_eq!(MeterField::EnergyTotal.unit(), MeterField::ImportActiveEnergy.unit());
        assert_eq!(MeterField::ExportReactiveEnergy.unit(), "kvarh");
        assert_eq!(MeterField::PowerFactor.unit(), "");
    }

    #[test]
    fn test_registry_requires_a_device() {
        let result = RegisterMapRegistry::from_slave_ids(&[], WordOrder::BigEndianWords);
        assert!(matches!(result, Err(MapError::NoDevices)));
        let result = RegisterMapRegistry::from_json(r#"{"devices": []}"#);
        assert!(matches!(result, Err(MapError::NoDevices)));
    }

    #[test]
    fn test_registry_keeps_configured_order() {
        let registry =
            RegisterMapRegistry::from_slave_ids(&[5, 2], WordOrder::WordSwapped).unwrap();
        let ids: Vec<u8> = registry.devices().iter().map(|d| d.slave_id).collect();
        assert_eq!(ids, vec![5, 2]);
        assert_eq!(registry.get(2).unwrap().word_order, WordOrder::WordSwapped);
        assert!(registry.get(7).is_none());
    }

    #[test]
    fn test_registry_from_json() {
        let registry = RegisterMapRegistry::from_json(
            r#"{
                "devices": [{
                    "slaveId": 3,
                    "startAddress": 100,
                    "registerCount": 8,
                    "wordOrder": "CDAB",
                    "registerKind": "holding",
                    "registerMap": { "voltage": 0, "current": 2, "import_active_energy": 6 },
                    "aliases": { "energy_total": "import_active_energy" }
                }]
            }"#,
        )
        .unwrap();
        let device = registry.get(3).unwrap();
        assert_eq!(device.device_id, "TEM015XP_3");
        assert_eq!(device.register_kind, RegisterKind::Holding);
        assert_eq!(device.word_order, WordOrder::WordSwapped);
        assert_eq!(device.address_of(MeterField::Current), Some(102));
    }

    #[test]
    fn test_registry_from_json_validates() {
        let result = RegisterMapRegistry::from_json(
            r#"{"devices": [{"slaveId": 3, "startAddress": 0, "registerCount": 4,
                "registerMap": {"voltage": 3}}]}"#,
        );
        assert!(matches!(result, Err(MapError::OffsetOutOfWindow { .. })));
    }
}
