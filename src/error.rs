use crate::register_map::MeterField;
use std::time::Duration;
use thiserror::Error;

/// Invalid environment value or register map file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read register map {path}: {source}")]
    RegisterMapFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    RegisterMap(#[from] MapError),
}

/// A device register map that does not describe a readable window.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("slave id {0} is outside the valid bus range 1..=247")]
    InvalidSlaveId(u8),
    #[error("no devices configured")]
    NoDevices,
    #[error("slave id {0} is configured more than once")]
    DuplicateSlaveId(u8),
    #[error("slave {slave_id}: register window of {register_count} registers cannot hold a 32-bit value")]
    WindowTooSmall { slave_id: u8, register_count: u16 },
    #[error("slave {slave_id}: window starting at {start_address} with {register_count} registers exceeds the address space")]
    WindowOverflow {
        slave_id: u8,
        start_address: u16,
        register_count: u16,
    },
    #[error("slave {slave_id}: no fields configured")]
    NoFields { slave_id: u8 },
    #[error("slave {slave_id}: field {field} at offset {offset} does not fit in {register_count} registers")]
    OffsetOutOfWindow {
        slave_id: u8,
        field: MeterField,
        offset: u16,
        register_count: u16,
    },
    #[error("slave {slave_id}: fields {first} and {second} share offset {offset}; declare one as an alias")]
    ImplicitAlias {
        slave_id: u8,
        first: MeterField,
        second: MeterField,
        offset: u16,
    },
    #[error("slave {slave_id}: alias {alias} is also mapped as a field")]
    AliasShadowsField { slave_id: u8, alias: MeterField },
    #[error("slave {slave_id}: alias {alias} points at unmapped field {target}")]
    UnknownAliasTarget {
        slave_id: u8,
        alias: MeterField,
        target: MeterField,
    },
    #[error("invalid register map document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The bus link could not be opened.
#[derive(Debug, Error)]
#[error("failed to open {endpoint}: {reason}")]
pub struct ConnectionError {
    pub endpoint: String,
    pub reason: String,
}

/// A single framed read that did not produce registers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("link failure: {0}")]
    Link(String),
    #[error("bus is not connected")]
    NotConnected,
    #[error("modbus exception: {0}")]
    Exception(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Link-level failures invalidate the whole bus, not just one meter.
    pub fn is_link_level(&self) -> bool {
        matches!(self, TransportError::Link(_) | TransportError::NotConnected)
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cannot create database directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Rejected(String),
}
