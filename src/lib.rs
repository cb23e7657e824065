//! Energy Meter Gateway Library
//!
//! Polls a set of energy meters sharing one Modbus bus, stores every good
//! reading in SQLite and pushes live readings and link status to WebSocket
//! subscribers.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hub;
pub mod orchestrator;
pub mod poll;
pub mod register_codec;
pub mod register_map;
pub mod sample;
pub mod server;
pub mod sink;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types for easier access
pub use acquisition::{Acquisition, AcquisitionConfig, AcquisitionControl, AcquisitionHandle};
pub use config::AppConfig;
pub use hub::{BroadcastHub, HubEvent};
pub use register_codec::WordOrder;
pub use register_map::{DeviceRegisterMap, MeterField, RegisterMapRegistry};
pub use sample::Sample;
pub use sink::{PersistenceSink, SqliteSink};
pub use supervisor::{LinkState, LinkStatus};
pub use transport::{BusEndpoint, BusTransport, ModbusTransport};
