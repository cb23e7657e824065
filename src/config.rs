use crate::acquisition::AcquisitionConfig;
use crate::error::ConfigError;
use crate::poll::PollTiming;
use crate::register_codec::WordOrder;
use crate::register_map::RegisterMapRegistry;
use crate::transport::{BusEndpoint, DataBits, Parity, SerialSettings, StopBits};
use std::env;
use std::fmt::Display;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Process settings read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub endpoint: BusEndpoint,
    pub read_timeout: Duration,
    pub slave_ids: Vec<u8>,
    pub word_order: WordOrder,
    pub register_map_path: Option<PathBuf>,
    pub acquisition: AcquisitionConfig,
    pub http_port: u16,
    pub db_path: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or blank keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = get("MODBUS_PORT").unwrap_or_else(|| "/dev/ttyUSB0".to_string());
        let endpoint = match port.trim().strip_prefix("tcp://") {
            Some(address) => BusEndpoint::Tcp(resolve("MODBUS_PORT", address)?),
            None => BusEndpoint::Serial(SerialSettings {
                port: port.trim().to_string(),
                baud_rate: parse_or(&get, "MODBUS_BAUDRATE", 9600u32)?,
                data_bits: parse_or(&get, "MODBUS_DATABITS", DataBits::Eight)?,
                stop_bits: parse_or(&get, "MODBUS_STOPBITS", StopBits::One)?,
                parity: parse_or(&get, "MODBUS_PARITY", Parity::Even)?,
            }),
        };

        let slave_ids = match get("MODBUS_SLAVES") {
            Some(raw) => serde_json::from_str::<Vec<u8>>(&raw).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "MODBUS_SLAVES",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?,
            None => vec![5, 2],
        };

        let timing = PollTiming {
            inter_field_delay: millis_or(&get, "MODBUS_FIELD_DELAY", 100)?,
            inter_device_delay: millis_or(&get, "MODBUS_DEVICE_DELAY", 300)?,
        };
        let acquisition = AcquisitionConfig {
            poll_interval: positive_millis_or(&get, "READING_INTERVAL", 5000)?,
            timing,
            max_retries: parse_or(&get, "MODBUS_MAX_RETRIES", 5u32)?,
            retry_delay: millis_or(&get, "MODBUS_RETRY_DELAY", 10_000)?,
        };
        if acquisition.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MODBUS_MAX_RETRIES",
                value: "0".to_string(),
                reason: "at least one connect attempt is required".to_string(),
            });
        }

        Ok(Self {
            endpoint,
            read_timeout: positive_millis_or(&get, "MODBUS_TIMEOUT", 3000)?,
            slave_ids,
            word_order: parse_or(&get, "MODBUS_WORD_ORDER", WordOrder::BigEndianWords)?,
            register_map_path: get("MODBUS_REGISTER_MAP").map(PathBuf::from),
            acquisition,
            http_port: parse_or(&get, "PORT", 3000u16)?,
            db_path: get("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/energy.db")),
        })
    }

    /// Device maps from the configured file, or the built-in map per slave id.
    pub fn register_maps(&self) -> Result<RegisterMapRegistry, ConfigError> {
        match &self.register_map_path {
            Some(path) => {
                let document =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::RegisterMapFile {
                        path: path.display().to_string(),
                        source,
                    })?;
                Ok(RegisterMapRegistry::from_json(&document)?)
            }
            None => Ok(RegisterMapRegistry::from_slave_ids(
                &self.slave_ids,
                self.word_order,
            )?),
        }
    }

    pub fn log_summary(&self) {
        info!(endpoint = %self.endpoint, timeout_ms = self.read_timeout.as_millis() as u64, "Modbus bus");
        info!(
            slaves = ?self.slave_ids,
            word_order = %self.word_order,
            register_map = ?self.register_map_path,
            "Meters"
        );
        info!(
            interval_ms = self.acquisition.poll_interval.as_millis() as u64,
            max_retries = self.acquisition.max_retries,
            retry_delay_ms = self.acquisition.retry_delay.as_millis() as u64,
            "Acquisition"
        );
        info!(port = self.http_port, db = %self.db_path.display(), "Service");
    }
}

fn parse_or<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default).map(Duration::from_millis)
}

fn positive_millis_or<G>(get: &G, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value = millis_or(get, key, default)?;
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn resolve(key: &'static str, address: &str) -> Result<std::net::SocketAddr, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key,
        value: address.to_string(),
        reason,
    };
    address
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("address did not resolve".to_string()))
}
